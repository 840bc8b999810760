use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, sync::oneshot};

use gatekeeper::{
    cli::config_path_from_args,
    config::Config,
    gate::{kill_switch::KillSwitch, profile::build_profile_store, session_gate::SessionGate},
    inference::{
        credentials::CredentialPool, dispatcher::Dispatcher,
        openai_compatible::OpenAiCompatibleClient,
    },
    logging::init_tracing,
    server::{self, AppState},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path_from_args()?;
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let logging_guard = init_tracing(&config.logging)?;

    let pool = Arc::new(CredentialPool::from_env(&config.credentials));
    if pool.count() == 0 {
        tracing::warn!(
            target: "main",
            list_env = %config.credentials.list_env,
            single_env = %config.credentials.single_env,
            "no_inference_credentials_configured"
        );
    }

    let dispatcher = Dispatcher::new(
        pool,
        Arc::new(OpenAiCompatibleClient::new(config.inference.endpoint.clone())),
        &config.inference,
        config.dispatcher.clone(),
        &config.gate.sentinel_marker,
    );
    let gate = Arc::new(SessionGate::new(
        config.gate.clone(),
        dispatcher,
        Arc::new(KillSwitch::new(config.gate.kill_switch_enabled)),
        build_profile_store(&config.profile_store),
    ));

    let admin_secret = config.admin.secret_from_env();
    if admin_secret.is_none() {
        tracing::warn!(
            target: "main",
            secret_env = %config.admin.secret_env,
            "admin_routes_disabled"
        );
    }
    let state = AppState::new(gate, admin_secret, config.server.allowed_origins.clone());

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("unable to bind {}", config.server.listen_addr))?;

    let (stopped_tx, stopped_rx) = oneshot::channel();
    let shutdown = async move {
        let _ = stopped_rx.await;
    };
    let server_task = tokio::spawn(server::serve(listener, state, shutdown));

    let signal_name = server::shutdown_signal().await?;
    tracing::info!(
        target: "main",
        run_id = logging_guard.run_id(),
        signal = signal_name,
        "shutdown_requested"
    );
    let _ = stopped_tx.send(());
    server_task.await.context("server task join failed")??;

    eprintln!("gatekeeper stopped: received {signal_name}");
    Ok(())
}
