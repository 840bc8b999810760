use std::{collections::HashSet, sync::Arc, time::Duration};

use futures_util::StreamExt;

use gatekeeper::{
    gate::types::{ChatMessage, ChatRole},
    inference::{
        credentials::CredentialPool,
        dispatcher::{DispatchFragment, Dispatcher, MAX_ATTEMPTS},
        error::InferenceErrorKind,
        types::{DispatcherConfig, InferenceConfig},
    },
};

use crate::{ScriptedClient, Step, conversation};

const MARKER: &str = "[[TEST-MARKER]]";

fn dispatcher(pool: Arc<CredentialPool>, client: Arc<ScriptedClient>) -> Dispatcher {
    Dispatcher::new(
        pool,
        client,
        &InferenceConfig::default(),
        DispatcherConfig::default(),
        MARKER,
    )
}

fn pool_of(size: usize) -> Arc<CredentialPool> {
    Arc::new(CredentialPool::new((0..size).map(|i| format!("key-{i}"))))
}

#[tokio::test(start_paused = true)]
async fn given_two_rate_limited_credentials_when_dispatching_then_third_credential_serves_the_reply()
{
    let pool = pool_of(3);
    let client = ScriptedClient::new(
        vec![
            Step::FailOpen(InferenceErrorKind::RateLimited),
            Step::FailOpen(InferenceErrorKind::RateLimited),
        ],
        Step::Reply(vec!["Bore", "d."]),
    );
    let dispatcher = dispatcher(Arc::clone(&pool), Arc::clone(&client));

    let fragments: Vec<_> = dispatcher.dispatch(&conversation(3)).collect().await;

    assert_eq!(
        fragments,
        vec![
            DispatchFragment::Text("Bore".to_string()),
            DispatchFragment::Text("d.".to_string()),
        ]
    );
    assert_eq!(client.calls(), 3);
    let distinct: HashSet<_> = client.seen_secrets().into_iter().collect();
    assert_eq!(distinct.len(), 3, "each attempt should use a different credential");
    assert_eq!(pool.snapshot().await.cooling, 2);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(pool.snapshot().await.cooling, 0);
}

#[tokio::test(start_paused = true)]
async fn given_large_pool_failing_everywhere_when_dispatching_then_attempts_stop_at_the_bound() {
    let pool = pool_of(25);
    let client = ScriptedClient::new(vec![], Step::FailOpen(InferenceErrorKind::Other));
    let dispatcher = dispatcher(Arc::clone(&pool), Arc::clone(&client));

    let fragments: Vec<_> = dispatcher.dispatch(&conversation(1)).collect().await;

    assert_eq!(client.calls(), MAX_ATTEMPTS as usize);
    assert_eq!(
        fragments,
        vec![DispatchFragment::Exhausted(
            DispatcherConfig::default().fallback_message
        )]
    );
    assert_eq!(pool.snapshot().await.cooling, MAX_ATTEMPTS as usize);
}

#[tokio::test(start_paused = true)]
async fn given_single_credential_failing_when_dispatching_then_pool_exhaustion_ends_the_loop_fast()
{
    let pool = pool_of(1);
    let client = ScriptedClient::new(vec![], Step::FailOpen(InferenceErrorKind::Unauthorized));
    let dispatcher = dispatcher(Arc::clone(&pool), Arc::clone(&client));

    let fragments: Vec<_> = dispatcher.dispatch(&conversation(1)).collect().await;

    assert_eq!(client.calls(), 1);
    assert!(matches!(
        fragments.as_slice(),
        [DispatchFragment::Exhausted(_)]
    ));
}

#[tokio::test(start_paused = true)]
async fn given_failure_after_output_when_dispatching_then_partial_text_stays_and_next_credential_continues()
 {
    let pool = pool_of(2);
    let client = ScriptedClient::new(
        vec![Step::FailAfter(vec!["Half a "], InferenceErrorKind::Transport)],
        Step::Reply(vec!["fresh reply"]),
    );
    let dispatcher = dispatcher(Arc::clone(&pool), Arc::clone(&client));

    let fragments: Vec<_> = dispatcher.dispatch(&conversation(1)).collect().await;

    assert_eq!(
        fragments,
        vec![
            DispatchFragment::Text("Half a ".to_string()),
            DispatchFragment::Text("fresh reply".to_string()),
        ]
    );
    assert_eq!(client.calls(), 2);
    assert_eq!(pool.snapshot().await.cooling, 1);
}

#[tokio::test(start_paused = true)]
async fn given_dispatch_stream_never_polled_when_dropped_then_no_call_is_made() {
    let pool = pool_of(1);
    let client = ScriptedClient::new(vec![], Step::Reply(vec!["unused"]));
    let dispatcher = dispatcher(pool, Arc::clone(&client));

    let stream = dispatcher.dispatch(&conversation(1));
    drop(stream);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(client.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn given_caller_disconnect_mid_stream_when_attempt_later_fails_then_no_failure_is_recorded() {
    let pool = pool_of(1);
    let client = ScriptedClient::new(vec![], Step::StallThenFail(Duration::from_secs(5)));
    let dispatcher = dispatcher(Arc::clone(&pool), Arc::clone(&client));

    let mut stream = dispatcher.dispatch(&conversation(1));
    let pending = tokio::time::timeout(Duration::from_secs(1), stream.next()).await;
    assert!(pending.is_err(), "the stalled attempt should not yield yet");
    drop(stream);

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(client.calls(), 1);
    assert_eq!(pool.snapshot().await.cooling, 0);
}

#[tokio::test]
async fn given_empty_pool_when_assistant_already_dormant_then_fallback_keeps_snoring() {
    let pool = pool_of(0);
    let client = ScriptedClient::new(vec![], Step::Reply(vec!["unused"]));
    let config = DispatcherConfig::default();
    let dispatcher = dispatcher(pool, Arc::clone(&client));

    let fresh: Vec<_> = dispatcher.dispatch(&conversation(1)).collect().await;
    assert_eq!(
        fresh,
        vec![DispatchFragment::Exhausted(config.fallback_message.clone())]
    );

    let dormant = vec![
        ChatMessage::user("hello?"),
        ChatMessage::assistant(config.fallback_message.clone()),
        ChatMessage::user("wake up"),
    ];
    let snoring: Vec<_> = dispatcher.dispatch(&dormant).collect().await;
    let [DispatchFragment::Exhausted(noise)] = snoring.as_slice() else {
        panic!("expected a single exhausted fragment, got {snoring:?}");
    };
    assert!(config.dormant_noises.contains(noise));
    assert_eq!(client.calls(), 0);
}

#[tokio::test]
async fn given_conversation_when_dispatching_then_system_prompt_carries_marker_and_mode() {
    let pool = pool_of(1);
    let client = ScriptedClient::new(vec![], Step::Reply(vec!["ok"]));
    let dispatcher = dispatcher(pool, Arc::clone(&client));

    let mut input = vec![ChatMessage::system("caller supplied prompt")];
    input.extend(conversation(2));
    let _: Vec<_> = dispatcher.dispatch(&input).collect().await;

    let sent = client.seen_messages();
    let messages = &sent[0];
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].role, ChatRole::System);
    assert!(messages[0].content.contains(MARKER));
    assert!(messages[0].content.contains("\nCURRENT MODE: "));
    assert!(!messages[0].content.contains("{{MARKER}}"));
    assert!(
        messages[1..]
            .iter()
            .all(|message| message.role != ChatRole::System)
    );
}
