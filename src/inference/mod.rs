pub mod client;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod openai_compatible;
pub mod telemetry;
pub mod types;
