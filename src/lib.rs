// For integration tests only, gatekeeper ships as a binary
pub mod cli;
pub mod config;
pub mod gate;
pub mod inference;
pub mod logging;
pub mod server;
