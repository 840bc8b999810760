pub mod detector;
pub mod kill_switch;
pub mod profile;
pub mod session;
pub mod session_gate;
pub mod types;
