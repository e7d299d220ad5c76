//! rasvn server library: session handling and configuration for the
//! `rasvn-server` binary.

pub mod config;
pub mod session;

pub use config::Config;
pub use session::{run_session, session_command_table, SessionCtx};
