//! Answers dial-up calls on modem lines and hands each caller to a session
//! handler.

pub mod config;
pub mod handler;
pub mod line;
pub mod modem;
pub mod switchboard;
mod types;

pub use handler::SessionHandler;
pub use line::{Line, LineError, Session};
pub use modem::Modem;
pub use switchboard::{RetryPolicy, Switchboard};
pub use types::{InvalidLineId, LineId, LineIdRef, Phase};
