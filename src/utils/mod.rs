pub mod config;
pub mod disk;
pub mod logging;
pub mod session_log;

pub use config::{Config, Module, TransferOptions};
pub use session_log::SessionLog;
