pub mod admission;
pub mod api;
pub mod config;
pub mod daemon;
pub mod error;
pub mod manager;
pub mod snapshot;
pub mod store;
pub mod tls;
pub mod workspace;

pub use error::{Code, DaemonError, WsError};
pub use manager::{Manager, WorkspaceStatusEvent};
