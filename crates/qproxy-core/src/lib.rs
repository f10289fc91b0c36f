pub mod auth;
pub mod error;
pub mod execute;
pub mod headers;
pub mod qwen;
pub mod scheduler;
pub mod state;
pub mod upstream_client;

pub use error::ProxyError;
pub use execute::{Orchestrator, ProxyResponse, StreamBody};
pub use state::AppState;
