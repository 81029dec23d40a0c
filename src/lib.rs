pub mod config;
pub mod context;
pub mod credentials;
pub mod dispatch;
pub mod errors;
pub mod models;
pub mod providers;
pub mod relay;
pub mod server;
pub mod storage;

// Re-export commonly used types for easier access
pub use config::{Config, load_config};
pub use dispatch::{ChatDispatcher, DispatchRequest};
pub use errors::{ChatError, ChatResult};
pub use models::{DEFAULT_MODEL, ModelRegistry, Provider};
pub use server::{AppState, start_server};
