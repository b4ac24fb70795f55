pub mod config;
pub mod error;
pub mod websocket;

pub use error::{AppError, ConnectionError};
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use websocket::{ConnectionRegistry, WebSocketServer};
