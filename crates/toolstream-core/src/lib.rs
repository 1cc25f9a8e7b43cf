pub mod compression;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod handlers;
pub mod lifecycle;
pub mod repair;
pub mod retry;
pub mod storage;
pub mod stream_runner;

pub use compression::*;
pub use config::*;
pub use error::*;
pub use event_bus::*;
pub use handlers::*;
pub use lifecycle::*;
pub use repair::*;
pub use retry::*;
pub use storage::*;
pub use stream_runner::*;
