mod entry;
mod event;
mod message;
mod provider;
mod tool;

pub use entry::*;
pub use event::*;
pub use message::*;
pub use provider::*;
pub use tool::*;
