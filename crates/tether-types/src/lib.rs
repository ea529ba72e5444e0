pub mod context;
pub mod event;
pub mod message;
pub mod session;
pub mod state;

pub use context::*;
pub use event::*;
pub use message::*;
pub use session::*;
pub use state::*;
