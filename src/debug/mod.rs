//! Debug module - the REPL protocol state machine and its data model.
//!
//! Layered over the channel reader:
//! - session: tick-driven continuation interpreter for the REPL protocol
//! - inject: the injected-call suspended task
//! - wire: REPL command/output text formats
//! - registers, callbacks, commands: typed session data

pub mod callbacks;
pub mod commands;
pub mod inject;
pub mod registers;
pub mod session;
pub mod wire;

pub use callbacks::CallbackTable;
pub use commands::DebugCommand;
pub use inject::{CallInjection, InjectState};
pub use registers::RegisterContext;
pub use session::{DebugSession, ProtocolError, SessionConfig, SessionError};
