//! Marionette - remote-control call injection over a debugger REPL.
//!
//! Drives an external console debugger attached to a live target process.
//! The target volunteers "debug commands" by trapping on planted int3/jmp
//! stubs; this crate decodes those traps through the debugger's text REPL
//! and, on request, synthesizes a genuine function call inside the target
//! by rewriting its saved registers and resuming.

pub mod channel;
pub mod debug;
pub mod log_sink;
