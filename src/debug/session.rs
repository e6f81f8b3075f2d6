//! Debug session - the protocol state machine over the REPL channel.
//!
//! A session owns two external processes: the target program and the
//! debugger attached to it. Each tick pulls at most one record from the
//! debugger channel and classifies it as an output line or an idle prompt,
//! then advances enum-tagged continuations. Exactly one line continuation
//! and one prompt continuation may be armed at a time; a slot is taken and
//! cleared before its handler runs, so a handler can freely arm its
//! successor (including itself) without re-entering.

use thiserror::Error;

use crate::channel::{ChannelError, ChannelReader, ProcessError, Transport};
use crate::log_sink::LogSink;

use super::callbacks::CallbackTable;
use super::commands::DebugCommand;
use super::inject::{CallInjection, InjectState};
use super::wire;

/// Configuration for a debug session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Command line for the target program (run visible, not redirected).
    pub target_command: String,
    /// Command line for the debugger REPL (run hidden, redirected);
    /// `{pid}` is replaced with the target's process id.
    pub debugger_command: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_command: "DummyProgram.exe".into(),
            debugger_command:
                r"C:\Program Files (x86)\Windows Kits\10\Debuggers\x64\cdb.exe -g -o -p {pid}"
                    .into(),
        }
    }
}

/// Session-level failures surfaced to the caller.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session is not active")]
    NotActive,

    #[error("Callback index {index} out of range ({len} registered)")]
    UnknownCallback { index: usize, len: usize },

    #[error("An injected call is already queued or in flight")]
    CallInFlight,

    #[error("Failed to launch session process: {0}")]
    Spawn(#[from] ProcessError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// A malformed REPL line aborted the current continuation chain.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Expected a register value, got {line:?}")]
    BadRegisterLine { line: String },

    #[error("Expected {expected} pointer values, got {got} in {line:?}")]
    ShortPointerDump {
        expected: u32,
        got: usize,
        line: String,
    },

    #[error("Prompt arrived before the register snapshot completed")]
    IncompleteSnapshot,
}

/// What to do with the next output line. Cleared before the handler runs.
#[derive(Debug)]
enum LineContinuation {
    /// Check the trap-site dump for the command signature.
    InspectTrap,
    /// SetCallbacks: first argument register carries the table address.
    ReadTableAddress,
    /// SetCallbacks: second argument register carries the entry count.
    ReadTableCount { address: u64 },
    /// SetCallbacks: the pointer-array dump of the table itself.
    ReadTableEntries { count: u32 },
    /// RegisterAltStack: the argument register carries the stack address.
    ReadAltStack,
    /// Injection: fold snapshot lines in until xmm15 has been seen.
    CollectSnapshot,
    /// Injection: parse the return register.
    ReadReturnValue,
}

/// What to do at the next idle prompt. Taken before the handler runs.
#[derive(Debug)]
enum PromptContinuation {
    /// Resume with trap handling suppressed.
    ResumeHandled,
    /// Nop polling trap: start a queued injected call, or just resume.
    ServiceNop,
    /// Unidentified break: dump a stack trace and continue unhandled.
    RecoverFromBreak,
    /// SetCallbacks: ask for the two argument registers.
    ReadCallbackArgs,
    /// SetCallbacks: dump the table memory.
    DumpTable { address: u64, count: u32 },
    /// RegisterAltStack: ask for the argument register.
    ReadAltStackArg,
    /// Injection: the in-flight call owns this prompt.
    AdvanceInjection,
}

/// A live debugging session over a REPL transport.
pub struct DebugSession<T: Transport = ChannelReader> {
    config: SessionConfig,
    target: T,
    debugger: T,
    log: LogSink,
    active: bool,
    awaiting_first_prompt: bool,
    alt_stack: Option<u64>,
    line_continuation: Option<LineContinuation>,
    prompt_continuation: Option<PromptContinuation>,
    callbacks: CallbackTable,
    injection: Option<CallInjection>,
    pending_call: Option<(u64, [u64; 3])>,
}

impl DebugSession {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_transports(config, ChannelReader::new(), ChannelReader::new())
    }
}

impl<T: Transport> DebugSession<T> {
    /// Build a session over caller-supplied transports (scripted endpoints
    /// in tests).
    pub fn with_transports(config: SessionConfig, target: T, debugger: T) -> Self {
        Self {
            config,
            target,
            debugger,
            log: LogSink::new(),
            active: false,
            awaiting_first_prompt: true,
            alt_stack: None,
            line_continuation: None,
            prompt_continuation: None,
            callbacks: CallbackTable::new(),
            injection: None,
            pending_call: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn callbacks(&self) -> &CallbackTable {
        &self.callbacks
    }

    pub fn alt_stack(&self) -> Option<u64> {
        self.alt_stack
    }

    /// Clonable handle for an external log poller.
    pub fn log_handle(&self) -> LogSink {
        self.log.clone()
    }

    /// Everything appended to the transcript since the previous drain.
    pub fn drain_log(&self) -> String {
        self.log.drain_all()
    }

    /// Launch the target and attach the debugger to it.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.active {
            return Ok(());
        }
        self.reset();

        self.target.start(&self.config.target_command, false, true)?;
        let pid = self.target.process_id().unwrap_or(0);

        let debugger_command = self
            .config
            .debugger_command
            .replace("{pid}", &pid.to_string());
        if let Err(e) = self.debugger.start(&debugger_command, true, false) {
            self.target.stop();
            return Err(e.into());
        }

        self.active = true;
        log::info!("Session started (target pid {})", pid);
        Ok(())
    }

    /// Stop both processes and reset all per-session state. The session is
    /// reusable for a fresh `start`.
    pub fn stop(&mut self) {
        self.debugger.stop();
        self.target.stop();
        self.reset();
        log::info!("Session stopped");
    }

    fn reset(&mut self) {
        self.active = false;
        self.awaiting_first_prompt = true;
        self.alt_stack = None;
        self.line_continuation = None;
        self.prompt_continuation = None;
        self.callbacks.clear();
        self.injection = None;
        self.pending_call = None;
    }

    /// Queue an injected call to callback `index` with up to three integer
    /// arguments. The call is serviced at the target's next polling trap;
    /// its return value is reported through the transcript. Only one call
    /// may be queued or in flight at a time.
    pub fn invoke_callback(&mut self, index: usize, args: [u64; 3]) -> Result<(), SessionError> {
        if !self.active {
            return Err(SessionError::NotActive);
        }
        if self.injection.is_some() || self.pending_call.is_some() {
            return Err(SessionError::CallInFlight);
        }
        let address = self
            .callbacks
            .get(index)
            .ok_or(SessionError::UnknownCallback {
                index,
                len: self.callbacks.len(),
            })?;
        self.pending_call = Some((address, args));
        Ok(())
    }

    /// One scheduler tick: pull at most one record from the debugger
    /// channel and advance the protocol.
    pub fn tick(&mut self) -> Result<(), SessionError> {
        if !self.active {
            return Ok(());
        }

        let record = match self.debugger.read_record(wire::stop_patterns()) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(()),
            Err(ChannelError::Disconnected) => {
                // First-class exit event: the debugger's output pipe is
                // gone, so the conversation is over.
                self.log.message("The application has exited!\n");
                log::info!("Debugger channel closed; stopping session");
                self.stop();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // Echo everything we read into the transcript.
        self.log.append(&record.text);

        if let Some(cont) = self.line_continuation.take() {
            if let Err(e) = self.on_line(cont, &record.text) {
                self.abort_chain(e);
            }
            return Ok(());
        }

        if record.pattern == wire::PATTERN_PROMPT {
            if self.awaiting_first_prompt {
                // The attach prompt: just set the target running.
                self.awaiting_first_prompt = false;
                self.write_command(wire::CMD_GO);
            } else if let Some(cont) = self.prompt_continuation.take() {
                if let Err(e) = self.on_prompt(cont) {
                    self.abort_chain(e);
                }
            } else {
                self.on_unexpected_stop();
            }
        }

        Ok(())
    }

    /// Write to the REPL and echo the command into the transcript.
    fn write_command(&mut self, command: &str) {
        if self.debugger.write(command) {
            self.log.append(command);
        }
    }

    /// A malformed line aborted the current conversation: drop all armed
    /// continuations and any in-flight call, then resume the target.
    fn abort_chain(&mut self, err: ProtocolError) {
        log::error!("Protocol error: {}", err);
        self.log.message(&format!("Protocol error: {}\n", err));
        self.line_continuation = None;
        self.prompt_continuation = None;
        self.injection = None;
        self.write_command(wire::CMD_GO_HANDLED);
    }

    /// Default prompt handler: inspect the trap site to see whether the
    /// target is signaling a debug command.
    fn on_unexpected_stop(&mut self) {
        self.line_continuation = Some(LineContinuation::InspectTrap);
        self.write_command(wire::CMD_DUMP_TRAP_SITE);
    }

    fn on_line(&mut self, cont: LineContinuation, line: &str) -> Result<(), ProtocolError> {
        match cont {
            LineContinuation::InspectTrap => {
                self.inspect_trap(line);
                Ok(())
            }
            LineContinuation::ReadTableAddress => self.read_table_address(line),
            LineContinuation::ReadTableCount { address } => self.read_table_count(address, line),
            LineContinuation::ReadTableEntries { count } => self.read_table_entries(count, line),
            LineContinuation::ReadAltStack => self.read_alt_stack(line),
            LineContinuation::CollectSnapshot => {
                self.collect_snapshot(line);
                Ok(())
            }
            LineContinuation::ReadReturnValue => self.read_return_value(line),
        }
    }

    fn on_prompt(&mut self, cont: PromptContinuation) -> Result<(), ProtocolError> {
        match cont {
            PromptContinuation::ResumeHandled => {
                self.write_command(wire::CMD_GO_HANDLED);
                Ok(())
            }
            PromptContinuation::ServiceNop => {
                if let Some((address, args)) = self.pending_call.take() {
                    self.begin_injection(address, args);
                } else {
                    self.write_command(wire::CMD_GO_HANDLED);
                    self.log.message("Processed a nop!\n");
                }
                Ok(())
            }
            PromptContinuation::RecoverFromBreak => {
                // Show where the target stopped and let the break go
                // unhandled; if the target dies, the channel reports the
                // disconnect on a later tick.
                self.write_command(wire::CMD_STACK_TRACE);
                Ok(())
            }
            PromptContinuation::ReadCallbackArgs => {
                self.line_continuation = Some(LineContinuation::ReadTableAddress);
                self.write_command(wire::CMD_READ_ARG_REGISTERS);
                Ok(())
            }
            PromptContinuation::DumpTable { address, count } => {
                self.line_continuation = Some(LineContinuation::ReadTableEntries { count });
                self.write_command(&wire::dump_qwords_command(address, count));
                Ok(())
            }
            PromptContinuation::ReadAltStackArg => {
                self.line_continuation = Some(LineContinuation::ReadAltStack);
                self.write_command(wire::CMD_READ_FIRST_ARG);
                Ok(())
            }
            PromptContinuation::AdvanceInjection => self.advance_injection(),
        }
    }

    /// Decide whether the stop is a synthetic command trap or a genuine
    /// break, and arm the matching prompt handler.
    fn inspect_trap(&mut self, line: &str) {
        let Some(opcode) = wire::parse_trap_signature(line) else {
            self.prompt_continuation = Some(PromptContinuation::RecoverFromBreak);
            return;
        };

        match DebugCommand::from_opcode(opcode) {
            Some(DebugCommand::Nop) => {
                self.prompt_continuation = Some(PromptContinuation::ServiceNop);
            }
            Some(DebugCommand::SetCallbacks) => {
                self.prompt_continuation = Some(PromptContinuation::ReadCallbackArgs);
            }
            Some(DebugCommand::RegisterAltStack) => {
                self.prompt_continuation = Some(PromptContinuation::ReadAltStackArg);
            }
            None => {
                log::warn!("Unknown debug command opcode {:#04x}; skipping", opcode);
                self.log
                    .message(&format!("Ignoring unknown debug command {:#04x}!\n", opcode));
                self.prompt_continuation = Some(PromptContinuation::ResumeHandled);
            }
        }
    }

    fn read_table_address(&mut self, line: &str) -> Result<(), ProtocolError> {
        let address = wire::parse_register_field(line, "rcx").ok_or_else(|| {
            ProtocolError::BadRegisterLine {
                line: line.trim_end().into(),
            }
        })?;
        self.line_continuation = Some(LineContinuation::ReadTableCount { address });
        Ok(())
    }

    fn read_table_count(&mut self, address: u64, line: &str) -> Result<(), ProtocolError> {
        let count = wire::parse_register_field(line, "rdx").ok_or_else(|| {
            ProtocolError::BadRegisterLine {
                line: line.trim_end().into(),
            }
        })? as u32;

        if count == 0 {
            self.log
                .message("Error setting callbacks! Count value is zero!\n");
            self.prompt_continuation = Some(PromptContinuation::ResumeHandled);
            return Ok(());
        }

        self.prompt_continuation = Some(PromptContinuation::DumpTable { address, count });
        Ok(())
    }

    fn read_table_entries(&mut self, count: u32, line: &str) -> Result<(), ProtocolError> {
        let mut values = wire::parse_qword_values(line);
        if values.len() < count as usize {
            return Err(ProtocolError::ShortPointerDump {
                expected: count,
                got: values.len(),
                line: line.trim_end().into(),
            });
        }
        values.truncate(count as usize);

        self.callbacks.replace(values, count);
        self.log.message("Callbacks have been set!\n");
        self.prompt_continuation = Some(PromptContinuation::ResumeHandled);
        Ok(())
    }

    fn read_alt_stack(&mut self, line: &str) -> Result<(), ProtocolError> {
        let address = wire::parse_register_field(line, "rcx").ok_or_else(|| {
            ProtocolError::BadRegisterLine {
                line: line.trim_end().into(),
            }
        })?;
        self.alt_stack = Some(address);
        self.log
            .message("The alternate stack location has been set!\n");
        self.prompt_continuation = Some(PromptContinuation::ResumeHandled);
        Ok(())
    }

    /// Begin the injected-call round trip: capture the full register
    /// context first.
    fn begin_injection(&mut self, address: u64, args: [u64; 3]) {
        self.log
            .message(&format!("Invoking callback at {:#x}!\n", address));
        self.injection = Some(CallInjection::new(address, args));
        self.line_continuation = Some(LineContinuation::CollectSnapshot);
        self.prompt_continuation = Some(PromptContinuation::AdvanceInjection);
        self.write_command(&wire::snapshot_command());
    }

    fn collect_snapshot(&mut self, line: &str) {
        let state = match self.injection.as_mut() {
            Some(injection) => {
                injection.absorb_snapshot_line(line);
                injection.state
            }
            None => return,
        };
        // Stay armed until the vector sweep finishes; the prompt that
        // follows xmm15 belongs to the injection's prompt continuation.
        if matches!(
            state,
            InjectState::SnapshottingScalars | InjectState::SnapshottingVectors
        ) {
            self.line_continuation = Some(LineContinuation::CollectSnapshot);
        }
    }

    fn read_return_value(&mut self, line: &str) -> Result<(), ProtocolError> {
        let value = wire::parse_register_field(line, "rax").ok_or_else(|| {
            ProtocolError::BadRegisterLine {
                line: line.trim_end().into(),
            }
        })?;
        if let Some(injection) = self.injection.as_mut() {
            injection.return_value = value;
        }
        Ok(())
    }

    /// Drive the in-flight call forward at a prompt.
    fn advance_injection(&mut self) -> Result<(), ProtocolError> {
        let Some(mut injection) = self.injection.take() else {
            return Ok(());
        };

        match injection.state {
            InjectState::Computing => {
                let command = injection.launch_command(self.alt_stack);
                injection.state = InjectState::AwaitingCompletionTrap;
                self.injection = Some(injection);
                self.prompt_continuation = Some(PromptContinuation::AdvanceInjection);
                self.write_command(&command);
            }
            InjectState::AwaitingCompletionTrap => {
                // The sentinel return address re-trapped; read the result.
                injection.state = InjectState::ReadingReturn;
                self.injection = Some(injection);
                self.line_continuation = Some(LineContinuation::ReadReturnValue);
                self.prompt_continuation = Some(PromptContinuation::AdvanceInjection);
                self.write_command(wire::CMD_READ_RETURN);
            }
            InjectState::ReadingReturn => {
                // Return value parsed; put the volatile context back.
                let command = injection.restore_command();
                injection.state = InjectState::Restoring;
                self.injection = Some(injection);
                self.prompt_continuation = Some(PromptContinuation::AdvanceInjection);
                self.write_command(&command);
            }
            InjectState::Restoring => {
                injection.state = InjectState::Done;
                self.log.message(&format!(
                    "Callback returned {:#x}!\n",
                    injection.return_value
                ));
                // The slot is free again; the injection is dropped here.
                self.write_command(wire::CMD_GO_HANDLED);
            }
            InjectState::SnapshottingScalars | InjectState::SnapshottingVectors => {
                // The REPL produced a prompt before the snapshot finished.
                return Err(ProtocolError::IncompleteSnapshot);
            }
            InjectState::Done => {}
        }

        Ok(())
    }
}
