//! Child process plumbing for the channel reader.
//!
//! Spawns the external process with optionally redirected stdio and exposes
//! a non-blocking read over its output pipe. Availability is checked before
//! every read so the caller's tick never stalls waiting for output.
//! Windows peeks the pipe (PeekNamedPipe), Linux puts the read end in
//! O_NONBLOCK mode.

use std::io::Write;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use thiserror::Error;

/// Errors from spawning or talking to the external process.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Empty launch command")]
    EmptyCommand,

    #[error("Failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Output pipe closed (process exited)")]
    Disconnected,

    #[error("Pipe read failed: {0}")]
    ReadFailed(String),
}

/// A spawned external process with optional stdio redirection.
///
/// A stopped instance is identical to an unstarted one: `start` works
/// again after `stop`.
#[derive(Default)]
pub struct ChildProcess {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl ChildProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch the process. Calling `start` on a running instance succeeds
    /// without re-launching.
    ///
    /// With `redirect_io` false no pipes are created; `write` then returns
    /// false and reads report nothing available, which callers treat as
    /// "no communication channel", not as a failure. `visible` controls
    /// console window creation on Windows and is ignored elsewhere.
    pub fn start(
        &mut self,
        command: &str,
        redirect_io: bool,
        visible: bool,
    ) -> Result<(), ProcessError> {
        if self.child.is_some() {
            return Ok(());
        }

        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or(ProcessError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(parts);

        if redirect_io {
            cmd.stdin(Stdio::piped());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::null());
        }

        #[cfg(target_os = "windows")]
        if !visible {
            use std::os::windows::process::CommandExt;
            use windows::Win32::System::Threading::CREATE_NO_WINDOW;
            cmd.creation_flags(CREATE_NO_WINDOW.0);
        }
        #[cfg(not(target_os = "windows"))]
        let _ = visible;

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

        let pid = child.id();

        if redirect_io {
            self.stdin = child.stdin.take();
            self.stdout = child.stdout.take();

            #[cfg(target_os = "linux")]
            if let Some(ref stdout) = self.stdout {
                set_nonblocking(stdout)?;
            }
        }

        self.child = Some(child);
        log::info!("Started '{}' (pid {})", program, pid);
        Ok(())
    }

    /// Forcibly terminate the process and release all handles. The
    /// instance is reusable for a fresh `start` afterwards.
    pub fn stop(&mut self) {
        self.stdin = None;
        self.stdout = None;

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                log::debug!("Kill failed (already exited?): {}", e);
            }
            let _ = child.wait(); // Reap zombie process
        }
    }

    /// Blocking write to the process input. Returns false when the channel
    /// has no redirected input or the pipe is gone.
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        let Some(stdin) = self.stdin.as_mut() else {
            return false;
        };
        match stdin.write_all(bytes).and_then(|_| stdin.flush()) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Write to child stdin failed: {}", e);
                false
            }
        }
    }

    /// Read whatever output is currently pending into `buf` without
    /// blocking. Returns 0 when nothing is available (or the channel has
    /// no redirected output), `Disconnected` once the pipe reports
    /// end-of-stream.
    pub fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, ProcessError> {
        if buf.is_empty() {
            return Ok(0);
        }

        #[cfg(target_os = "windows")]
        {
            self.read_windows(buf)
        }

        #[cfg(target_os = "linux")]
        {
            self.read_linux(buf)
        }
    }

    pub fn is_started(&self) -> bool {
        self.child.is_some()
    }

    pub fn is_redirected(&self) -> bool {
        self.stdout.is_some()
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }
}

// Windows-specific implementations
#[cfg(target_os = "windows")]
impl ChildProcess {
    fn read_windows(&mut self, buf: &mut [u8]) -> Result<usize, ProcessError> {
        use std::io::Read;
        use std::os::windows::io::AsRawHandle;
        use windows::Win32::Foundation::HANDLE;
        use windows::Win32::System::Pipes::PeekNamedPipe;

        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(0);
        };

        let handle = HANDLE(stdout.as_raw_handle() as isize);
        let mut available = 0u32;
        unsafe {
            // A peek failure means the other end of the pipe is gone.
            PeekNamedPipe(handle, None, 0, None, Some(&mut available), None)
                .map_err(|_| ProcessError::Disconnected)?;
        }

        if available == 0 {
            return Ok(0);
        }

        let take = (available as usize).min(buf.len());
        stdout
            .read(&mut buf[..take])
            .map_err(|e| ProcessError::ReadFailed(e.to_string()))
    }
}

// Linux-specific implementations
#[cfg(target_os = "linux")]
impl ChildProcess {
    fn read_linux(&mut self, buf: &mut [u8]) -> Result<usize, ProcessError> {
        use std::io::Read;

        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(0);
        };

        match stdout.read(buf) {
            Ok(0) => Err(ProcessError::Disconnected),
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(e) => Err(ProcessError::ReadFailed(e.to_string())),
        }
    }
}

/// Put the child's output pipe in non-blocking mode.
#[cfg(target_os = "linux")]
fn set_nonblocking(stdout: &ChildStdout) -> Result<(), ProcessError> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    use std::os::unix::io::AsRawFd;

    let fd = stdout.as_raw_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| ProcessError::ReadFailed(e.to_string()))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| ProcessError::ReadFailed(e.to_string()))?;
    Ok(())
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_on_empty_command_fails() {
        let mut proc = ChildProcess::new();
        assert!(matches!(
            proc.start("", true, false),
            Err(ProcessError::EmptyCommand)
        ));
    }

    #[test]
    fn write_without_start_is_rejected() {
        let mut proc = ChildProcess::new();
        assert!(!proc.write(b"g\n"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn write_is_rejected_without_redirection() {
        let mut proc = ChildProcess::new();
        proc.start("sleep 5", false, true).unwrap();
        assert!(proc.is_started());
        assert!(!proc.is_redirected());
        assert!(!proc.write(b"g\n"));
        proc.stop();
        assert!(!proc.is_started());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn read_available_sees_output_then_disconnect() {
        use std::time::{Duration, Instant};

        let mut proc = ChildProcess::new();
        proc.start("echo marionette", true, false).unwrap();

        let mut collected = Vec::new();
        let mut disconnected = false;
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = [0u8; 256];
        while Instant::now() < deadline {
            match proc.read_available(&mut buf) {
                Ok(0) => std::thread::sleep(Duration::from_millis(5)),
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(ProcessError::Disconnected) => {
                    disconnected = true;
                    break;
                }
                Err(e) => panic!("unexpected read error: {}", e),
            }
        }

        assert_eq!(collected, b"marionette\n");
        assert!(disconnected, "EOF should surface as Disconnected");
    }
}
