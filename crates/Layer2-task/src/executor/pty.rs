//! Pseudo-terminal process wrapper
//!
//! Owns one master/slave pair and one child. The child is started on the
//! slave side in its own session; the slave handle is released right after
//! spawn so the master sees EOF once the child exits.
//!
//! ```text
//!   PtyProcess ── write ──► master ══ slave ──► child (own session)
//!       ▲                     │
//!       └──── read / pump ◄───┘
//! ```

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use relay_foundation::{Error, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const READ_BUFFER: usize = 4096;
const CLOSE_POLL: Duration = Duration::from_millis(20);

/// What to run inside the terminal
#[derive(Debug, Clone)]
pub struct PtyCommand {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

impl PtyCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: None,
            env: HashMap::new(),
            rows: 24,
            cols: 80,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

pub struct PtyProcess {
    master: Option<Box<dyn MasterPty + Send>>,
    reader: Option<Box<dyn Read + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
    exit_code: Option<u32>,
}

impl PtyProcess {
    /// Open a pty pair and start `command` on the slave side
    pub fn spawn(command: &PtyCommand) -> Result<Self> {
        let (program, args) = command
            .argv
            .split_first()
            .ok_or_else(|| Error::InvalidInput("empty PTY command".into()))?;

        let size = pty_size(command.rows, command.cols);
        let pair = native_pty_system()
            .openpty(size)
            .map_err(|e| Error::Pty(format!("Failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        if let Some(cwd) = &command.cwd {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::Pty(format!("Failed to spawn PTY command: {}", e)))?;
        // Child holds its own copy of the slave
        drop(pair.slave);

        let master = pair.master;
        master
            .resize(size)
            .map_err(|e| Error::Pty(format!("Failed to apply window size: {}", e)))?;

        let reader = master
            .try_clone_reader()
            .map_err(|e| Error::Pty(format!("Failed to clone PTY reader: {}", e)))?;
        let writer = master
            .take_writer()
            .map_err(|e| Error::Pty(format!("Failed to take PTY writer: {}", e)))?;

        let pid = child.process_id();
        info!(program = %program, pid = ?pid, rows = command.rows, cols = command.cols, "Spawned PTY process");

        Ok(Self {
            master: Some(master),
            reader: Some(reader),
            writer: Some(writer),
            child,
            pid,
            exit_code: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code once the child has been reaped
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| Error::Pty("PTY already closed".into()))?;
        master
            .resize(pty_size(rows, cols))
            .map_err(|e| Error::Pty(format!("Failed to resize PTY: {}", e)))?;
        debug!(pid = ?self.pid, rows, cols, "Resized PTY");
        Ok(())
    }

    /// Blocking read; 0 bytes means closed descriptor or exited child
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf).unwrap_or(0),
            None => 0,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Pty("PTY already closed".into()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(data.len())
    }

    pub fn is_alive(&mut self) -> bool {
        if self.exit_code.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(status.exit_code());
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// SIGTERM, or SIGKILL when `force`
    pub fn terminate(&mut self, force: bool) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        debug!(pid = ?self.pid, force, "Terminating PTY process");
        self.signal(force)
    }

    #[cfg(unix)]
    fn signal(&mut self, force: bool) -> Result<()> {
        let Some(pid) = self.pid else {
            return self.child.kill().map_err(Error::Io);
        };
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // SAFETY: kill(2) with a pid we spawned and a valid signal number
        let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // Already gone
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(Error::Io(err));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn signal(&mut self, _force: bool) -> Result<()> {
        self.child.kill().map_err(Error::Io)
    }

    /// Close both sides, wait up to `timeout`, then force-kill.
    ///
    /// Returns the exit code when the child could be reaped.
    pub fn close(&mut self, timeout: Duration) -> Option<u32> {
        self.writer.take();
        self.reader.take();
        self.master.take();

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_alive() {
                return self.exit_code;
            }
            std::thread::sleep(CLOSE_POLL);
        }

        warn!(pid = ?self.pid, ?timeout, "PTY child still running after close, killing");
        if let Err(e) = self.signal(true) {
            warn!(pid = ?self.pid, error = %e, "Failed to kill PTY child");
        }
        match self.child.wait() {
            Ok(status) => {
                self.exit_code = Some(status.exit_code());
                self.exit_code
            }
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "Failed to reap PTY child");
                None
            }
        }
    }

    /// Move reads onto a blocking thread and deliver bytes on a channel.
    ///
    /// Takes the reader: afterwards `read` returns 0. The channel closes on
    /// EOF or read error.
    pub fn spawn_output_pump(&mut self, capacity: usize) -> Result<mpsc::Receiver<Vec<u8>>> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| Error::Pty("PTY reader already taken".into()))?;
        let (tx, rx) = mpsc::channel(capacity.max(1));

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });

        Ok(rx)
    }

    /// Move writes onto a blocking thread fed by the returned channel.
    ///
    /// Takes the writer: afterwards `write` fails. Dropping every sender
    /// releases the writer.
    pub fn spawn_input_pump(&mut self, capacity: usize) -> Result<mpsc::Sender<Vec<u8>>> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| Error::Pty("PTY writer already taken".into()))?;
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(capacity.max(1));
        let pid = self.pid;

        tokio::task::spawn_blocking(move || {
            while let Some(data) = rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    debug!(pid = ?pid, error = %e, "PTY input pump stopped");
                    break;
                }
            }
        });

        Ok(tx)
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command_rejected() {
        let cmd = PtyCommand::new(Vec::<String>::new());
        assert!(matches!(
            PtyProcess::spawn(&cmd),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_read_after_exit_returns_output_then_zero() {
        let mut pty = PtyProcess::spawn(&PtyCommand::new(["sh", "-c", "printf ready"])).unwrap();

        let mut output = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = pty.read(&mut buf);
            if n == 0 {
                break;
            }
            output.extend_from_slice(&buf[..n]);
        }

        assert!(String::from_utf8_lossy(&output).contains("ready"));
        assert_eq!(pty.close(Duration::from_secs(2)), Some(0));
        assert_eq!(pty.read(&mut buf), 0);
    }

    #[test]
    fn test_close_kills_stubborn_child() {
        let mut pty = PtyProcess::spawn(&PtyCommand::new([
            "sh",
            "-c",
            "trap '' HUP TERM; sleep 30",
        ]))
        .unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        pty.close(Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!pty.is_alive());
    }
}
