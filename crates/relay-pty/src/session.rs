use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize as NativeSize};

#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(#[source] anyhow::Error),
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Terminal dimensions, in rows/cols, passed through to the underlying PTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl From<PtySize> for NativeSize {
    fn from(size: PtySize) -> Self {
        NativeSize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// A child process running on a pseudo-terminal: the master side to read
/// from and write to, and a handle to the child for exit-status polling.
pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
}

impl PtySession {
    /// Spawn `command` with `args` on a freshly-opened pty of the given
    /// size. The caller is responsible for reading the master's reader on a
    /// blocking thread (see [`PtySession::take_reader`]) — `portable_pty`'s
    /// reader is a blocking `std::io::Read`, not a tokio one.
    pub fn spawn(command: &str, args: &[String], size: PtySize) -> Result<Self, PtyError> {
        Self::spawn_in(command, args, size, None)
    }

    /// Same as [`PtySession::spawn`], but runs the child in `cwd` when
    /// given one — used for `worktree` steps, which get their own working
    /// directory so parallel agent steps never collide on file state.
    pub fn spawn_in(
        command: &str,
        args: &[String],
        size: PtySize,
        cwd: Option<&std::path::Path>,
    ) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.into())
            .map_err(|e| PtyError::Open(anyhow::anyhow!(e)))?;

        let mut cmd = CommandBuilder::new(command);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn {
                command: command.to_string(),
                source: anyhow::anyhow!(e),
            })?;
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(anyhow::anyhow!(e)))?;

        Ok(Self {
            master: pair.master,
            writer,
            child: Arc::new(Mutex::new(child)),
        })
    }

    /// Take the blocking reader for the master side. Can only be called
    /// once; intended to be handed to a `spawn_blocking` read loop.
    pub fn take_reader(&self) -> std::io::Result<Box<dyn Read + Send>> {
        self.master.try_clone_reader()
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    pub fn resize(&self, size: PtySize) -> Result<(), PtyError> {
        self.master
            .resize(size.into())
            .map_err(|e| PtyError::Open(anyhow::anyhow!(e)))
    }

    /// Non-blocking check for whether the child has already exited, used as
    /// a watchdog fallback for platforms where EOF on the reader doesn't
    /// reliably arrive on process exit.
    pub fn has_exited(&self) -> Option<i32> {
        let mut child = self.child.lock().expect("pty child mutex poisoned");
        match child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code() as i32),
            _ => None,
        }
    }

    pub fn kill(&self) -> std::io::Result<()> {
        self.child.lock().expect("pty child mutex poisoned").kill()
    }
}
