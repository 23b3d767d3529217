//! Boundary with the shell session that owns a script session.

use std::sync::{PoisonError, RwLock};

use crate::session::Session;
use crate::stream::{CommandIo, SharedReader, SharedWriter};

/// What the bridge needs from an interactive shell session.
///
/// The pipes returned here belong to whichever command is running when they
/// are asked for, so callers must not cache them across commands.
pub trait ShellSession: Send + Sync {
    /// Input of the current command.
    fn stdin(&self) -> SharedReader;

    /// Output of the current command.
    fn stdout(&self) -> SharedWriter;

    /// Error output of the current command.
    fn stderr(&self) -> SharedWriter;

    /// The script session bound to this shell, if scripting is enabled.
    fn tag(&self) -> Option<Session>;

    /// Bind (or unbind) the script session.
    fn set_tag(&self, session: Option<Session>);

    /// All three pipes at once.
    fn io(&self) -> CommandIo {
        CommandIo {
            stdin: self.stdin(),
            stdout: self.stdout(),
            stderr: self.stderr(),
        }
    }
}

/// A shell session with swappable pipes.
///
/// The driving shell calls [`set_io`](Self::set_io) before each command so
/// that script invocations see that command's pipes.
pub struct BasicShell {
    io: RwLock<CommandIo>,
    tag: RwLock<Option<Session>>,
}

impl BasicShell {
    /// A shell on the process streams.
    pub fn new() -> Self {
        Self::with_io(CommandIo::process())
    }

    /// A shell on the given pipes.
    pub fn with_io(io: CommandIo) -> Self {
        Self {
            io: RwLock::new(io),
            tag: RwLock::new(None),
        }
    }

    /// Point the shell at the next command's pipes.
    pub fn set_io(&self, io: CommandIo) {
        *self.io.write().unwrap_or_else(PoisonError::into_inner) = io;
    }

    fn current(&self) -> CommandIo {
        self.io
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for BasicShell {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BasicShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tagged = self
            .tag
            .read()
            .map(|t| t.is_some())
            .unwrap_or_default();
        f.debug_struct("BasicShell")
            .field("tagged", &tagged)
            .finish_non_exhaustive()
    }
}

impl ShellSession for BasicShell {
    fn stdin(&self) -> SharedReader {
        self.current().stdin
    }

    fn stdout(&self) -> SharedWriter {
        self.current().stdout
    }

    fn stderr(&self) -> SharedWriter {
        self.current().stderr
    }

    fn io(&self) -> CommandIo {
        self.current()
    }

    fn tag(&self) -> Option<Session> {
        self.tag
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_tag(&self, session: Option<Session>) {
        *self.tag.write().unwrap_or_else(PoisonError::into_inner) = session;
    }
}
