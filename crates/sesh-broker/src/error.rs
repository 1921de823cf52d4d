//! Error taxonomy for the broker binary.
//!
//! Only startup-class errors travel through `Result`: failure to create the
//! state directory, bind the session socket, or allocate the pty. Everything
//! else (per-client I/O errors, malformed control input, interrupted
//! syscalls) is absorbed and logged at the point where it happens and never
//! unwinds past the event loop.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot create state directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("cannot bind session socket {path}: {source}")]
    Bind { path: PathBuf, source: io::Error },

    #[error("cannot allocate pty for {command}: {source}")]
    PtySpawn { command: String, source: io::Error },

    #[error("no home directory; pass --dir or set SESH_DIR")]
    NoStateDir,

    #[error("session {0} is not running")]
    NoSuchSession(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
