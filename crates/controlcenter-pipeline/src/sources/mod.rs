//! Where log lines come from: a file or stdin, a directory of rotated
//! files, or a listening socket.

mod dir;
mod file;
mod socket;

use std::path::PathBuf;

use thiserror::Error;

pub use dir::{DEFAULT_BASES, DirSettings, DirSource, LogFile, Rotation, discover_log_files};
pub use file::{StreamSource, open_file, stdin_source};
pub use socket::{DEFAULT_CONNECTION_TIMEOUT, SocketAddress, SocketSource};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error(
        "invalid socket description: {0}, expected \"unix=/path/to/socket\" or \"tcp=host:port\""
    )]
    InvalidSocketDescription(String),
    #[error("unsupported socket kind: {0}")]
    UnsupportedSocketKind(String),
    #[error("no log files found: dir={}", .0.display())]
    NoLogFiles(PathBuf),
}
