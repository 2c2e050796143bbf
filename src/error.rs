use std::io;

use thiserror::Error;

/// Error type for pipeline construction and execution.
///
/// Misuse of the API (adding arguments to a function command, starting a
/// pipeline twice, pumping a sink whose source was not supplied) is a
/// programming bug and panics instead of returning an error.
#[derive(Debug, Error)]
pub enum Error {
    /// A quoted-argument configuration string could not be parsed.
    #[error("badly formed configuration directive: '{0}'")]
    ConfigDirective(String),

    /// An operating system call failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
