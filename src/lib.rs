//! Construction and execution of pipelines of child processes.
//!
//! The entry points are the [`Command`] builder, describing one node of
//! a pipeline (an external process, an in-process function, or a `&&`
//! sequence), and the [`Pipeline`] struct that connects commands end to
//! end, launches them, and exposes their combined output.  Unlike
//! handing a command string to a shell, every argument vector,
//! environment delta, and file descriptor stays under the host's
//! control; the only shell-ism supported is quoting-aware splitting of
//! configuration strings.
//!
//! Beyond running a single pipeline, the module provides:
//!
//! * buffered reading of a pipeline's output with peek/skip and line
//!   semantics ([`Pipeline::read`], [`Pipeline::peek`],
//!   [`Pipeline::readline`]);
//!
//! * fan-out from one pipeline into several others over non-blocking
//!   I/O ([`connect`] and [`pump`]);
//!
//! * asynchronous collection of child exit statuses through a SIGCHLD
//!   handler ([`install_sigchld`]), with `system()`-like treatment of
//!   SIGINT and SIGQUIT while children run.
//!
//! # Examples
//!
//! Run `echo foo | sed -e s/foo/bar/` and read its output:
//!
//! ```no_run
//! # use pipeline::{Command, Pipeline, Redirection};
//! # fn dummy() -> pipeline::Result<()> {
//! let mut p = Pipeline::new();
//! p.command(Command::new("echo").arg("foo"));
//! p.command(Command::new("sed").arg("-e").arg("s/foo/bar/"));
//! p.stdout(Redirection::Pipe);
//! p.start()?;
//! assert_eq!(p.readline()?, Some(&b"bar\n"[..]));
//! assert_eq!(p.wait()?, 0);
//! # Ok(())
//! # }
//! ```
//!
//! Fan one pipeline's output into two others:
//!
//! ```no_run
//! # use pipeline::{connect, pump, Command, Pipeline};
//! # fn dummy() -> pipeline::Result<()> {
//! let mut source = Pipeline::from_commands([Command::new("nroff")]);
//! let mut wide = Pipeline::from_commands([Command::new("col")]);
//! let mut plain = Pipeline::new();
//! connect(&mut source, &mut [&mut wide, &mut plain]);
//! pump(&mut [&mut source, &mut wide, &mut plain])?;
//! # Ok(())
//! # }
//! ```
//!
//! The library drives all of its work from the calling thread; hosts
//! using multiple threads must serialise calls into it externally.

#![warn(missing_docs)]

#[cfg(not(unix))]
compile_error!("this crate only supports Unix platforms");

mod command;
mod error;
mod pipeline;
mod posix;
mod pump;
mod reader;
mod reap;
mod spawn;

pub use crate::command::{Command, Function};
pub use crate::error::{Error, Result};
pub use crate::pipeline::{Pipeline, Redirection, connect};
pub use crate::pump::pump;
pub use crate::reap::install_sigchld;

#[cfg(test)]
mod tests {
    mod util;

    mod argstr;
    mod basic;
    mod command;
    mod pipeline;
    mod pump;
    mod read;
    mod signals;
}
