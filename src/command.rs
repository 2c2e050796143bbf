use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::mem::ManuallyDrop;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

/// The body of a function command.
///
/// A function command runs Rust code in a forked child instead of
/// executing a program.  `run` is invoked in the child after the standard
/// streams have been wired up; if it returns, the child exits with status
/// zero.  Any state the body needs is captured in the implementing value.
///
/// `cleanup` releases state that must be torn down at a defined point
/// rather than at drop time: it is invoked once in the child after `run`
/// returns, and once on the parent side after the command has been
/// reaped.  The default does nothing, which is right for state that
/// `Drop` already handles.
///
/// Plain closures implement this trait, so
/// `Command::function("work", || { ... })` is enough for most uses.
pub trait Function: Send + Sync {
    /// Body of the command, run in the forked child.
    fn run(&self);

    /// Hook invoked when the command is done with its state, both in the
    /// child after `run` returns and in the parent after the wait.
    fn cleanup(&self) {}
}

impl<F: Fn() + Send + Sync> Function for F {
    fn run(&self) {
        self()
    }
}

/// One environment adjustment applied in the child before the command
/// runs.  Ops apply in insertion order; `Clear` wipes the inherited
/// environment and only subsequent ops survive it.
#[derive(Clone)]
pub(crate) enum EnvOp {
    Set(OsString, OsString),
    Unset(OsString),
    Clear,
}

#[derive(Clone)]
pub(crate) enum Kind {
    Process { argv: Vec<OsString> },
    Function { handler: Arc<dyn Function> },
    Sequence { commands: Vec<Command> },
}

/// A single node of a pipeline: an external process, an in-process
/// function, or a sequence of commands run left to right like `a && b`.
///
/// Commands are built with the consuming builder methods below and then
/// attached to a [`Pipeline`]; once attached they are no longer mutable.
///
/// # Examples
///
/// ```no_run
/// # use pipeline::Command;
/// let cmd = Command::new("grep").arg("-F").arg("needle").env("LC_ALL", "C");
/// ```
///
/// [`Pipeline`]: crate::Pipeline
#[derive(Clone)]
pub struct Command {
    pub(crate) name: OsString,
    pub(crate) nice: i32,
    pub(crate) discard_stderr: bool,
    pub(crate) env: Vec<EnvOp>,
    pub(crate) kind: Kind,
}

impl Command {
    /// Creates a process command that executes `name`, resolved through
    /// `PATH`.  `argv[0]` is initialised to the basename of `name`.
    pub fn new(name: impl AsRef<OsStr>) -> Command {
        let name = name.as_ref().to_owned();
        let argv0 = Path::new(&name)
            .file_name()
            .map(|base| base.to_owned())
            .unwrap_or_else(|| name.clone());
        Command {
            name,
            nice: 0,
            discard_stderr: false,
            env: Vec::new(),
            kind: Kind::Process { argv: vec![argv0] },
        }
    }

    /// Creates a process command with arguments in one go.
    pub fn with_args(
        name: impl AsRef<OsStr>,
        args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    ) -> Command {
        Command::new(name).args(args)
    }

    /// Creates a command that runs `handler` in the forked child instead
    /// of executing a program.  `name` is only used in diagnostics.
    ///
    /// Argument-related methods cannot be used on the returned command.
    pub fn function(name: impl AsRef<OsStr>, handler: impl Function + 'static) -> Command {
        Command {
            name: name.as_ref().to_owned(),
            nice: 0,
            discard_stderr: false,
            env: Vec::new(),
            kind: Kind::Function {
                handler: Arc::new(handler),
            },
        }
    }

    /// Creates a command that runs `commands` one after another in a
    /// single pipeline slot, stopping at the first non-zero exit, like
    /// `a && b && c` in a shell.
    ///
    /// Argument-related methods cannot be used on the returned command.
    pub fn sequence(name: impl AsRef<OsStr>, commands: impl IntoIterator<Item = Command>) -> Command {
        Command {
            name: name.as_ref().to_owned(),
            nice: 0,
            discard_stderr: false,
            env: Vec::new(),
            kind: Kind::Sequence {
                commands: commands.into_iter().collect(),
            },
        }
    }

    /// Builds a process command from a shell-quoted string.
    ///
    /// The string is split on whitespace honouring single quotes, double
    /// quotes, and backslashes, but no other shell constructs: no
    /// wildcards, variables, semicolons, or backquotes.  A leading
    /// literal word `exec` is dropped for compatibility with old
    /// configuration files.  This exists to support such files; prefer
    /// [`new`](Self::new) and [`arg`](Self::arg) in new code.
    pub fn from_argstr(argstr: impl AsRef<str>) -> Result<Command> {
        let argstr = argstr.as_ref();
        let mut words = argstr_words(argstr)?.into_iter();
        let mut name = words
            .next()
            .ok_or_else(|| Error::ConfigDirective(argstr.to_owned()))?;
        if name == "exec" {
            // Some old configuration files have "exec command" rather
            // than "command"; this worked when the directive was run by
            // a shell, but exec is a shell builtin, so drop it.
            name = words
                .next()
                .ok_or_else(|| Error::ConfigDirective(argstr.to_owned()))?;
        }
        Ok(Command::new(name).args(words))
    }

    /// Appends an argument.
    ///
    /// # Panics
    ///
    /// Panics if this is not a process command.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Command {
        match &mut self.kind {
            Kind::Process { argv } => argv.push(arg.as_ref().to_owned()),
            _ => panic!("arguments can only be added to process commands"),
        }
        self
    }

    /// Appends several arguments.
    ///
    /// # Panics
    ///
    /// Panics if this is not a process command.
    pub fn args(mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> Command {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// Appends the words of a shell-quoted string as arguments, with the
    /// same quoting rules as [`from_argstr`](Self::from_argstr).
    ///
    /// # Panics
    ///
    /// Panics if this is not a process command.
    pub fn argstr(mut self, argstr: impl AsRef<str>) -> Result<Command> {
        for word in argstr_words(argstr.as_ref())? {
            self = self.arg(word);
        }
        Ok(self)
    }

    /// Sets an environment variable in the child while this command runs.
    pub fn env(mut self, name: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Command {
        self.env.push(EnvOp::Set(
            name.as_ref().to_owned(),
            value.as_ref().to_owned(),
        ));
        self
    }

    /// Removes an environment variable in the child while this command
    /// runs.
    pub fn env_remove(mut self, name: impl AsRef<OsStr>) -> Command {
        self.env.push(EnvOp::Unset(name.as_ref().to_owned()));
        self
    }

    /// Clears the inherited environment in the child.  Variables set with
    /// [`env`](Self::env) after this call survive.
    pub fn env_clear(mut self) -> Command {
        self.env.push(EnvOp::Clear);
        self
    }

    /// Adjusts the niceness of the child by `adjustment`.
    pub fn nice(mut self, adjustment: i32) -> Command {
        self.nice = adjustment;
        self
    }

    /// Redirects the child's standard error to `/dev/null`.
    pub fn discard_stderr(mut self, discard: bool) -> Command {
        self.discard_stderr = discard;
        self
    }

    /// Returns the command's name.
    pub fn name(&self) -> &OsStr {
        &self.name
    }

    /// The implicit command injected into sinks with no commands of their
    /// own: copies its input to its output until EOF.
    pub(crate) fn passthrough() -> Command {
        Command::function("cat", Passthrough)
    }

    pub(crate) fn cleanup_function(&self) {
        if let Kind::Function { handler } = &self.kind {
            handler.cleanup();
        }
    }
}

struct Passthrough;

impl Function for Passthrough {
    fn run(&self) {
        // Borrow the child's stdin and stdout without taking ownership of
        // the fds.
        let mut input = ManuallyDrop::new(unsafe { File::from_raw_fd(0) });
        let mut output = ManuallyDrop::new(unsafe { File::from_raw_fd(1) });
        let mut buf = [0u8; 4096];
        loop {
            match input.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if output.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in &self.env {
            if let EnvOp::Set(name, value) = op {
                write!(
                    f,
                    "{}={} ",
                    name.to_string_lossy(),
                    value.to_string_lossy()
                )?;
            }
        }
        match &self.kind {
            Kind::Process { argv } => {
                write!(f, "{}", self.name.to_string_lossy())?;
                for arg in &argv[1..] {
                    write!(f, " {}", arg.to_string_lossy())?;
                }
            }
            Kind::Function { .. } => {
                write!(f, "{}", self.name.to_string_lossy())?;
            }
            Kind::Sequence { commands } => {
                write!(f, "(")?;
                for (i, cmd) in commands.iter().enumerate() {
                    if i > 0 {
                        write!(f, " && ")?;
                    }
                    write!(f, "{}", cmd)?;
                }
                write!(f, ")")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command {{ {} }}", self)
    }
}

#[derive(PartialEq, Eq, Copy, Clone)]
enum QuoteMode {
    None,
    Single,
    Double,
}

/// Splits a configuration-style string into words.
///
/// Three-state machine over bytes: outside quotes, whitespace separates
/// words, `\` takes the next byte literally, and quotes switch mode.
/// Inside single quotes everything is literal.  Inside double quotes `\`
/// is special only before `$`, `` ` ``, `"`, or `\`.  An unterminated
/// quote or trailing backslash is a parse error.
pub(crate) fn argstr_words(argstr: &str) -> Result<Vec<String>> {
    let bytes = argstr.as_bytes();
    let mut words = Vec::new();
    let mut pos = 0;

    'words: while pos < bytes.len() {
        // Skip whitespace between words.
        while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b'\t') {
            pos += 1;
        }
        if pos == bytes.len() {
            break;
        }

        let mut word = Vec::new();
        let mut mode = QuoteMode::None;
        while pos < bytes.len() {
            let b = bytes[pos];
            match mode {
                QuoteMode::None => match b {
                    b' ' | b'\t' => {
                        words.push(into_word(word));
                        continue 'words;
                    }
                    b'\'' => mode = QuoteMode::Single,
                    b'"' => mode = QuoteMode::Double,
                    b'\\' => {
                        pos += 1;
                        if pos == bytes.len() {
                            return Err(Error::ConfigDirective(argstr.to_owned()));
                        }
                        word.push(bytes[pos]);
                    }
                    _ => word.push(b),
                },
                QuoteMode::Single => match b {
                    b'\'' => mode = QuoteMode::None,
                    _ => word.push(b),
                },
                QuoteMode::Double => match b {
                    b'"' => mode = QuoteMode::None,
                    b'\\' if pos + 1 < bytes.len()
                        && matches!(bytes[pos + 1], b'$' | b'`' | b'"' | b'\\') =>
                    {
                        pos += 1;
                        word.push(bytes[pos]);
                    }
                    _ => word.push(b),
                },
            }
            pos += 1;
        }
        if mode != QuoteMode::None {
            return Err(Error::ConfigDirective(argstr.to_owned()));
        }
        words.push(into_word(word));
    }

    Ok(words)
}

fn into_word(bytes: Vec<u8>) -> String {
    // Quoting characters are ASCII, so removing them cannot break the
    // UTF-8 validity of the input.
    String::from_utf8(bytes).expect("words of a UTF-8 string are UTF-8")
}
