use std::fmt;
use std::fs::File;
use std::os::unix::io::IntoRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

use crate::command::Command;
use crate::error::Result;
use crate::posix;
use crate::reader::PeekBuffer;
use crate::reap::RunState;

/// What to connect a pipeline's input or output to.
#[derive(Debug)]
pub enum Redirection {
    /// Leave the stream as inherited from the host.
    Inherit,
    /// Have the library create a pipe and keep the host's end available
    /// through [`Pipeline::input`] or [`Pipeline::output`].
    Pipe,
    /// Connect the stream to an open file.
    File(File),
    /// Open the named file when the pipeline starts.  Compared to opening
    /// it up front, the open happens with whatever privileges are in
    /// effect at start time.
    Path(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Built,
    Started,
    Waited,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// An ordered list of commands connected end to end, like a shell
/// pipeline, but built from argument vectors rather than a command
/// string.
///
/// Build the pipeline with [`command`](Self::command) and the I/O intent
/// setters, [`start`](Self::start) it, optionally read its output or
/// [`pump`](crate::pump) it into other pipelines, then
/// [`wait`](Self::wait) for it.  Dropping a started pipeline waits for
/// it first.
///
/// # Examples
///
/// ```no_run
/// # use pipeline::{Command, Pipeline, Redirection};
/// # fn dummy() -> pipeline::Result<()> {
/// let mut p = Pipeline::new();
/// p.command(Command::new("echo").arg("foo"));
/// p.command(Command::new("sed").arg("-e").arg("s/foo/bar/"));
/// p.stdout(Redirection::Pipe);
/// p.start()?;
/// assert_eq!(p.readline()?, Some(&b"bar\n"[..]));
/// assert_eq!(p.wait()?, 0);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    pub(crate) id: u64,
    pub(crate) commands: Vec<Command>,
    pub(crate) state: State,
    pub(crate) want_in: Redirection,
    pub(crate) want_out: Redirection,
    pub(crate) ignore_signals: bool,
    /// Id of the pipeline this one reads from, set by [`connect`].  A
    /// non-owning back-reference: the host must keep the source alive and
    /// pass it to [`crate::pump`] together with this pipeline.
    pub(crate) source: Option<u64>,
    pub(crate) infd: Option<File>,
    pub(crate) outfd: Option<File>,
    pub(crate) run: Option<Arc<RunState>>,
    pub(crate) buf: PeekBuffer,
}

impl Default for Pipeline {
    fn default() -> Pipeline {
        Pipeline::new()
    }
}

impl Pipeline {
    /// Creates a new empty pipeline.
    pub fn new() -> Pipeline {
        Pipeline {
            id: NEXT_ID.fetch_add(1, SeqCst),
            commands: Vec::new(),
            state: State::Built,
            want_in: Redirection::Inherit,
            want_out: Redirection::Inherit,
            ignore_signals: true,
            source: None,
            infd: None,
            outfd: None,
            run: None,
            buf: PeekBuffer::default(),
        }
    }

    /// Creates a pipeline from a sequence of commands.
    pub fn from_commands(commands: impl IntoIterator<Item = Command>) -> Pipeline {
        let mut p = Pipeline::new();
        for cmd in commands {
            p.command(cmd);
        }
        p
    }

    fn assert_built(&self, what: &str) {
        assert!(
            self.state == State::Built,
            "{} is only valid before the pipeline is started",
            what
        );
    }

    /// Appends a command.
    pub fn command(&mut self, cmd: Command) {
        self.assert_built("adding a command");
        self.commands.push(cmd);
    }

    /// Builds a command from a name and arguments and appends it.
    pub fn command_args(
        &mut self,
        name: impl AsRef<std::ffi::OsStr>,
        args: impl IntoIterator<Item = impl AsRef<std::ffi::OsStr>>,
    ) {
        self.command(Command::with_args(name, args));
    }

    /// Builds a command from a shell-quoted string and appends it.  See
    /// [`Command::from_argstr`] for the quoting rules.
    pub fn command_argstr(&mut self, argstr: impl AsRef<str>) -> Result<()> {
        self.command(Command::from_argstr(argstr)?);
        Ok(())
    }

    /// Sets what the first command's standard input connects to.
    pub fn stdin(&mut self, redirection: Redirection) {
        self.assert_built("setting input");
        self.want_in = redirection;
    }

    /// Sets what the last command's standard output connects to.
    pub fn stdout(&mut self, redirection: Redirection) {
        self.assert_built("setting output");
        self.want_out = redirection;
    }

    /// Controls whether SIGINT and SIGQUIT are ignored in the host while
    /// the pipeline runs, like `system()`.  Defaults to true.
    pub fn ignore_signals(&mut self, ignore: bool) {
        self.assert_built("setting signal handling");
        self.ignore_signals = ignore;
    }

    /// The commands of this pipeline.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Concatenates two unstarted pipelines.  Input intent comes from
    /// `first`, output intent from `second`.
    pub fn join(mut first: Pipeline, mut second: Pipeline) -> Pipeline {
        first.assert_built("joining");
        second.assert_built("joining");
        let mut p = Pipeline::new();
        p.commands = std::mem::take(&mut first.commands);
        p.commands.append(&mut second.commands);
        p.want_in = std::mem::replace(&mut first.want_in, Redirection::Inherit);
        p.want_out = std::mem::replace(&mut second.want_out, Redirection::Inherit);
        p.ignore_signals = first.ignore_signals || second.ignore_signals;
        p
    }

    /// Duplicates a built pipeline: commands are deep-copied, I/O intents
    /// are cloned (a `Redirection::File` is re-opened via `try_clone`).
    pub fn dup(&self) -> Result<Pipeline> {
        self.assert_built("duplicating");
        let mut p = Pipeline::new();
        p.commands = self.commands.clone();
        p.want_in = dup_redirection(&self.want_in)?;
        p.want_out = dup_redirection(&self.want_out)?;
        p.ignore_signals = self.ignore_signals;
        p.source = self.source;
        Ok(p)
    }

    /// Collected child pids, in command order.  A pid of -1 marks a slot
    /// already collected by [`wait`](Self::wait).
    ///
    /// # Panics
    ///
    /// Panics unless the pipeline is started.
    pub fn pids(&self) -> Vec<i32> {
        let run = self.run.as_ref().expect("pipeline not started");
        (0..run.pids.len()).map(|i| run.pid(i)).collect()
    }

    /// Write end of the pipeline's input pipe, present after start when
    /// input was set to [`Redirection::Pipe`].
    pub fn input(&self) -> Option<&File> {
        self.infd.as_ref()
    }

    /// Read end of the pipeline's output pipe, present after start when
    /// output was set to [`Redirection::Pipe`].
    pub fn output(&self) -> Option<&File> {
        self.outfd.as_ref()
    }

    /// Closes the pipeline's input pipe, delivering EOF to the first
    /// command.  A host feeding data through [`input`](Self::input) must
    /// call this before reading the pipeline's output to the end.
    pub fn close_input(&mut self) -> Result<()> {
        if let Some(f) = self.infd.take() {
            if let Some(run) = &self.run {
                run.infd.store(-1, SeqCst);
            }
            posix::close(f.into_raw_fd())?;
        }
        Ok(())
    }

    /// Closes the pipeline's output pipe.
    pub(crate) fn close_output(&mut self) -> Result<()> {
        if let Some(f) = self.outfd.take() {
            if let Some(run) = &self.run {
                run.outfd.store(-1, SeqCst);
            }
            posix::close(f.into_raw_fd())?;
        }
        Ok(())
    }

    /// Reads up to `len` bytes from the pipeline's output.  An empty
    /// slice means end of stream.
    pub fn read(&mut self, len: usize) -> Result<&[u8]> {
        let outfd = self.outfd.as_ref().expect("pipeline output not open");
        Ok(self.buf.get_block(outfd, len, false)?)
    }

    /// Looks ahead up to `len` bytes in the pipeline's output without
    /// consuming them.
    pub fn peek(&mut self, len: usize) -> Result<&[u8]> {
        let outfd = self.outfd.as_ref().expect("pipeline output not open");
        Ok(self.buf.get_block(outfd, len, true)?)
    }

    /// Number of bytes that [`read`](Self::read) can return without
    /// blocking on the pipeline.
    pub fn peek_size(&self) -> usize {
        self.buf.peek_size()
    }

    /// Discards `len` already-peeked bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`peek_size`](Self::peek_size).
    pub fn peek_skip(&mut self, len: usize) {
        self.buf.peek_skip(len);
    }

    /// Reads one line (including its newline) from the pipeline's output.
    /// Returns `None` at end of stream; a final line without a newline is
    /// returned as-is.  The line may contain NUL bytes.
    ///
    /// The returned slice is valid until the next line call.
    pub fn readline(&mut self) -> Result<Option<&[u8]>> {
        let Pipeline { outfd, buf, .. } = self;
        let outfd = outfd.as_ref().expect("pipeline output not open");
        Ok(buf.get_line(outfd, true)?)
    }

    /// Looks ahead one line in the pipeline's output without consuming
    /// it.
    pub fn peekline(&mut self) -> Result<Option<&[u8]>> {
        let Pipeline { outfd, buf, .. } = self;
        let outfd = outfd.as_ref().expect("pipeline output not open");
        Ok(buf.get_line(outfd, false)?)
    }

    pub(crate) fn peek_region(&self) -> &[u8] {
        self.buf.peek_region()
    }

    pub(crate) fn run_state(&self) -> &Arc<RunState> {
        self.run.as_ref().expect("pipeline not started")
    }
}

fn dup_redirection(r: &Redirection) -> Result<Redirection> {
    Ok(match r {
        Redirection::Inherit => Redirection::Inherit,
        Redirection::Pipe => Redirection::Pipe,
        Redirection::File(f) => Redirection::File(f.try_clone().map_err(crate::Error::Io)?),
        Redirection::Path(p) => Redirection::Path(p.clone()),
    })
}

/// Connects the output of `source` to the input of each pipeline in
/// `sinks`.
///
/// This is an application-level connection: nothing flows until
/// [`pump`](crate::pump) is called with all the pipelines involved, which
/// also lets the host inspect the data in between.  It is primarily
/// useful with more than one sink, where the pipelines cannot simply be
/// concatenated with [`Pipeline::join`].
///
/// The connection is recorded by id and does not keep `source` alive;
/// the host owns all the pipelines and must pass every source to `pump`
/// along with its sinks.
///
/// # Panics
///
/// Panics if a sink is already started, or if `source` is started
/// without a [`Redirection::Pipe`] output.
pub fn connect(source: &mut Pipeline, sinks: &mut [&mut Pipeline]) {
    // We must be in control of output from the source pipeline.  If the
    // source isn't started, we can force this.
    if source.state == State::Built {
        source.want_out = Redirection::Pipe;
    } else {
        assert!(
            source.outfd.is_some(),
            "connected source pipeline has no output pipe"
        );
    }
    for sink in sinks {
        sink.assert_built("connecting");
        sink.source = Some(source.id);
        sink.want_in = Redirection::Pipe;
        // Zero-command sinks pass data straight through, but start and
        // pump cannot plumb an empty pipeline between them, so give such
        // sinks an explicit pass-through command.
        if sink.commands.is_empty() {
            sink.commands.push(Command::passthrough());
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cmd) in self.commands.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{}", cmd)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pipeline {{ {} [state: {:?}, input: {:?}, output: {:?}] }}",
            self, self.state, self.want_in, self.want_out
        )
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.state == State::Started {
            let _ = self.wait();
        }
    }
}
