//! Launching pipelines and waiting for them: the fork/exec loop, the
//! child-side fd wiring and command dispatch, and the waiter that maps
//! collected statuses into a return code.

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering::SeqCst};

use log::{debug, error};

use crate::command::{Command, EnvOp, Kind};
use crate::error::Result;
use crate::pipeline::{Pipeline, Redirection, State};
use crate::posix;
use crate::reap::{self, RunState};

/// Children exit with this status if exec fails.
const EXEC_FAILED_EXIT_STATUS: i32 = 0xff;

/// Exit status of a child that failed during setup, before reaching its
/// command.
const CHILD_FATAL_EXIT_STATUS: i32 = 2;

/// Count of running pipelines that asked for SIGINT/SIGQUIT to be
/// ignored.  The first one in saves the prior dispositions, the last one
/// out restores them.
static IGNORED_SIGNALS: AtomicU32 = AtomicU32::new(0);

struct SavedDispositions(UnsafeCell<Option<(libc::sigaction, libc::sigaction)>>);

// Written only from the single host thread; read from forked children.
unsafe impl Sync for SavedDispositions {}

static SAVED: SavedDispositions = SavedDispositions(UnsafeCell::new(None));

impl Pipeline {
    /// Starts the processes in the pipeline.
    ///
    /// The pipe graph is created, each command is forked with its
    /// standard streams wired to its neighbours, and the pipeline
    /// becomes eligible for reading, pumping, and waiting.
    ///
    /// If starting fails partway (say, exec of a middle command cannot
    /// even fork), already-forked children are left to run to completion
    /// and the pipeline stays unstarted.
    ///
    /// # Panics
    ///
    /// Panics if the pipeline has already been started.
    pub fn start(&mut self) -> Result<()> {
        assert!(
            self.state == State::Built,
            "pipeline already started"
        );

        // Flush pending output so children don't inherit and duplicate
        // it.
        let _ = io::stdout().flush();

        debug!("starting pipeline: {}", self);

        if self.ignore_signals && IGNORED_SIGNALS.fetch_add(1, SeqCst) == 0 {
            // Ignore SIGINT and SIGQUIT while subprocesses are running,
            // just like system().
            let osa_int = posix::sig_ignore(posix::SIGINT)?;
            let osa_quit = posix::sig_ignore(posix::SIGQUIT)?;
            unsafe { *SAVED.0.get() = Some((osa_int, osa_quit)) };
        }

        let run = RunState::new(self.commands.len());
        reap::register(&run)?;
        self.run = Some(Arc::clone(&run));

        match self.start_children(&run) {
            Ok(()) => {
                self.state = State::Started;
                Ok(())
            }
            Err(e) => {
                let _ = reap::unregister(&run);
                self.run = None;
                self.infd = None;
                self.outfd = None;
                if self.ignore_signals && IGNORED_SIGNALS.fetch_sub(1, SeqCst) == 1 {
                    restore_dispositions();
                }
                Err(e)
            }
        }
    }

    fn start_children(&mut self, run: &Arc<RunState>) -> Result<()> {
        let ncommands = self.commands.len();

        let mut last_input: Option<File> = None;
        match mem::replace(&mut self.want_in, Redirection::Inherit) {
            Redirection::Pipe => {
                let (read, write) = posix::pipe()?;
                run.infd.store(write.as_raw_fd(), SeqCst);
                self.infd = Some(write);
                last_input = Some(read);
            }
            Redirection::File(f) => last_input = Some(f),
            Redirection::Path(path) => last_input = Some(File::open(&path)?),
            Redirection::Inherit => {}
        }

        let mut want_out = Some(mem::replace(&mut self.want_out, Redirection::Inherit));

        for i in 0..ncommands {
            let last = i == ncommands - 1;

            let mut output_read: Option<File> = None;
            let mut output_write: Option<File> = None;
            let piped_out = !last || matches!(want_out.as_ref().unwrap(), Redirection::Pipe);
            if piped_out {
                let (read, write) = posix::pipe()?;
                output_read = Some(read);
                output_write = Some(write);
            } else if last {
                match want_out.take().unwrap() {
                    Redirection::File(f) => output_write = Some(f),
                    Redirection::Path(path) => {
                        output_write = Some(
                            OpenOptions::new()
                                .write(true)
                                .create(true)
                                .truncate(true)
                                .open(&path)?,
                        );
                    }
                    Redirection::Inherit => {}
                    Redirection::Pipe => unreachable!(),
                }
            }

            let child_stdin = last_input.as_ref().map(File::as_raw_fd);
            let child_stdout = output_write.as_ref().map(File::as_raw_fd);
            let child_close = output_read.as_ref().map(File::as_raw_fd);
            let own_infd = self.infd.as_ref().map(File::as_raw_fd);

            // Block SIGCHLD so that the handler cannot look for this
            // child before its pid slot is filled in.
            let block = posix::sigchld_block()?;
            match unsafe { posix::fork() }? {
                None => {
                    child_setup(
                        child_stdin,
                        child_stdout,
                        child_close,
                        own_infd,
                        run.as_ref(),
                        self.ignore_signals,
                    );
                    start_in_child(&self.commands[i]);
                }
                Some(pid) => {
                    run.pids[i].store(pid, SeqCst);
                    drop(block);

                    drop(last_input.take());
                    drop(output_write.take());
                    if last && piped_out {
                        let outfd = output_read.take().unwrap();
                        run.outfd.store(outfd.as_raw_fd(), SeqCst);
                        self.outfd = Some(outfd);
                    } else {
                        last_input = output_read.take();
                    }

                    debug!(
                        "started \"{}\", pid {}",
                        self.commands[i].name().to_string_lossy(),
                        pid
                    );
                }
            }
        }

        if ncommands == 0 {
            // A pipeline with no commands is plain plumbing: its output
            // is the read end of its own input.
            if let Some(outfd) = last_input.take() {
                run.outfd.store(outfd.as_raw_fd(), SeqCst);
                self.outfd = Some(outfd);
            }
        }

        Ok(())
    }

    /// Waits for the pipeline to complete and returns its exit status:
    /// the mapped status of the last command (`128 + signal` for a death
    /// by signal, the exit code otherwise).
    ///
    /// Earlier commands' failures are reported through the log but do
    /// not affect the return value.  A command killed by SIGPIPE counts
    /// as having exited zero.  A SIGINT or SIGQUIT collected from a
    /// child is re-raised in the host after teardown, preserving
    /// shell-like Ctrl-C behaviour.
    ///
    /// # Panics
    ///
    /// Panics if the pipeline is not started.
    pub fn wait(&mut self) -> Result<i32> {
        self.wait_internal(None)
    }

    /// Like [`wait`](Self::wait), but also returns the raw OS status of
    /// every command, in command order.  The aggregate return code is
    /// 127 if any command failed, and the last command's mapped status
    /// otherwise.
    pub fn wait_all(&mut self) -> Result<(i32, Vec<i32>)> {
        let mut statuses = vec![-1; self.commands.len()];
        let code = self.wait_internal(Some(&mut statuses))?;
        Ok((code, statuses))
    }

    /// Starts the pipeline and waits for it: [`start`](Self::start)
    /// followed by [`wait`](Self::wait).
    pub fn run(mut self) -> Result<i32> {
        self.start()?;
        self.wait()
    }

    fn wait_internal(&mut self, mut collect: Option<&mut Vec<i32>>) -> Result<i32> {
        assert!(self.state == State::Started, "pipeline not started");

        debug!("waiting for pipeline: {}", self);

        let mut ret = 0;

        if let Err(e) = self.close_input() {
            error!("closing pipeline input failed: {}", e);
        }
        if let Err(e) = self.close_output() {
            error!("closing pipeline output failed: {}", e);
            ret = 1;
        }

        let run = Arc::clone(self.run.as_ref().expect("started pipeline has run state"));
        let ncommands = self.commands.len();
        let mut proc_count = ncommands;
        let mut raise_signal = None;
        let mut any_failed = false;

        // Tell the SIGCHLD handler not to get in our way.
        reap::set_queue_mode(true);

        while proc_count > 0 {
            debug!("active processes ({}):", proc_count);

            // Collect any statuses already delivered by the handler or
            // by the previous round before draining again.
            for i in 0..ncommands {
                if run.pid(i) == -1 {
                    continue;
                }
                let raw = run.status(i);
                debug!(
                    "  \"{}\" ({}) -> {}",
                    self.commands[i].name().to_string_lossy(),
                    run.pid(i),
                    raw
                );
                if raw == -1 {
                    continue;
                }
                run.pids[i].store(-1, SeqCst);
                proc_count -= 1;
                if let Some(collect) = collect.as_deref_mut() {
                    collect[i] = raw;
                }

                let mut status = raw;
                if posix::wifsignaled(status) {
                    let sig = posix::wtermsig(status);
                    if sig == posix::SIGPIPE {
                        status = 0;
                    } else if sig == posix::SIGINT || sig == posix::SIGQUIT {
                        // Currently ignored in the host; re-raise once
                        // dispositions are restored.
                        raise_signal = Some(sig);
                    } else if posix::wcoredump(status) {
                        error!(
                            "{}: {} (core dumped)",
                            self.commands[i].name().to_string_lossy(),
                            posix::strsignal(sig)
                        );
                    } else {
                        error!(
                            "{}: {}",
                            self.commands[i].name().to_string_lossy(),
                            posix::strsignal(sig)
                        );
                    }
                } else if !posix::wifexited(status) {
                    error!("unexpected status {}", status);
                }

                self.commands[i].cleanup_function();

                let mapped = if posix::wifsignaled(status) {
                    128 + posix::wtermsig(status)
                } else {
                    posix::wexitstatus(status)
                };
                if mapped != 0 {
                    any_failed = true;
                }
                if i == ncommands - 1 {
                    ret = mapped;
                }
            }

            if proc_count == 0 {
                break;
            }

            if let Err(e) = reap::reap_children(true) {
                // The pipeline was allegedly still running, so running
                // out of children here is impossible.
                reap::set_queue_mode(false);
                return Err(e.into());
            }
        }

        reap::set_queue_mode(false);

        if let Err(e) = reap::unregister(&run) {
            error!("removing pipeline from registry failed: {}", e);
        }
        self.run = None;
        self.state = State::Waited;

        if self.ignore_signals && IGNORED_SIGNALS.fetch_sub(1, SeqCst) == 1 {
            restore_dispositions();
        }

        if let Some(sig) = raise_signal {
            let _ = posix::raise(sig);
        }

        if collect.is_some() && any_failed {
            ret = 127;
        }
        Ok(ret)
    }
}

fn restore_dispositions() {
    let saved = unsafe { (*SAVED.0.get()).take() };
    if let Some((osa_int, osa_quit)) = saved {
        let _ = posix::sig_set(posix::SIGINT, &osa_int);
        let _ = posix::sig_set(posix::SIGQUIT, &osa_quit);
    }
}

fn child_fatal(what: &str, err: io::Error) -> ! {
    eprintln!("{}: {}", what, err);
    posix::_exit(CHILD_FATAL_EXIT_STATUS);
}

/// Post-fork, pre-dispatch setup in the child: wire the standard
/// streams, close every pipe end this child must not hold, and restore
/// signal dispositions.
fn child_setup(
    stdin_fd: Option<RawFd>,
    stdout_fd: Option<RawFd>,
    close_read: Option<RawFd>,
    own_infd: Option<RawFd>,
    own: &RunState,
    ignore_signals: bool,
) {
    // input, reading side
    if let Some(fd) = stdin_fd {
        if let Err(e) = posix::dup2(fd, 0) {
            child_fatal("dup2 failed", e);
        }
        if let Err(e) = posix::close(fd) {
            child_fatal("close failed", e);
        }
    }

    // output, writing side
    if let Some(fd) = stdout_fd {
        if let Err(e) = posix::dup2(fd, 1) {
            child_fatal("dup2 failed", e);
        }
        if let Err(e) = posix::close(fd) {
            child_fatal("close failed", e);
        }
    }

    // output, reading side
    if let Some(fd) = close_read {
        if let Err(e) = posix::close(fd) {
            child_fatal("close failed", e);
        }
    }

    // The write end of the pipeline's own input pipe exists before any
    // fork, so every child has to close it.
    if let Some(fd) = own_infd {
        if let Err(e) = posix::close(fd) {
            child_fatal("close failed", e);
        }
    }

    // Pipe ends belonging to other running pipelines would keep their
    // EOFs from ever arriving.
    reap::close_other_pipeline_fds(own);

    if ignore_signals {
        let saved = unsafe { &*SAVED.0.get() };
        if let Some((osa_int, osa_quit)) = saved {
            let _ = posix::sig_set(posix::SIGINT, osa_int);
            let _ = posix::sig_set(posix::SIGQUIT, osa_quit);
        }
    }

    // Undo the host's SIGPIPE ignore and signal mask before the command
    // runs.
    let _ = posix::reset_sigpipe();
}

/// Runs a command in the already-wired child.  Never returns.
fn start_in_child(cmd: &Command) -> ! {
    if cmd.nice != 0 {
        // Best effort, as with the shell's nice.
        let _ = posix::nice(cmd.nice);
    }

    if cmd.discard_stderr
        && let Ok(devnull) = OpenOptions::new().write(true).open("/dev/null")
    {
        let _ = posix::dup2(devnull.as_raw_fd(), 2);
    }

    for op in &cmd.env {
        let _ = match op {
            EnvOp::Set(name, value) => posix::setenv(name, value),
            EnvOp::Unset(name) => posix::unsetenv(name),
            EnvOp::Clear => posix::clear_inherited_env(),
        };
    }

    match &cmd.kind {
        Kind::Process { argv } => {
            let err = match posix::execvp(&cmd.name, argv) {
                Err(e) => e,
                Ok(()) => unreachable!("execvp returned without error"),
            };
            eprintln!("can't execute {}: {}", cmd.name.to_string_lossy(), err);
            posix::_exit(EXEC_FAILED_EXIT_STATUS);
        }
        Kind::Function { handler } => {
            handler.run();
            handler.cleanup();
            posix::_exit(0);
        }
        Kind::Sequence { commands } => run_sequence(commands),
    }
}

/// Runs the members of a sequence command left to right in forked
/// grandchildren, stopping at the first failure, like `a && b`.
fn run_sequence(commands: &[Command]) -> ! {
    // This child inherited the host's SIGCHLD handler; plain waits need
    // the default disposition.
    if let Err(e) = posix::sig_default(posix::SIGCHLD) {
        child_fatal("can't reset SIGCHLD handler", e);
    }

    for cmd in commands {
        let pid = match unsafe { posix::fork() } {
            Err(e) => child_fatal("fork failed", e),
            Ok(None) => start_in_child(cmd),
            Ok(Some(pid)) => pid,
        };

        let mut status = loop {
            match posix::waitpid(pid, 0) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => child_fatal("waitpid failed", e),
                Ok((_, status)) => break status,
            }
        };

        if posix::wifsignaled(status) {
            let sig = posix::wtermsig(status);
            if sig == posix::SIGPIPE {
                status = 0;
            } else if posix::wcoredump(status) {
                eprintln!(
                    "{}: {} (core dumped)",
                    cmd.name().to_string_lossy(),
                    posix::strsignal(sig)
                );
            } else {
                eprintln!("{}: {}", cmd.name().to_string_lossy(), posix::strsignal(sig));
            }
        } else if !posix::wifexited(status) {
            eprintln!("unexpected status {}", status);
        }

        cmd.cleanup_function();

        if posix::wifsignaled(status) {
            let _ = posix::raise(posix::wtermsig(status));
            posix::_exit(1); // just to make sure
        } else if status != 0 && posix::wifexited(status) {
            posix::_exit(posix::wexitstatus(status));
        }
    }

    posix::_exit(0);
}
