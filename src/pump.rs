//! Moving data from source pipelines into their connected sinks using
//! non-blocking writes and readiness multiplexing.

use std::cmp::min;
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;

use log::{debug, error};

use crate::error::Result;
use crate::pipeline::{Pipeline, State};
use crate::posix;

/// Pumps data among pipelines connected with [`connect`] until every
/// source has reached end-of-file and everything read has been written
/// to every sink (or the sink has failed).
///
/// All related pipelines must be supplied in one call: a sink may not be
/// passed without its source.  Pipelines not yet started are started
/// first; none of them are waited for.
///
/// A sink dying underneath the pump (EPIPE) is silently dropped from the
/// fan-out; any other write error is reported once the remaining sinks
/// have been pumped dry.
///
/// # Panics
///
/// Panics if a supplied sink's source pipeline is missing from the call.
///
/// [`connect`]: crate::connect
pub fn pump(pipelines: &mut [&mut Pipeline]) -> Result<()> {
    let argc = pipelines.len();

    for p in pipelines.iter_mut() {
        if p.state == State::Built {
            p.start()?;
        }
    }

    // Resolve each sink's source to an index within the call.
    let mut known_source = vec![false; argc];
    let mut src_index: Vec<Option<usize>> = vec![None; argc];
    for i in 0..argc {
        let Some(source_id) = pipelines[i].source else {
            continue;
        };
        let j = (0..argc)
            .find(|&j| pipelines[j].id == source_id)
            .expect("sink pumped without its source pipeline");
        known_source[j] = true;
        src_index[i] = Some(j);
    }

    // Switch the visible fds to non-blocking, remembering which of them
    // to switch back.
    let mut blocking_in = vec![false; argc];
    let mut blocking_out = vec![false; argc];
    for i in 0..argc {
        if let Some(f) = pipelines[i].input() {
            let fd = f.as_raw_fd();
            let flags = posix::fcntl(fd, posix::F_GETFL, None)?;
            if flags & posix::O_NONBLOCK == 0 {
                blocking_in[i] = true;
                posix::fcntl(fd, posix::F_SETFL, Some(flags | posix::O_NONBLOCK))?;
            }
        }
        if let Some(f) = pipelines[i].output() {
            let fd = f.as_raw_fd();
            let flags = posix::fcntl(fd, posix::F_GETFL, None)?;
            if flags & posix::O_NONBLOCK == 0 {
                blocking_out[i] = true;
                posix::fcntl(fd, posix::F_SETFL, Some(flags | posix::O_NONBLOCK))?;
            }
        }
    }

    // A dead sink must surface as EPIPE rather than a signal, and child
    // death must interrupt poll rather than restart it.
    let osa_sigpipe = posix::sig_ignore(posix::SIGPIPE)?;
    let mut sa_chld = posix::sig_get(posix::SIGCHLD)?;
    sa_chld.sa_flags &= !libc::SA_RESTART;
    posix::sig_set(posix::SIGCHLD, &sa_chld)?;

    let result = pump_loop(pipelines, &known_source, &src_index);

    if let Ok(mut sa_chld) = posix::sig_get(posix::SIGCHLD) {
        sa_chld.sa_flags |= libc::SA_RESTART;
        let _ = posix::sig_set(posix::SIGCHLD, &sa_chld);
    }
    let _ = posix::sig_set(posix::SIGPIPE, &osa_sigpipe);

    for i in 0..argc {
        if blocking_in[i] && let Some(f) = pipelines[i].input() {
            let fd = f.as_raw_fd();
            if let Ok(flags) = posix::fcntl(fd, posix::F_GETFL, None) {
                let _ = posix::fcntl(fd, posix::F_SETFL, Some(flags & !posix::O_NONBLOCK));
            }
        }
        if blocking_out[i] && let Some(f) = pipelines[i].output() {
            let fd = f.as_raw_fd();
            if let Ok(flags) = posix::fcntl(fd, posix::F_GETFL, None) {
                let _ = posix::fcntl(fd, posix::F_SETFL, Some(flags & !posix::O_NONBLOCK));
            }
        }
    }

    result
}

fn pump_loop(
    pieces: &mut [&mut Pipeline],
    known_source: &[bool],
    src_index: &[Option<usize>],
) -> Result<()> {
    let argc = pieces.len();
    // Per-sink cursor into its source's peek region.
    let mut pos = vec![0usize; argc];
    let mut dying_source = vec![false; argc];
    let mut waiting = vec![false; argc];
    let mut write_error: Vec<Option<io::Error>> = (0..argc).map(|_| None).collect();

    loop {
        // A source that has died with its data fully buffered lets its
        // sinks see EOF.
        for i in 0..argc {
            if !known_source[i] || pieces[i].outfd.is_some() || pieces[i].peek_size() > 0 {
                continue;
            }
            for j in 0..argc {
                if src_index[j] == Some(i)
                    && pieces[j].infd.is_some()
                    && let Err(e) = pieces[j].close_input()
                {
                    error!("closing pipeline input failed: {}", e);
                }
            }
        }

        // A source none of whose sinks are left has nobody to read for.
        for i in 0..argc {
            if !known_source[i] || pieces[i].outfd.is_none() {
                continue;
            }
            let got_sink =
                (0..argc).any(|j| src_index[j] == Some(i) && pieces[j].infd.is_some());
            if got_sink {
                continue;
            }
            if let Err(e) = pieces[i].close_output() {
                error!("closing pipeline output failed: {}", e);
            }
        }

        // Build the readiness sets.
        let mut fds = Vec::new();
        let mut fd_owner = Vec::new();
        for i in 0..argc {
            // Input to a sink pipeline.
            if src_index[i].is_some() && !waiting[i] {
                if let Some(f) = pieces[i].input() {
                    fds.push(posix::PollFd::new(Some(f.as_raw_fd()), posix::POLLOUT));
                    fd_owner.push((i, true));
                }
            }
            // Output from a source pipeline.
            if known_source[i] && let Some(f) = pieces[i].output() {
                fds.push(posix::PollFd::new(Some(f.as_raw_fd()), posix::POLLIN));
                fd_owner.push((i, false));
            }
        }
        if fds.is_empty() {
            break; // nothing meaningful left to do
        }

        match posix::poll(&mut fds, None) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                // Did a source or sink pipeline die?
                for i in 0..argc {
                    if pieces[i].commands.is_empty() {
                        continue;
                    }
                    if known_source[i] && !dying_source[i] && pieces[i].outfd.is_some() {
                        let last = pieces[i].commands.len() - 1;
                        if pieces[i].run_state().status(last) != -1 {
                            debug!("source pipeline {} died", i);
                            dying_source[i] = true;
                        }
                    }
                    if src_index[i].is_some()
                        && pieces[i].infd.is_some()
                        && pieces[i].run_state().status(0) != -1
                    {
                        debug!("sink pipeline {} died", i);
                        let _ = pieces[i].close_input();
                    }
                }
                continue;
            }
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        let mut read_ready = vec![false; argc];
        let mut write_ready = vec![false; argc];
        for (k, &(i, is_sink)) in fd_owner.iter().enumerate() {
            if is_sink {
                write_ready[i] = fds[k].test(posix::POLLOUT | posix::POLLERR);
            } else {
                read_ready[i] = fds[k].test(posix::POLLIN | posix::POLLHUP | posix::POLLERR);
            }
        }

        // Read a block of data from each available source pipeline.
        for i in 0..argc {
            if !known_source[i] || pieces[i].outfd.is_none() || !read_ready[i] {
                continue;
            }
            let peek_size = pieces[i].peek_size();
            let eof_or_error = match pieces[i].peek(peek_size + 4096) {
                Err(_) => true,
                Ok(block) => block.len() == peek_size,
            };
            if eof_or_error {
                debug!("source pipeline {} returned error or EOF", i);
                let _ = pieces[i].close_output();
            } else {
                // Any read re-enables every sink, including sinks fed by
                // other sources; the extra poll passes cost less than
                // per-edge tracking.
                waiting.fill(false);
            }
        }

        // Write as much as we can to each available sink pipeline.
        for i in 0..argc {
            let Some(si) = src_index[i] else {
                continue;
            };
            if pieces[i].infd.is_none() || !write_ready[i] {
                continue;
            }
            let peek_size = pieces[si].peek_size();
            if peek_size <= pos[i] {
                // Nothing new from the source; drop out of the writable
                // set so we neither spin nor block on a slow source.
                waiting[i] = true;
                continue;
            }

            // The block is already in the source's peek cache; write as
            // much of it as the sink will take.
            let wrote = {
                let block = pieces[si].peek_region();
                let mut sink = pieces[i].input().expect("sink input open");
                loop {
                    match sink.write(&block[pos[i]..]) {
                        Ok(n) => break Ok(n),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(0),
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => break Err(e),
                    }
                }
            };
            match wrote {
                Ok(n) => pos[i] += n,
                Err(e) => {
                    // The other sinks may still be able to finish, so
                    // hold the error until the loop is done.
                    if e.raw_os_error() != Some(libc::EPIPE) {
                        write_error[i] = Some(e);
                    }
                    let _ = pieces[i].close_input();
                    continue;
                }
            }

            let mut minpos = pos[i];
            let source_dead = pieces[si].outfd.is_none();
            for j in 0..argc {
                if src_index[j] != Some(si) || pieces[j].infd.is_none() {
                    continue;
                }
                minpos = min(minpos, pos[j]);
                // A dead source fully flushed to this sink means the
                // sink gets its EOF now.
                if source_dead && pos[j] >= peek_size {
                    let _ = pieces[j].close_input();
                }
            }

            // Data delivered to every sink can leave the source's cache.
            pieces[si].peek_skip(minpos);
            for j in 0..argc {
                if src_index[j] == Some(si) {
                    pos[j] = pos[j].saturating_sub(minpos);
                }
            }
        }
    }

    if let Some(e) = write_error.into_iter().flatten().next() {
        return Err(e.into());
    }
    Ok(())
}
