//! Process-wide registry of running pipelines and the SIGCHLD-driven
//! exit-status collector.
//!
//! The registry is a sparse table of slots mutated only with SIGCHLD
//! blocked.  Every datum the signal handler touches is atomic (the slot
//! pointers, the pid and status arrays, the fd mirrors), so the handler
//! never allocates or locks.

use std::io;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering::SeqCst};

use libc::c_int;

use crate::posix;

/// Shared per-run bookkeeping of a started pipeline: one pid and one raw
/// status slot per command, plus the pipeline's caller-visible pipe fds.
///
/// A status of -1 means the command has not exited yet; a pid of -1 means
/// the waiter has already collected that slot.  The fd mirrors exist so
/// that freshly forked children of *other* pipelines can close them.
pub(crate) struct RunState {
    pub(crate) pids: Box<[AtomicI32]>,
    pub(crate) statuses: Box<[AtomicI32]>,
    pub(crate) infd: AtomicI32,
    pub(crate) outfd: AtomicI32,
}

impl RunState {
    pub(crate) fn new(ncommands: usize) -> Arc<RunState> {
        Arc::new(RunState {
            pids: (0..ncommands).map(|_| AtomicI32::new(0)).collect(),
            statuses: (0..ncommands).map(|_| AtomicI32::new(-1)).collect(),
            infd: AtomicI32::new(-1),
            outfd: AtomicI32::new(-1),
        })
    }

    pub(crate) fn pid(&self, i: usize) -> i32 {
        self.pids[i].load(SeqCst)
    }

    pub(crate) fn status(&self, i: usize) -> i32 {
        self.statuses[i].load(SeqCst)
    }
}

/// Capacity of the active-pipeline table.  Each entry is one pointer;
/// hosts do not come anywhere near this many concurrently started
/// pipelines.
const MAX_ACTIVE: usize = 256;

/// Sparse table of started pipelines.  A null slot is free.  Slots are
/// written only with SIGCHLD blocked; the pointee stays alive until the
/// owning pipeline is waited for, which clears the slot first.
static ACTIVE: [AtomicPtr<RunState>; MAX_ACTIVE] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_ACTIVE];

static SIGCHLD_PENDING: AtomicI32 = AtomicI32::new(0);
static QUEUE_SIGCHLD: AtomicBool = AtomicBool::new(false);

pub(crate) fn register(state: &Arc<RunState>) -> io::Result<()> {
    let _block = posix::sigchld_block()?;
    let new = Arc::as_ptr(state) as *mut RunState;
    for slot in &ACTIVE {
        if slot.load(SeqCst).is_null() {
            slot.store(new, SeqCst);
            return Ok(());
        }
    }
    panic!("active-pipeline table full: {} pipelines started", MAX_ACTIVE);
}

pub(crate) fn unregister(state: &Arc<RunState>) -> io::Result<()> {
    let _block = posix::sigchld_block()?;
    let old = Arc::as_ptr(state) as *mut RunState;
    for slot in &ACTIVE {
        if slot.load(SeqCst) == old {
            slot.store(ptr::null_mut(), SeqCst);
        }
    }
    Ok(())
}

/// While queue mode is on, the SIGCHLD handler only counts deliveries and
/// leaves reaping to the waiter.
pub(crate) fn set_queue_mode(on: bool) {
    QUEUE_SIGCHLD.store(on, SeqCst);
}

/// Closes the pipe fds of every registered pipeline other than `own`.
///
/// Called in a freshly forked child, before exec, so that unrelated
/// pipelines do not keep each others' pipe ends alive and block EOF.
pub(crate) fn close_other_pipeline_fds(own: &RunState) {
    for slot in &ACTIVE {
        let p = slot.load(SeqCst);
        if p.is_null() || ptr::eq(p, own) {
            continue;
        }
        let rs = unsafe { &*p };
        let infd = rs.infd.load(SeqCst);
        if infd != -1 {
            let _ = posix::close(infd);
        }
        let outfd = rs.outfd.load(SeqCst);
        if outfd != -1 {
            let _ = posix::close(outfd);
        }
    }
}

/// Stores a collected `(pid, status)` pair into the matching slot of the
/// registry, if any.
fn deliver(pid: i32, status: i32) {
    'slots: for slot in &ACTIVE {
        let p = slot.load(SeqCst);
        if p.is_null() {
            continue;
        }
        let rs = unsafe { &*p };
        for j in 0..rs.pids.len() {
            if rs.pids[j].load(SeqCst) == pid {
                rs.statuses[j].store(status, SeqCst);
                break 'slots;
            }
        }
    }
}

/// Collects exited children and delivers their statuses to the registry.
///
/// One delivered SIGCHLD may correspond to several exits, so the loop is
/// edge-triggered on the pending counter and drains everything available
/// before returning.  Returns the number collected; an error is returned
/// only when nothing was collected at all (notably ECHILD when there are
/// no children left).
pub(crate) fn reap_children(block: bool) -> io::Result<usize> {
    let mut collected = 0usize;
    loop {
        let result = if SIGCHLD_PENDING.load(SeqCst) > 0 {
            // Deal with a SIGCHLD delivery.
            let result = posix::waitpid_any(posix::WNOHANG);
            SIGCHLD_PENDING.fetch_sub(1, SeqCst);
            result
        } else {
            posix::waitpid_any(if block { 0 } else { posix::WNOHANG })
        };

        let (pid, status) = match result {
            Err(ref e) if e.raw_os_error() == Some(posix::EINTR) => continue,
            Err(e) => {
                // Out of children to reap.
                if collected > 0 {
                    return Ok(collected);
                }
                return Err(e);
            }
            Ok((0, _)) => break,
            Ok(got) => got,
        };

        collected += 1;
        deliver(pid, status);

        if SIGCHLD_PENDING.load(SeqCst) == 0 && block {
            break;
        }
    }
    Ok(collected)
}

extern "C" fn sigchld_handler(signum: c_int) {
    // really an assert, but that's not async-signal-safe
    if signum != posix::SIGCHLD {
        return;
    }
    SIGCHLD_PENDING.fetch_add(1, SeqCst);
    if !QUEUE_SIGCHLD.load(SeqCst) {
        let saved_errno = posix::get_errno();
        let _ = reap_children(false);
        posix::set_errno(saved_errno);
    }
}

/// Installs a SIGCHLD handler that collects exit statuses from pipeline
/// children as they terminate.
///
/// Call once per program before the first [`Pipeline::start`].  Without
/// it, statuses are still collected, but only inside [`Pipeline::wait`]
/// and [`pump`], so child deaths are observed later.
///
/// [`Pipeline::start`]: crate::Pipeline::start
/// [`Pipeline::wait`]: crate::Pipeline::wait
/// [`pump`]: crate::pump
pub fn install_sigchld() -> crate::Result<()> {
    posix::install_sigchld_handler(sigchld_handler)?;
    Ok(())
}
