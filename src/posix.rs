use std::ffi::{CStr, CString, OsStr};
use std::fs::File;
use std::io::{Error, Result};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::c_int;

pub use libc::{
    ECHILD, EINTR, F_GETFL, F_SETFL, O_NONBLOCK, SIGCHLD, SIGHUP, SIGINT, SIGPIPE, SIGQUIT,
    SIGTERM, WNOHANG,
};

fn check_err<T: Ord + Default>(num: T) -> Result<T> {
    if num < T::default() {
        return Err(Error::last_os_error());
    }
    Ok(num)
}

pub fn pipe() -> Result<(File, File)> {
    let mut fds = [0 as c_int; 2];
    check_err(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

/// Forks the process, returning `Some(child_pid)` in the parent and `None`
/// in the child.
///
/// # Safety
///
/// The child must restrict itself to operations that are safe after
/// fork(), and must leave via exec or `_exit`.
pub unsafe fn fork() -> Result<Option<i32>> {
    let pid = check_err(unsafe { libc::fork() })?;
    Ok(if pid == 0 { None } else { Some(pid) })
}

fn os_to_cstring(s: &OsStr) -> Result<CString> {
    let bytes = s.as_bytes();
    if bytes.iter().any(|&b| b == 0) {
        return Err(Error::from_raw_os_error(libc::EINVAL));
    }
    Ok(CString::new(bytes).expect("converting Unix string to C string"))
}

fn cstring_ptr(s: &CString) -> *const libc::c_char {
    s.as_bytes_with_nul().as_ptr() as _
}

pub fn execvp(cmd: impl AsRef<OsStr>, args: &[impl AsRef<OsStr>]) -> Result<()> {
    let args_cstring: Vec<CString> = args
        .iter()
        .map(|x| os_to_cstring(x.as_ref()))
        .collect::<Result<_>>()?;
    let mut args_ptr: Vec<*const libc::c_char> = args_cstring.iter().map(cstring_ptr).collect();
    args_ptr.push(ptr::null());

    let cmd_cstring = os_to_cstring(cmd.as_ref())?;
    check_err(unsafe { libc::execvp(cstring_ptr(&cmd_cstring), args_ptr.as_ptr()) })?;

    Ok(())
}

pub fn _exit(status: i32) -> ! {
    unsafe { libc::_exit(status as c_int) }
}

/// Waits for the given child (or any child when `pid` is -1), returning
/// `(pid, raw_status)`.  With `WNOHANG`, a returned pid of 0 means no
/// child was ready.
pub fn waitpid(pid: i32, flags: i32) -> Result<(i32, i32)> {
    let mut status = 0 as c_int;
    let pid = check_err(unsafe {
        libc::waitpid(
            pid as libc::pid_t,
            &mut status as *mut c_int,
            flags as c_int,
        )
    })?;
    Ok((pid, status))
}

/// Waits for any child.  See [`waitpid`].
pub fn waitpid_any(flags: i32) -> Result<(i32, i32)> {
    waitpid(-1, flags)
}

pub fn kill(pid: i32, signal: i32) -> Result<()> {
    check_err(unsafe { libc::kill(pid as libc::pid_t, signal as c_int) })?;
    Ok(())
}

pub fn raise(signal: i32) -> Result<()> {
    check_err(unsafe { libc::raise(signal as c_int) })?;
    Ok(())
}

pub fn dup2(oldfd: RawFd, newfd: RawFd) -> Result<()> {
    check_err(unsafe { libc::dup2(oldfd, newfd) })?;
    Ok(())
}

pub fn close(fd: RawFd) -> Result<()> {
    check_err(unsafe { libc::close(fd) })?;
    Ok(())
}

pub fn fcntl(fd: RawFd, cmd: i32, arg1: Option<i32>) -> Result<i32> {
    check_err(unsafe {
        match arg1 {
            Some(arg1) => libc::fcntl(fd, cmd, arg1),
            None => libc::fcntl(fd, cmd),
        }
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn errno_location() -> *mut c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn errno_location() -> *mut c_int {
    unsafe { libc::__error() }
}

pub fn get_errno() -> i32 {
    unsafe { *errno_location() }
}

pub fn set_errno(value: i32) {
    unsafe { *errno_location() = value }
}

/// Adjusts the niceness of the calling process.
///
/// `nice()` legitimately returns -1, so errno must be cleared beforehand
/// to detect failure.
pub fn nice(adjustment: i32) -> Result<i32> {
    set_errno(0);
    let r = unsafe { libc::nice(adjustment as c_int) };
    if r == -1 && get_errno() != 0 {
        return Err(Error::last_os_error());
    }
    Ok(r)
}

pub fn setenv(name: &OsStr, value: &OsStr) -> Result<()> {
    let name = os_to_cstring(name)?;
    let value = os_to_cstring(value)?;
    check_err(unsafe { libc::setenv(name.as_ptr(), value.as_ptr(), 1) })?;
    Ok(())
}

pub fn unsetenv(name: &OsStr) -> Result<()> {
    let name = os_to_cstring(name)?;
    check_err(unsafe { libc::unsetenv(name.as_ptr()) })?;
    Ok(())
}

unsafe extern "C" {
    static mut environ: *mut *mut libc::c_char;
}

/// Removes every variable from the environment.  Implemented by unsetting
/// names one at a time since clearenv(3) is not portable.
pub fn clear_inherited_env() -> Result<()> {
    let mut names = Vec::new();
    unsafe {
        let mut cur = environ;
        while !cur.is_null() && !(*cur).is_null() {
            let entry = CStr::from_ptr(*cur).to_bytes();
            let name = match entry.iter().position(|&b| b == b'=') {
                Some(pos) => &entry[..pos],
                None => entry,
            };
            names.push(CString::new(name).expect("environment name with NUL"));
            cur = cur.add(1);
        }
    }
    for name in names {
        check_err(unsafe { libc::unsetenv(name.as_ptr()) })?;
    }
    Ok(())
}

pub fn reset_sigpipe() -> Result<()> {
    // This is called after forking to reset signal handling to the
    // defaults that Unix programs expect.  Quoting
    // std::process::Command::do_exec:
    //
    // """
    // libstd ignores SIGPIPE, and signal-handling libraries often set
    // a mask. Child processes inherit ignored signals and the signal
    // mask from their parent, but most UNIX programs do not reset
    // these things on their own, so we need to clean things up now to
    // avoid confusing the program we're about to run.
    // """

    unsafe {
        let mut set = mem::MaybeUninit::<libc::sigset_t>::uninit();
        check_err(libc::sigemptyset(set.as_mut_ptr()))?;
        check_err(libc::pthread_sigmask(
            libc::SIG_SETMASK,
            set.as_ptr(),
            ptr::null_mut(),
        ))?;
        let ret = libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        if ret == libc::SIG_ERR {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

fn empty_sigaction() -> Result<libc::sigaction> {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    check_err(unsafe { libc::sigemptyset(&mut sa.sa_mask) })?;
    Ok(sa)
}

fn sig_swap(signal: i32, new: &libc::sigaction) -> Result<libc::sigaction> {
    let mut old: libc::sigaction = unsafe { mem::zeroed() };
    check_err(unsafe { libc::sigaction(signal, new, &mut old) })?;
    Ok(old)
}

/// Sets the disposition of `signal` to ignore, returning the previous
/// disposition.
pub fn sig_ignore(signal: i32) -> Result<libc::sigaction> {
    let mut sa = empty_sigaction()?;
    sa.sa_sigaction = libc::SIG_IGN;
    sig_swap(signal, &sa)
}

/// Resets the disposition of `signal` to the default.
pub fn sig_default(signal: i32) -> Result<()> {
    let mut sa = empty_sigaction()?;
    sa.sa_sigaction = libc::SIG_DFL;
    sig_swap(signal, &sa)?;
    Ok(())
}

pub fn sig_get(signal: i32) -> Result<libc::sigaction> {
    let mut old: libc::sigaction = unsafe { mem::zeroed() };
    check_err(unsafe { libc::sigaction(signal, ptr::null(), &mut old) })?;
    Ok(old)
}

pub fn sig_set(signal: i32, sa: &libc::sigaction) -> Result<()> {
    check_err(unsafe { libc::sigaction(signal, sa, ptr::null_mut()) })?;
    Ok(())
}

/// Installs `handler` for SIGCHLD.  The handler mask covers the other
/// signals the library manipulates so that the handler is not interrupted
/// by them.
pub fn install_sigchld_handler(handler: extern "C" fn(c_int)) -> Result<()> {
    let mut sa = empty_sigaction()?;
    sa.sa_sigaction = handler as usize;
    unsafe {
        for sig in [SIGINT, SIGTERM, SIGHUP, SIGCHLD] {
            check_err(libc::sigaddset(&mut sa.sa_mask, sig))?;
        }
    }
    sa.sa_flags = libc::SA_NOCLDSTOP | libc::SA_RESTART;
    sig_set(SIGCHLD, &sa)
}

/// Blocks SIGCHLD delivery for the lifetime of the returned guard.
pub struct SigChldBlock {
    saved: libc::sigset_t,
}

pub fn sigchld_block() -> Result<SigChldBlock> {
    unsafe {
        let mut set = mem::MaybeUninit::<libc::sigset_t>::uninit();
        check_err(libc::sigemptyset(set.as_mut_ptr()))?;
        check_err(libc::sigaddset(set.as_mut_ptr(), SIGCHLD))?;
        let mut saved = mem::MaybeUninit::<libc::sigset_t>::uninit();
        loop {
            match check_err(libc::sigprocmask(
                libc::SIG_BLOCK,
                set.as_ptr(),
                saved.as_mut_ptr(),
            )) {
                Err(ref e) if e.raw_os_error() == Some(EINTR) => continue,
                other => {
                    other?;
                    break;
                }
            }
        }
        Ok(SigChldBlock {
            saved: saved.assume_init(),
        })
    }
}

impl Drop for SigChldBlock {
    fn drop(&mut self) {
        loop {
            let r = unsafe { libc::sigprocmask(libc::SIG_SETMASK, &self.saved, ptr::null_mut()) };
            if r == -1 && get_errno() == EINTR {
                continue;
            }
            break;
        }
    }
}

pub fn wifexited(status: i32) -> bool {
    libc::WIFEXITED(status)
}

pub fn wexitstatus(status: i32) -> i32 {
    libc::WEXITSTATUS(status)
}

pub fn wifsignaled(status: i32) -> bool {
    libc::WIFSIGNALED(status)
}

pub fn wtermsig(status: i32) -> i32 {
    libc::WTERMSIG(status)
}

pub fn wcoredump(status: i32) -> bool {
    libc::WCOREDUMP(status)
}

/// Returns a human-readable description of a signal number.
pub fn strsignal(signal: i32) -> String {
    let desc = unsafe { libc::strsignal(signal as c_int) };
    if desc.is_null() {
        return format!("signal {}", signal);
    }
    unsafe { CStr::from_ptr(desc) }
        .to_string_lossy()
        .into_owned()
}

#[repr(transparent)]
pub struct PollFd(libc::pollfd);

impl PollFd {
    pub fn new(fd: Option<RawFd>, events: i16) -> PollFd {
        PollFd(libc::pollfd {
            fd: fd.unwrap_or(-1),
            events,
            revents: 0,
        })
    }
    pub fn test(&self, mask: i16) -> bool {
        self.0.revents & mask != 0
    }
}

pub use libc::{POLLERR, POLLHUP, POLLIN, POLLOUT};

pub fn poll(fds: &mut [PollFd], timeout: Option<Duration>) -> Result<usize> {
    let timeout = timeout.map_or(-1, |d| d.as_millis() as i32);
    let cnt;
    unsafe {
        let fds_ptr = fds.as_mut_ptr() as *mut libc::pollfd;
        cnt = check_err(libc::poll(fds_ptr, fds.len() as libc::nfds_t, timeout))?;
    }
    Ok(cnt as usize)
}
