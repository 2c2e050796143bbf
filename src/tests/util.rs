use std::fs::File;
use std::io::Write;
use std::mem::ManuallyDrop;
use std::os::unix::io::FromRawFd;
use std::sync::{Mutex, MutexGuard, Once};

static SERIAL: Mutex<()> = Mutex::new(());
static INIT: Once = Once::new();

/// Tests that start pipelines share process-global state: the SIGCHLD
/// handler, the active-pipeline registry, and the interactive-signal
/// dispositions.  The library is single-threaded by contract, so such
/// tests hold this guard to run one at a time.
pub fn serial() -> MutexGuard<'static, ()> {
    INIT.call_once(|| crate::install_sigchld().unwrap());
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// Writes to the true stdout of the process.  Function commands under
/// test must use this rather than `println!`: the test harness redirects
/// macro output into a thread-local capture buffer, which in a forked
/// child never reaches the pipeline's pipe.
pub fn child_print(s: &str) {
    let mut out = ManuallyDrop::new(unsafe { File::from_raw_fd(1) });
    let _ = out.write_all(s.as_bytes());
}
