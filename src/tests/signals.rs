use std::time::Duration;

use crate::posix;
use crate::tests::util;
use crate::{Command, Pipeline, Redirection};

#[test]
fn reported_pid_matches_recorded_pid() {
    let _guard = util::serial();
    let mut p = Pipeline::from_commands([Command::function("pid-print", || {
        util::child_print(&format!("{}\n", std::process::id()));
        std::thread::sleep(Duration::from_secs(60));
    })]);
    p.stdout(Redirection::Pipe);
    p.start().unwrap();

    let line = p.readline().unwrap().unwrap();
    let reported: i32 = std::str::from_utf8(line).unwrap().trim().parse().unwrap();
    let recorded = p.pids()[0];
    assert_eq!(reported, recorded);

    posix::kill(recorded, posix::SIGTERM).unwrap();
    assert_eq!(p.wait().unwrap(), 128 + posix::SIGTERM);
}

#[test]
fn death_by_signal_maps_to_128_plus_signal() {
    let _guard = util::serial();
    let p = Pipeline::from_commands([Command::new("sh").args(["-c", "kill -TERM $$"])]);
    assert_eq!(p.run().unwrap(), 128 + posix::SIGTERM);
}

#[test]
fn sigpipe_death_counts_as_success() {
    let _guard = util::serial();
    let mut p = Pipeline::new();
    p.command(Command::new("yes"));
    p.command_args("head", ["-n", "1"]);
    p.stdout(Redirection::Pipe);
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"y\n"[..]));
    let (code, statuses) = p.wait_all().unwrap();
    assert_eq!(code, 0);
    // yes dies of SIGPIPE once head is gone; that is a raw signal
    // status, but it must not make the pipeline fail.
    assert_eq!(statuses[0], posix::SIGPIPE);
    assert_eq!(statuses[1], 0);
}
