use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::tests::util;
use crate::{Command, Function, Pipeline, Redirection};

#[test]
fn basic_status() {
    let _guard = util::serial();
    let p = Pipeline::from_commands([Command::new("true")]);
    assert_eq!(p.run().unwrap(), 0);
    let p = Pipeline::from_commands([Command::new("false")]);
    assert_ne!(p.run().unwrap(), 0);
}

#[test]
fn basic_args() {
    let _guard = util::serial();
    let mut p = Pipeline::from_commands([Command::new("echo").arg("foo")]);
    p.stdout(Redirection::Pipe);
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"foo\n"[..]));
    assert_eq!(p.wait().unwrap(), 0);

    let mut p = Pipeline::from_commands([Command::new("echo").args(["foo", "bar"])]);
    p.stdout(Redirection::Pipe);
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"foo bar\n"[..]));
    assert_eq!(p.wait().unwrap(), 0);
}

#[test]
fn basic_pipeline() {
    let _guard = util::serial();
    let mut p = Pipeline::new();
    p.command_args("echo", ["foo"]);
    p.command_args("sed", ["-e", "s/foo/bar/"]);
    p.stdout(Redirection::Pipe);
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"bar\n"[..]));
    assert_eq!(p.wait().unwrap(), 0);
}

#[test]
fn argv0_is_basename() {
    let _guard = util::serial();
    let mut p = Pipeline::from_commands([Command::new("/bin/sh").args(["-c", "echo $0"])]);
    p.stdout(Redirection::Pipe);
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"sh\n"[..]));
    assert_eq!(p.wait().unwrap(), 0);
}

#[test]
fn basic_setenv() {
    let _guard = util::serial();
    let p = Pipeline::from_commands([
        Command::new("sh").args(["-c", "exit $TEST1"]).env("TEST1", "10"),
    ]);
    assert_eq!(p.run().unwrap(), 10);
}

#[test]
fn basic_unsetenv() {
    let _guard = util::serial();
    unsafe { std::env::set_var("TEST2", "foo") };

    let mut p = Pipeline::from_commands([Command::new("sh").args(["-c", "echo $TEST2"])]);
    p.stdout(Redirection::Pipe);
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"foo\n"[..]));
    p.wait().unwrap();

    let mut p = Pipeline::from_commands([
        Command::new("sh").args(["-c", "echo $TEST2"]).env_remove("TEST2"),
    ]);
    p.stdout(Redirection::Pipe);
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"\n"[..]));
    p.wait().unwrap();
}

#[test]
fn basic_clearenv() {
    let _guard = util::serial();
    unsafe { std::env::set_var("TEST3", "foo") };

    // Use an absolute path: the exec lookup happens after the
    // environment, including PATH, is cleared.
    let mut p = Pipeline::from_commands([
        Command::new("/bin/sh")
            .args(["-c", "echo x${TEST3}y"])
            .env_clear(),
    ]);
    p.stdout(Redirection::Pipe);
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"xy\n"[..]));
    p.wait().unwrap();

    // Variables set after the clear survive it.
    let mut p = Pipeline::from_commands([
        Command::new("/bin/sh")
            .args(["-c", "echo x${TEST3}y${TEST4}z"])
            .env_clear()
            .env("TEST4", "bar"),
    ]);
    p.stdout(Redirection::Pipe);
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"xybarz\n"[..]));
    p.wait().unwrap();
}

#[test]
fn wait_all_reports_everything() {
    let _guard = util::serial();
    let mut p = Pipeline::new();
    p.command_args("sh", ["-c", "exit 2"]);
    p.command_args("sh", ["-c", "exit 3"]);
    p.command(Command::new("true"));
    p.start().unwrap();
    let (code, statuses) = p.wait_all().unwrap();
    assert_eq!(code, 127);
    assert_eq!(statuses, vec![2 << 8, 3 << 8, 0]);
}

#[test]
fn wait_all_clean() {
    let _guard = util::serial();
    let mut p = Pipeline::new();
    p.command(Command::new("true"));
    p.command(Command::new("true"));
    p.start().unwrap();
    let (code, statuses) = p.wait_all().unwrap();
    assert_eq!(code, 0);
    assert_eq!(statuses, vec![0, 0]);
}

#[test]
fn exec_failure_status() {
    let _guard = util::serial();
    let p = Pipeline::from_commands([
        Command::new("this-command-does-not-exist").discard_stderr(true),
    ]);
    assert_eq!(p.run().unwrap(), 0xff);
}

#[test]
fn discard_stderr_suppresses_output() {
    let _guard = util::serial();
    let mut p = Pipeline::from_commands([
        Command::new("sh")
            .args(["-c", "echo visible; echo hidden >&2"])
            .discard_stderr(true),
    ]);
    p.stdout(Redirection::Pipe);
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"visible\n"[..]));
    assert_eq!(p.readline().unwrap(), None);
    assert_eq!(p.wait().unwrap(), 0);
}

#[test]
fn function_command() {
    let _guard = util::serial();
    let mut p = Pipeline::from_commands([
        Command::function("hello", || util::child_print("hello from the child\n")),
    ]);
    p.stdout(Redirection::Pipe);
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"hello from the child\n"[..]));
    assert_eq!(p.wait().unwrap(), 0);
}

#[test]
fn function_cleanup_runs_in_parent_after_wait() {
    struct Probe(Arc<AtomicUsize>);
    impl Function for Probe {
        fn run(&self) {}
        fn cleanup(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let _guard = util::serial();
    let count = Arc::new(AtomicUsize::new(0));
    let p = Pipeline::from_commands([
        Command::function("probe", Probe(Arc::clone(&count))),
    ]);
    assert_eq!(p.run().unwrap(), 0);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn sequence_collects_outputs() {
    let _guard = util::serial();
    let mut p = Pipeline::new();
    p.command(Command::sequence(
        "echo*3",
        [
            Command::new("echo").arg("foo"),
            Command::new("echo").arg("bar"),
            Command::new("echo").arg("baz"),
        ],
    ));
    p.command(Command::new("xargs"));
    p.stdout(Redirection::Pipe);
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"foo bar baz\n"[..]));
    assert_eq!(p.wait().unwrap(), 0);
}

#[test]
fn sequence_stops_at_first_failure() {
    let _guard = util::serial();
    let mut p = Pipeline::from_commands([Command::sequence(
        "and-chain",
        [
            Command::new("echo").arg("a"),
            Command::new("sh").args(["-c", "exit 7"]),
            Command::new("echo").arg("b"),
        ],
    )]);
    p.stdout(Redirection::Pipe);
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"a\n"[..]));
    assert_eq!(p.readline().unwrap(), None);
    assert_eq!(p.wait().unwrap(), 7);
}

#[test]
fn without_signal_ignoring() {
    let _guard = util::serial();
    let mut p = Pipeline::from_commands([Command::new("true")]);
    p.ignore_signals(false);
    p.start().unwrap();
    assert_eq!(p.wait().unwrap(), 0);
}

#[test]
#[should_panic(expected = "already started")]
fn starting_twice_panics() {
    let _guard = util::serial();
    let mut p = Pipeline::from_commands([Command::new("true")]);
    p.start().unwrap();
    let _ = p.start();
}
