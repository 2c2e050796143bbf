use std::fs::File;
use std::io::Write;

use tempfile::TempDir;

use crate::tests::util;
use crate::{Command, Pipeline, Redirection};

fn printing(text: &str) -> Pipeline {
    let mut p = Pipeline::from_commands([Command::new("printf").arg(text)]);
    p.stdout(Redirection::Pipe);
    p
}

#[test]
fn peek_then_read_same_bytes() {
    let _guard = util::serial();
    let mut p = printing("hello world");
    p.start().unwrap();
    let peeked = p.peek(5).unwrap().to_vec();
    assert_eq!(p.peek_size(), 5);
    let read = p.read(5).unwrap().to_vec();
    assert_eq!(peeked, read);
    assert_eq!(read, b"hello");
    p.wait().unwrap();
}

#[test]
fn peek_skip_consumes_only_peeked_data() {
    let _guard = util::serial();
    let mut p = printing("foobar");
    p.start().unwrap();
    assert_eq!(p.peek(3).unwrap(), b"foo");
    p.peek_skip(p.peek_size());
    assert_eq!(p.peek_size(), 0);
    assert_eq!(p.read(3).unwrap(), b"bar");
    p.wait().unwrap();
}

#[test]
fn short_peek_then_longer_read() {
    let _guard = util::serial();
    let mut p = printing("abcdef");
    p.start().unwrap();
    assert_eq!(p.peek(2).unwrap(), b"ab");
    // The read is served from the peek region first, topped up from the
    // stream.
    assert_eq!(p.read(6).unwrap(), b"abcdef");
    p.wait().unwrap();
}

#[test]
fn read_at_eof_returns_empty() {
    let _guard = util::serial();
    let mut p = printing("x");
    p.start().unwrap();
    assert_eq!(p.read(1).unwrap(), b"x");
    assert_eq!(p.read(16).unwrap(), b"");
    p.wait().unwrap();
}

#[test]
fn readline_without_trailing_newline() {
    let _guard = util::serial();
    let mut p = printing("abc");
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"abc"[..]));
    assert_eq!(p.readline().unwrap(), None);
    p.wait().unwrap();
}

#[test]
fn readline_keeps_nul_bytes() {
    let _guard = util::serial();
    let mut p = printing(r"a\0b\nrest\n");
    p.start().unwrap();
    assert_eq!(p.readline().unwrap(), Some(&b"a\0b\n"[..]));
    assert_eq!(p.readline().unwrap(), Some(&b"rest\n"[..]));
    p.wait().unwrap();
}

#[test]
fn peekline_does_not_consume() {
    let _guard = util::serial();
    let mut p = printing(r"one\ntwo\n");
    p.start().unwrap();
    assert_eq!(p.peekline().unwrap(), Some(&b"one\n"[..]));
    assert_eq!(p.readline().unwrap(), Some(&b"one\n"[..]));
    assert_eq!(p.readline().unwrap(), Some(&b"two\n"[..]));
    assert_eq!(p.readline().unwrap(), None);
    p.wait().unwrap();
}

/// A line longer than two peek blocks must come back intact, twice in a
/// row on fresh pipelines to exercise the line cache.
#[test]
fn reading_long_line() {
    const LINE_LEN: usize = 9000;

    let _guard = util::serial();
    let alphanum: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut line: Vec<u8> = (0..LINE_LEN).map(|i| alphanum[i % alphanum.len()]).collect();
    line.push(b'\n');

    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("test");
    File::create(&tmpname).unwrap().write_all(&line).unwrap();

    for _ in 0..2 {
        let mut p = Pipeline::new();
        p.stdin(Redirection::Path(tmpname.clone()));
        p.stdout(Redirection::Pipe);
        p.start().unwrap();
        let mut read_back = Vec::new();
        while let Some(chunk) = p.readline().unwrap() {
            read_back.extend_from_slice(chunk);
        }
        assert_eq!(read_back, line);
        p.wait().unwrap();
    }
}
