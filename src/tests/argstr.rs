use crate::Command;
use crate::command::argstr_words;

fn words(s: &str) -> Vec<String> {
    argstr_words(s).unwrap()
}

#[test]
fn plain_words() {
    assert_eq!(words("echo foo bar"), ["echo", "foo", "bar"]);
}

#[test]
fn whitespace_split_matches_str_split() {
    let s = "nroff -mandoc -Tutf8 -c";
    let expected: Vec<&str> = s.split_whitespace().collect();
    assert_eq!(words(s), expected);
}

#[test]
fn extra_whitespace() {
    assert_eq!(words("  echo \t foo  "), ["echo", "foo"]);
}

#[test]
fn quoting() {
    assert_eq!(
        words("echo 'a b' \"c\\\"d\""),
        ["echo", "a b", "c\"d"]
    );
}

#[test]
fn single_quotes_are_literal() {
    assert_eq!(words(r#"tr 'a\b' '$x'"#), ["tr", r"a\b", "$x"]);
}

#[test]
fn double_quote_escapes() {
    // Backslash is special only before $, `, ", and backslash.
    assert_eq!(words(r#""a\$b""#), ["a$b"]);
    assert_eq!(words(r#""a\\b""#), [r"a\b"]);
    assert_eq!(words(r#""a\xb""#), [r"a\xb"]);
}

#[test]
fn backslash_outside_quotes() {
    assert_eq!(words(r"a\ b"), ["a b"]);
    assert_eq!(words(r"a\'b"), ["a'b"]);
}

#[test]
fn adjacent_quotes_concatenate() {
    assert_eq!(words(r#"a'b c'"d e"f"#), ["ab cd ef"]);
}

#[test]
fn empty_quotes_make_empty_word() {
    assert_eq!(words("'' x"), ["", "x"]);
}

#[test]
fn unterminated_single_quote_fails() {
    assert!(argstr_words("echo 'unterminated").is_err());
}

#[test]
fn unterminated_double_quote_fails() {
    assert!(argstr_words("echo \"unterminated").is_err());
}

#[test]
fn trailing_backslash_fails() {
    assert!(argstr_words("echo foo\\").is_err());
}

#[test]
fn from_argstr_builds_command() {
    let cmd = Command::from_argstr("grep -F 'a b'").unwrap();
    assert_eq!(cmd.to_string(), "grep -F a b");
}

#[test]
fn from_argstr_drops_leading_exec() {
    let cmd = Command::from_argstr("exec echo foo").unwrap();
    assert_eq!(cmd.to_string(), "echo foo");
}

#[test]
fn from_argstr_rejects_empty() {
    assert!(Command::from_argstr("").is_err());
    assert!(Command::from_argstr("exec").is_err());
}

#[test]
fn argstr_appends_to_command() {
    let cmd = Command::new("col").argstr("-b -p -x").unwrap();
    assert_eq!(cmd.to_string(), "col -b -p -x");
}
