//! Redirects the real stdout descriptor and lets a child process inherit it,
//! so it lives in its own test binary and holds a single test.
#![cfg(unix)]

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use virterm::VirTerm;

#[test]
fn release_does_not_wait_for_children_holding_the_pipe() {
    let mut term = VirTerm::new();
    term.grab_stdout(false).unwrap();

    let mut child = Command::new("sh")
        .args(["-c", "echo from child; exec sleep 5"])
        .stdout(Stdio::inherit())
        .spawn()
        .unwrap();
    let line = term.pop_line_timeout(Some(Duration::from_secs(5)));
    assert_eq!(line.map(|line| line.text), Some("from child\n".to_string()));

    // The child still holds the write end of the pipe.
    let start = Instant::now();
    term.release_stdout().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));

    child.kill().unwrap();
    child.wait().unwrap();
}
