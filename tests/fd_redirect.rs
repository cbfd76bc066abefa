//! Redirects the real stdout/stderr descriptors, so it lives in its own test
//! binary and holds a single test.
#![cfg(unix)]

use std::io::{self, Write};
use virterm::{StreamKind, VirTerm};

#[test]
fn captures_real_descriptors() {
    let mut term = VirTerm::new();
    term.grab_stdio(false).unwrap();
    assert!(matches!(
        term.grab_stdout(false),
        Err(virterm::VirTermError::AlreadyGrabbed(StreamKind::Normal))
    ));

    // Bypasses the test harness's print capture and hits fd 1 and 2 directly.
    io::stdout().write_all(b"to stdout\npartial").unwrap();
    io::stdout().flush().unwrap();
    io::stderr().write_all(b"to stderr\n").unwrap();

    // Restoring drains whatever is already in the pipes.
    term.release_stdio().unwrap();
    assert!(!term.is_grabbed(StreamKind::Normal));

    let lines = term.lines().drain();
    let texts = |kind: StreamKind| -> Vec<String> {
        lines
            .iter()
            .filter(|line| line.kind() == kind)
            .map(|line| line.text.clone())
            .collect()
    };
    assert!(texts(StreamKind::Normal).contains(&"to stdout\n".to_string()));
    assert!(texts(StreamKind::Error).contains(&"to stderr\n".to_string()));
    assert!(term
        .lines()
        .pending(StreamKind::Normal)
        .ends_with(b"partial"));

    let seqnos: Vec<_> = lines.iter().map(|line| line.seqno).collect();
    let mut sorted = seqnos.clone();
    sorted.sort_unstable();
    assert_eq!(seqnos, sorted);
}
