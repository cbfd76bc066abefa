//! Points the real stdout descriptor at a file and captures it with tee, so
//! it lives in its own test binary and holds a single test.
#![cfg(unix)]

use std::fs;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use virterm::VirTerm;

fn dup2(from: &impl AsRawFd, to: libc::c_int) {
    // SAFETY: both descriptors are valid for the duration of the call.
    assert_ne!(unsafe { libc::dup2(from.as_raw_fd(), to) }, -1);
}

#[test]
fn tee_reaches_the_original_destination() {
    let file = tempfile::NamedTempFile::new().unwrap();
    // SAFETY: dup only reads fd 1.
    let raw = unsafe { libc::dup(libc::STDOUT_FILENO) };
    assert_ne!(raw, -1);
    // SAFETY: `raw` was just opened and is owned by nobody else.
    let saved = unsafe { OwnedFd::from_raw_fd(raw) };
    io::stdout().flush().unwrap();
    dup2(file.as_file(), libc::STDOUT_FILENO);

    let mut term = VirTerm::new();
    term.grab_stdout(true).unwrap();
    io::stdout().write_all(b"teed\n").unwrap();
    io::stdout().flush().unwrap();
    term.release_stdout().unwrap();

    dup2(&saved, libc::STDOUT_FILENO);

    assert_eq!(fs::read_to_string(file.path()).unwrap(), "teed\n");
    let line = term.pop_first_line();
    assert_eq!(line.map(|line| line.text), Some("teed\n".to_string()));
}
