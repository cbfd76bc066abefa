//! Redirects the real stdout/stderr descriptors, so it lives in its own test
//! binary and holds a single test.
#![cfg(unix)]

use std::io::{self, Write};
use std::thread;
use std::time::Duration;
use virterm::VirTerm;

#[test]
fn spaced_writes_keep_their_order_across_channels() {
    let mut term = VirTerm::new();
    term.grab_stdio(false).unwrap();

    for round in 0..3 {
        io::stdout()
            .write_all(format!("out {round}\n").as_bytes())
            .unwrap();
        io::stdout().flush().unwrap();
        thread::sleep(Duration::from_millis(50));
        io::stderr()
            .write_all(format!("err {round}\n").as_bytes())
            .unwrap();
        thread::sleep(Duration::from_millis(50));
    }
    term.release_stdio().unwrap();

    let texts: Vec<String> = term
        .lines()
        .drain()
        .into_iter()
        .map(|line| line.text)
        .filter(|text| text.starts_with("out ") || text.starts_with("err "))
        .collect();
    assert_eq!(
        texts,
        ["out 0\n", "err 0\n", "out 1\n", "err 1\n", "out 2\n", "err 2\n"]
    );
}
