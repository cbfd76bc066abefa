//! Background consumer that hands completed lines to async code.

use crate::line_buffer::{Line, LineBuffer};
use log::debug;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// A thread that blocks on a [LineBuffer] and forwards each line, in order,
/// to an unbounded tokio channel.
///
/// The thread exits when [Feeder::stop] is called (or the feeder is dropped)
/// or when the receiving side goes away. Both are checked after every wait,
/// so shutdown takes at most one poll interval.
pub struct Feeder {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Feeder {
    pub fn spawn(
        lines: Arc<LineBuffer>,
        poll: Duration,
    ) -> io::Result<(Self, UnboundedReceiver<Line>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = std::thread::Builder::new().name("virterm-feeder".into()).spawn({
            let stop = Arc::clone(&stop);
            move || feed(&lines, &tx, &stop, poll)
        })?;
        Ok((
            Self {
                stop,
                handle: Some(handle),
            },
            rx,
        ))
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Asks the thread to exit and waits for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn feed(lines: &LineBuffer, tx: &UnboundedSender<Line>, stop: &AtomicBool, poll: Duration) {
    debug!("feeder started");
    while !stop.load(Ordering::SeqCst) && !tx.is_closed() {
        match lines.pop_first_line() {
            Some(line) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            None => {
                lines.has_data().wait_up(Some(poll));
            }
        }
    }
    debug!("feeder stopped");
}

#[cfg(test)]
mod test {
    use super::Feeder;
    use crate::line_buffer::{Line, LineBuffer};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    const POLL: Duration = Duration::from_millis(10);

    fn line(seqno: u64, text: &str) -> Line {
        Line {
            text: text.into(),
            seqno,
            is_err: false,
        }
    }

    #[tokio::test]
    async fn forwards_lines_in_sequence_order() {
        let lines = Arc::new(LineBuffer::new());
        lines.insert_line(line(2, "second\n"));
        lines.insert_line(line(1, "first\n"));
        let (feeder, mut rx) = Feeder::spawn(Arc::clone(&lines), POLL).unwrap();

        let first = timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
        assert_eq!(first.unwrap().text, "first\n");
        assert_eq!(second.unwrap().text, "second\n");

        // Lines arriving after the queue ran dry still get through.
        lines.insert_line(line(3, "third\n"));
        let third = timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
        assert_eq!(third.unwrap().seqno, 3);
        assert!(lines.is_empty());

        feeder.stop();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn exits_when_receiver_is_dropped() {
        let lines = Arc::new(LineBuffer::new());
        let (feeder, rx) = Feeder::spawn(Arc::clone(&lines), POLL).unwrap();
        drop(rx);
        timeout(Duration::from_secs(10), async {
            while !feeder.is_finished() {
                tokio::time::sleep(POLL).await;
            }
        })
        .await
        .unwrap();
    }
}
