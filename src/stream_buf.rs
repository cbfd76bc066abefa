use crate::sequencer::{SeqNo, Sequencer};
use log::warn;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

/// How many bytes of history a [StreamBuf] keeps unless told otherwise.
pub const DEFAULT_HISTORY_BYTES: usize = 10_000;

/// One write call's worth of data, tagged with its place in the global write order.
#[derive(Debug)]
pub struct BufItem {
    pub seqno: SeqNo,
    pub timestamp: Instant,
    pub data: Vec<u8>,
}

impl BufItem {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Callback run synchronously, on the writer's thread, for every chunk written
/// to a [StreamBuf].
///
/// Failures are contained: an `Err` or a panic is logged and the remaining
/// handlers still run. Handlers must not write back into the stream they are
/// registered on.
pub trait Handler: Send + Sync {
    fn handle(&self, item: &BufItem) -> anyhow::Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&BufItem) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, item: &BufItem) -> anyhow::Result<()> {
        self(item)
    }
}

/// Token returned by [StreamBuf::add_handler], used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Rolling, size-bounded history of the chunks written to one stream.
///
/// A `StreamBuf` does no locking of its own and expects a single writer; see
/// [crate::VirtualStream] for the shareable wrapper.
pub struct StreamBuf {
    name: String,
    sequencer: Arc<Sequencer>,
    items: VecDeque<Arc<BufItem>>,
    size: usize,
    max_size: usize,
    handlers: Vec<(HandlerId, Arc<dyn Handler>)>,
    next_handler: u64,
}

impl StreamBuf {
    pub fn new(name: impl Into<String>, sequencer: Arc<Sequencer>, max_size: usize) -> Self {
        Self {
            name: name.into(),
            sequencer,
            items: VecDeque::new(),
            size: 0,
            max_size,
            handlers: Vec::new(),
            next_handler: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records `data` as a new chunk and passes it to every handler.
    ///
    /// Returns the sequence number given to the chunk, or `None` for empty
    /// input, which is ignored entirely.
    pub fn write(&mut self, data: &[u8]) -> Option<SeqNo> {
        if data.is_empty() {
            return None;
        }

        let item = Arc::new(BufItem {
            seqno: self.sequencer.next(),
            timestamp: Instant::now(),
            data: data.to_vec(),
        });
        self.size += item.size();
        self.items.push_back(Arc::clone(&item));
        self.evict();

        for (id, handler) in &self.handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(&item))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("{}: handler {:?} failed: {:#}", self.name, id, err),
                Err(_) => warn!("{}: handler {:?} panicked", self.name, id),
            }
        }
        Some(item.seqno)
    }

    pub fn add_handler(&mut self, handler: Arc<dyn Handler>) -> HandlerId {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        self.handlers.push((id, handler));
        id
    }

    /// Returns whether a handler with this id was registered.
    pub fn remove_handler(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(existing, _)| *existing != id);
        self.handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Total bytes currently retained.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of chunks currently retained.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Retained chunks, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &BufItem> {
        self.items.iter().map(|item| item.as_ref())
    }

    /// Retained bytes, oldest first, concatenated.
    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for item in &self.items {
            out.extend_from_slice(&item.data);
        }
        out
    }

    fn evict(&mut self) {
        while self.size > self.max_size {
            match self.items.pop_front() {
                Some(oldest) => self.size -= oldest.size(),
                None => break,
            }
        }
    }
}

impl fmt::Debug for StreamBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBuf")
            .field("name", &self.name)
            .field("items", &self.items.len())
            .field("size", &self.size)
            .field("max_size", &self.max_size)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{BufItem, StreamBuf};
    use crate::sequencer::Sequencer;
    use anyhow::bail;
    use mock_instant::MockClock;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn stream(max_size: usize) -> StreamBuf {
        StreamBuf::new("test", Arc::new(Sequencer::new()), max_size)
    }

    /// A handler that records the data of every chunk it sees.
    fn recorder() -> (Arc<Mutex<Vec<(u64, String)>>>, Arc<dyn super::Handler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |item: &BufItem| -> anyhow::Result<()> {
            sink.lock().unwrap().push((item.seqno, item.text().into_owned()));
            Ok(())
        };
        (seen, Arc::new(handler))
    }

    #[test]
    fn empty_write_is_ignored() {
        let mut buf = stream(100);
        let (seen, handler) = recorder();
        buf.add_handler(handler);
        assert_eq!(buf.write(b""), None);
        assert!(buf.is_empty());
        assert_eq!(buf.size(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn writes_are_tagged_in_order() {
        let mut buf = stream(100);
        assert_eq!(buf.write(b"one"), Some(1));
        assert_eq!(buf.write(b"two"), Some(2));
        let seqnos: Vec<u64> = buf.history().map(|item| item.seqno).collect();
        assert_eq!(seqnos, vec![1, 2]);
        assert_eq!(buf.contents(), b"onetwo");
        assert_eq!(buf.size(), 6);
    }

    #[test]
    fn streams_sharing_a_sequencer_interleave() {
        let sequencer = Arc::new(Sequencer::new());
        let mut out = StreamBuf::new("out", Arc::clone(&sequencer), 100);
        let mut err = StreamBuf::new("err", sequencer, 100);
        assert_eq!(out.write(b"a"), Some(1));
        assert_eq!(err.write(b"b"), Some(2));
        assert_eq!(out.write(b"c"), Some(3));
    }

    #[test]
    fn eviction_keeps_size_within_budget() {
        let mut buf = stream(10);
        for chunk in ["abcd", "efgh", "ijkl", "mnop"] {
            buf.write(chunk.as_bytes());
            assert!(buf.size() <= buf.max_size());
            let total: usize = buf.history().map(BufItem::size).sum();
            assert_eq!(total, buf.size());
        }
        // Oldest chunks go first.
        assert_eq!(buf.contents(), b"ijklmnop");
    }

    #[test]
    fn oversized_chunk_is_evicted_but_still_delivered() {
        let mut buf = stream(4);
        let (seen, handler) = recorder();
        buf.add_handler(handler);
        buf.write(b"far too long");
        assert_eq!(buf.size(), 0);
        assert!(buf.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![(1, "far too long".to_string())]);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let mut buf = stream(100);
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let order = Arc::clone(&order);
            buf.add_handler(Arc::new(move |_: &BufItem| -> anyhow::Result<()> {
                order.lock().unwrap().push(name);
                Ok(())
            }));
        }
        buf.write(b"x");
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn removed_handler_stops_receiving() {
        let mut buf = stream(100);
        let (seen, handler) = recorder();
        let id = buf.add_handler(handler);
        buf.write(b"kept");
        assert!(buf.remove_handler(id));
        assert!(!buf.remove_handler(id));
        buf.write(b"missed");
        assert_eq!(*seen.lock().unwrap(), vec![(1, "kept".to_string())]);
        assert_eq!(buf.handler_count(), 0);
    }

    #[test]
    fn failing_handlers_do_not_reach_the_writer() {
        let mut buf = stream(100);
        buf.add_handler(Arc::new(|_: &BufItem| -> anyhow::Result<()> {
            bail!("broken consumer")
        }));
        buf.add_handler(Arc::new(|_: &BufItem| -> anyhow::Result<()> {
            panic!("crashed consumer")
        }));
        let (seen, handler) = recorder();
        buf.add_handler(handler);

        assert_eq!(buf.write(b"survives"), Some(1));
        assert_eq!(buf.write(b"again"), Some(2));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn chunks_carry_write_time() {
        let mut buf = stream(100);
        buf.write(b"early");
        MockClock::advance(Duration::from_secs(5));
        buf.write(b"late");
        let stamps: Vec<_> = buf.history().map(|item| item.timestamp).collect();
        assert!(stamps[1].duration_since(stamps[0]) >= Duration::from_secs(5));
    }
}
