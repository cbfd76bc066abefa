use crate::sequencer::{SeqNo, Sequencer};
use crate::stream_buf::{BufItem, Handler, HandlerId, StreamBuf};
use parking_lot::{Mutex, MutexGuard};
use std::io::{self, Write};
use std::sync::Arc;

/// File-like handle to a [StreamBuf] that can stand in for stdout or stderr.
///
/// Clones share the same buffer. Writes are serialized by a mutex, so several
/// threads may write through clones of one stream; handlers run while that
/// mutex is held, which keeps one stream's chunks in write order.
#[derive(Debug, Clone)]
pub struct VirtualStream {
    buf: Arc<Mutex<StreamBuf>>,
    tee: Arc<Mutex<Option<HandlerId>>>,
}

/// Forwards raw chunks to the destination a stream replaced.
struct Tee {
    dest: Mutex<Box<dyn Write + Send>>,
}

impl Handler for Tee {
    fn handle(&self, item: &BufItem) -> anyhow::Result<()> {
        let mut dest = self.dest.lock();
        dest.write_all(&item.data)?;
        dest.flush()?;
        Ok(())
    }
}

impl VirtualStream {
    pub fn new(name: impl Into<String>, sequencer: Arc<Sequencer>, max_size: usize) -> Self {
        Self {
            buf: Arc::new(Mutex::new(StreamBuf::new(name, sequencer, max_size))),
            tee: Arc::new(Mutex::new(None)),
        }
    }

    /// Buffers `data` as one chunk. See [StreamBuf::write].
    pub fn write_chunk(&self, data: &[u8]) -> Option<SeqNo> {
        self.lock().write(data)
    }

    pub fn add_handler(&self, handler: Arc<dyn Handler>) -> HandlerId {
        self.lock().add_handler(handler)
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.lock().remove_handler(id)
    }

    /// Mirrors every later chunk to `dest`, replacing any previous tee.
    pub fn set_tee(&self, dest: Box<dyn Write + Send>) {
        let mut tee = self.tee.lock();
        let mut buf = self.lock();
        if let Some(old) = tee.take() {
            buf.remove_handler(old);
        }
        *tee = Some(buf.add_handler(Arc::new(Tee {
            dest: Mutex::new(dest),
        })));
    }

    /// Stops mirroring. Returns whether a tee was installed.
    pub fn clear_tee(&self) -> bool {
        let mut tee = self.tee.lock();
        match tee.take() {
            Some(id) => self.lock().remove_handler(id),
            None => false,
        }
    }

    pub fn is_teeing(&self) -> bool {
        self.tee.lock().is_some()
    }

    /// Runs `f` against the underlying buffer, e.g. to inspect its history.
    pub fn with_buf<T>(&self, f: impl FnOnce(&StreamBuf) -> T) -> T {
        f(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, StreamBuf> {
        self.buf.lock()
    }
}

impl Write for VirtualStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_chunk(data);
        Ok(data.len())
    }

    // Chunks are buffered as soon as they are written.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &VirtualStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_chunk(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::VirtualStream;
    use crate::sequencer::Sequencer;
    use crate::stream_buf::BufItem;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    /// A `Write` whose bytes stay inspectable after it has been boxed away.
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn stream() -> VirtualStream {
        VirtualStream::new("out", Arc::new(Sequencer::new()), 1000)
    }

    #[test]
    fn write_macros_buffer_chunks() {
        let mut out = stream();
        write!(out, "hello {}", 42).unwrap();
        out.flush().unwrap();
        assert_eq!(out.with_buf(|buf| buf.contents()), b"hello 42");
    }

    #[test]
    fn clones_share_one_buffer() {
        let out = stream();
        let mut other = out.clone();
        other.write_all(b"shared").unwrap();
        assert_eq!(out.with_buf(|buf| buf.size()), 6);
    }

    #[test]
    fn tee_mirrors_until_cleared() {
        let out = stream();
        let real = Shared::default();
        out.set_tee(Box::new(real.clone()));
        assert!(out.is_teeing());

        out.write_chunk(b"seen twice ");
        assert!(out.clear_tee());
        assert!(!out.clear_tee());
        out.write_chunk(b"only buffered");

        assert_eq!(*real.0.lock().unwrap(), b"seen twice ");
        assert_eq!(
            out.with_buf(|buf| buf.contents()),
            b"seen twice only buffered"
        );
    }

    #[test]
    fn tee_runs_alongside_other_handlers() {
        let out = stream();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        out.add_handler(Arc::new(move |_: &BufItem| -> anyhow::Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        }));
        let real = Shared::default();
        out.set_tee(Box::new(real.clone()));
        out.set_tee(Box::new(real.clone()));

        out.write_chunk(b"x");
        assert_eq!(*count.lock().unwrap(), 1);
        // Replacing the tee must not leave the old one installed.
        assert_eq!(*real.0.lock().unwrap(), b"x");
        assert_eq!(out.with_buf(|buf| buf.handler_count()), 2);
    }

    #[test]
    fn concurrent_writers_are_serialized() {
        let out = stream();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let out = out.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        out.write_chunk(b"ab");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        out.with_buf(|buf| {
            assert_eq!(buf.len(), 200);
            assert_eq!(buf.size(), 400);
        });
    }
}
