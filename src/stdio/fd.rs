use super::StdioBackend;
use crate::line_buffer::StreamKind;
use crate::virtual_stream::VirtualStream;
use log::{debug, warn};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd};

/// Captures the real stdout/stderr file descriptors.
///
/// Each grabbed descriptor is pointed at a pipe. A single pump thread polls
/// the read ends of every grabbed channel and turns each read into one chunk
/// of that channel's [VirtualStream], so it is the only writer of the
/// streams whatever the number of threads (or child processes) printing.
///
/// Ordering across channels is only as fine as the pump's reads: one read
/// may hold several writes, and writes to stdout and stderr that land
/// between two polls are tagged in whichever order the pump reads them.
/// Producers that need the exact order should write through
/// [crate::VirTerm::out] and [crate::VirTerm::err] instead.
///
/// Restoring a channel drains what is already in its pipe and closes it
/// without waiting for other holders of the write end. A child process that
/// inherited the descriptor and keeps printing afterwards gets `EPIPE` (or
/// `SIGPIPE`).
#[derive(Default)]
pub struct FdStdio {
    #[cfg(unix)]
    saved: [Option<OwnedFd>; 2],
    #[cfg(unix)]
    pump: Option<unix::Pump>,
}

impl FdStdio {
    pub fn new() -> Self {
        Self::default()
    }
}

fn flush_std(kind: StreamKind) -> io::Result<()> {
    match kind {
        StreamKind::Normal => io::stdout().flush(),
        StreamKind::Error => io::stderr().flush(),
    }
}

#[cfg(unix)]
mod unix {
    use crate::line_buffer::StreamKind;
    use crate::virtual_stream::VirtualStream;
    use log::{debug, warn};
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::sync::mpsc;
    use std::thread::{self, JoinHandle};

    const READ_SIZE: usize = 4096;

    pub(super) fn target(kind: StreamKind) -> RawFd {
        match kind {
            StreamKind::Normal => libc::STDOUT_FILENO,
            StreamKind::Error => libc::STDERR_FILENO,
        }
    }

    fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        }
    }

    /// Duplicates `fd` with close-on-exec set.
    pub(super) fn dup(fd: RawFd) -> io::Result<OwnedFd> {
        // SAFETY: F_DUPFD_CLOEXEC only reads `fd`; a fresh descriptor is returned on success.
        let new = cvt(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) })?;
        // SAFETY: `new` was just opened and is owned by nobody else.
        Ok(unsafe { OwnedFd::from_raw_fd(new) })
    }

    pub(super) fn dup2(from: &OwnedFd, to: RawFd) -> io::Result<()> {
        // SAFETY: both descriptors are valid; dup2 atomically replaces `to`.
        cvt(unsafe { libc::dup2(from.as_raw_fd(), to) }).map(|_| ())
    }

    /// Returns the (read, write) ends of a new close-on-exec pipe.
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    pub(super) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0; 2];
        // SAFETY: `fds` has room for the two descriptors pipe2 writes.
        cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
        // SAFETY: both descriptors were just created and are unowned.
        Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
    }

    /// Returns the (read, write) ends of a new close-on-exec pipe.
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )))]
    pub(super) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0; 2];
        // SAFETY: `fds` has room for the two descriptors pipe writes.
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        // SAFETY: both descriptors were just created and are unowned.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        for fd in [&read, &write] {
            // SAFETY: sets a descriptor flag on a descriptor we own.
            cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) })?;
        }
        Ok((read, write))
    }

    fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
        let fd = fd.as_raw_fd();
        // SAFETY: F_GETFL and F_SETFL only touch the status flags of `fd`.
        let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map(|_| ())
    }

    fn stopped() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "stdio pump has stopped")
    }

    enum Command {
        Attach {
            kind: StreamKind,
            read: File,
            sink: VirtualStream,
        },
        Detach {
            kind: StreamKind,
            done: mpsc::Sender<()>,
        },
    }

    struct Channel {
        kind: StreamKind,
        read: File,
        sink: VirtualStream,
    }

    impl Channel {
        /// Moves at most one read into the sink. Returns false once the pipe
        /// is closed or broken.
        fn pump_once(&mut self, buf: &mut [u8]) -> bool {
            match self.read.read(buf) {
                Ok(0) => false,
                Ok(n) => {
                    self.sink.write_chunk(&buf[..n]);
                    true
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    true
                }
                Err(err) => {
                    warn!("reading captured {} failed: {}", self.kind, err);
                    false
                }
            }
        }

        /// Moves everything already in the pipe into the sink without
        /// waiting for writers that still hold it open.
        fn drain(mut self, buf: &mut [u8]) {
            loop {
                match self.read.read(buf) {
                    Ok(0) => return,
                    Ok(n) => {
                        self.sink.write_chunk(&buf[..n]);
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                    Err(err) => {
                        warn!("draining captured {} failed: {}", self.kind, err);
                        return;
                    }
                }
            }
        }
    }

    /// Handle to the thread that moves pipe contents into the streams.
    ///
    /// Commands travel over a channel; a byte on the wake pipe tells the
    /// thread to look at them. Closing the wake pipe stops the thread.
    pub(super) struct Pump {
        commands: mpsc::Sender<Command>,
        wake: File,
        thread: JoinHandle<()>,
    }

    impl Pump {
        pub(super) fn spawn() -> io::Result<Self> {
            let (wake_read, wake_write) = pipe()?;
            set_nonblocking(&wake_read)?;
            let (commands, receiver) = mpsc::channel();
            let thread = thread::Builder::new()
                .name("virterm-stdio".to_string())
                .spawn(move || run(File::from(wake_read), receiver))?;
            debug!("stdio pump started");
            Ok(Self {
                commands,
                wake: File::from(wake_write),
                thread,
            })
        }

        /// Starts moving whatever arrives on `read` into `sink`.
        pub(super) fn attach(
            &self,
            kind: StreamKind,
            read: OwnedFd,
            sink: VirtualStream,
        ) -> io::Result<()> {
            set_nonblocking(&read)?;
            self.send(Command::Attach {
                kind,
                read: File::from(read),
                sink,
            })
        }

        /// Drains and closes the pipe of `kind`. Returns once that is done.
        pub(super) fn detach(&self, kind: StreamKind) -> io::Result<()> {
            let (done, finished) = mpsc::channel();
            self.send(Command::Detach { kind, done })?;
            finished.recv().map_err(|_| stopped())
        }

        pub(super) fn stop(self) -> io::Result<()> {
            let Self {
                commands,
                wake,
                thread,
            } = self;
            drop(commands);
            drop(wake);
            thread
                .join()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "stdio pump thread panicked"))?;
            debug!("stdio pump stopped");
            Ok(())
        }

        fn send(&self, command: Command) -> io::Result<()> {
            self.commands.send(command).map_err(|_| stopped())?;
            (&self.wake).write_all(&[1])
        }
    }

    fn run(mut wake: File, commands: mpsc::Receiver<Command>) {
        let mut channels: Vec<Channel> = Vec::new();
        let mut buf = [0u8; READ_SIZE];
        loop {
            let mut fds: Vec<libc::pollfd> = std::iter::once(wake.as_raw_fd())
                .chain(channels.iter().map(|channel| channel.read.as_raw_fd()))
                .map(|fd| libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();
            // SAFETY: `fds` is a valid array of `fds.len()` pollfd entries.
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ret == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("stdio pump stopped: {}", err);
                return;
            }

            let mut index = 0;
            for fd in &fds[1..] {
                if fd.revents != 0 && !channels[index].pump_once(&mut buf) {
                    let channel = channels.remove(index);
                    debug!("captured {} closed", channel.kind);
                    continue;
                }
                index += 1;
            }

            if fds[0].revents == 0 {
                continue;
            }
            if !clear_wake(&mut wake) {
                return;
            }
            loop {
                match commands.try_recv() {
                    Ok(Command::Attach { kind, read, sink }) => {
                        channels.push(Channel { kind, read, sink });
                    }
                    Ok(Command::Detach { kind, done }) => {
                        if let Some(index) = channels.iter().position(|c| c.kind == kind) {
                            channels.remove(index).drain(&mut buf);
                        }
                        let _ = done.send(());
                    }
                    Err(mpsc::TryRecvError::Empty) => break,
                    Err(mpsc::TryRecvError::Disconnected) => return,
                }
            }
        }
    }

    /// Empties the wake pipe. Returns false once its write end is closed.
    fn clear_wake(wake: &mut File) -> bool {
        let mut sink = [0u8; 64];
        loop {
            match wake.read(&mut sink) {
                Ok(0) => return false,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err) => {
                    warn!("stdio pump wake pipe failed: {}", err);
                    return false;
                }
            }
        }
    }

}

#[cfg(unix)]
impl FdStdio {
    fn stop_idle_pump(&mut self) -> io::Result<()> {
        if self.saved.iter().any(Option::is_some) {
            return Ok(());
        }
        match self.pump.take() {
            Some(pump) => pump.stop(),
            None => Ok(()),
        }
    }
}

#[cfg(unix)]
impl StdioBackend for FdStdio {
    fn redirect(
        &mut self,
        kind: StreamKind,
        sink: VirtualStream,
    ) -> io::Result<Box<dyn Write + Send>> {
        if self.saved[kind.index()].is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{kind} is already redirected"),
            ));
        }

        flush_std(kind)?;
        let target = unix::target(kind);
        let saved = unix::dup(target)?;
        let tee = unix::dup(saved.as_raw_fd())?;
        let (read, write) = unix::pipe()?;
        let pump = match self.pump.take() {
            Some(pump) => pump,
            None => unix::Pump::spawn()?,
        };
        let pump = self.pump.insert(pump);
        let attached = pump
            .attach(kind, read, sink)
            .and_then(|()| match unix::dup2(&write, target) {
                Ok(()) => Ok(()),
                Err(err) => {
                    if let Err(detach) = pump.detach(kind) {
                        warn!("detaching {} after failed redirect: {}", kind, detach);
                    }
                    Err(err)
                }
            });
        if let Err(err) = attached {
            if let Err(stop) = self.stop_idle_pump() {
                warn!("stopping stdio pump failed: {}", stop);
            }
            return Err(err);
        }
        // The channel's descriptor (and any child inheriting it) now holds
        // the write end.
        drop(write);

        debug!("{} redirected to pipe", kind);
        self.saved[kind.index()] = Some(saved);
        Ok(Box::new(std::fs::File::from(tee)))
    }

    fn restore(&mut self, kind: StreamKind) -> io::Result<()> {
        let Some(saved) = self.saved[kind.index()].take() else {
            return Ok(());
        };

        if let Err(err) = flush_std(kind) {
            warn!("flushing {} before restore failed: {}", kind, err);
        }
        if let Err(err) = unix::dup2(&saved, unix::target(kind)) {
            self.saved[kind.index()] = Some(saved);
            return Err(err);
        }
        drop(saved);
        if let Some(pump) = &self.pump {
            pump.detach(kind)?;
        }
        self.stop_idle_pump()?;
        debug!("{} restored", kind);
        Ok(())
    }

    fn real_writer(&self, kind: StreamKind) -> Box<dyn Write + Send> {
        match kind {
            StreamKind::Normal => Box::new(io::stdout()),
            StreamKind::Error => Box::new(io::stderr()),
        }
    }
}

#[cfg(not(unix))]
impl StdioBackend for FdStdio {
    fn redirect(
        &mut self,
        kind: StreamKind,
        _sink: VirtualStream,
    ) -> io::Result<Box<dyn Write + Send>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("redirecting {kind} needs unix file descriptors"),
        ))
    }

    fn restore(&mut self, _kind: StreamKind) -> io::Result<()> {
        Ok(())
    }

    fn real_writer(&self, kind: StreamKind) -> Box<dyn Write + Send> {
        match kind {
            StreamKind::Normal => Box::new(io::stdout()),
            StreamKind::Error => Box::new(io::stderr()),
        }
    }
}

impl Drop for FdStdio {
    fn drop(&mut self) {
        for kind in StreamKind::ALL {
            if let Err(err) = self.restore(kind) {
                warn!("restoring {} failed: {}", kind, err);
            }
        }
    }
}
