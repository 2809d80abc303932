//! Self-pipe used to wake the poll thread from another thread after a
//! cross-thread queue insertion (component B in spec.md §2). Backed by
//! `mio::unix::pipe`, which is exactly the self-pipe trick, already wired
//! up as an `mio::event::Source`.

use std::io::{self, Read, Write};

use mio::unix::pipe;

/// The writable half, cloned and handed to any thread that needs to wake
/// the poll loop (e.g. the retry scheduler after enqueuing work, or a
/// foreign-thread `del()`).
#[derive(Clone)]
pub struct EventPipeSender {
    inner: std::sync::Arc<std::sync::Mutex<pipe::Sender>>,
}

impl EventPipeSender {
    /// Wakes the poll thread. Idempotent: if the pipe is momentarily full
    /// (multiple wakeups coalesce), the error is swallowed — the reader
    /// only needs to observe "at least one" wakeup, not a precise count.
    pub fn notify(&self) {
        let mut sender = self.inner.lock().unwrap();
        match sender.write_all(&[1u8]) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("event pipe notify failed: {}", e),
        }
    }
}

/// The readable half, installed into the poll set by the owning reactor.
pub struct EventPipeReceiver {
    pub(crate) receiver: pipe::Receiver,
}

impl EventPipeReceiver {
    /// Drains all pending wakeup bytes so the fd's readiness edge clears.
    pub fn drain(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match self.receiver.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("event pipe drain failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Creates a connected self-pipe pair, the receiver ready to hand to
/// [`crate::PollSet::install_event_pipe`].
pub fn event_pipe() -> io::Result<(EventPipeSender, EventPipeReceiver)> {
    let (sender, receiver) = pipe::new()?;
    Ok((
        EventPipeSender {
            inner: std::sync::Arc::new(std::sync::Mutex::new(sender)),
        },
        EventPipeReceiver { receiver },
    ))
}
