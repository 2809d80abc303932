//! Single-threaded event core shared by the raft server and the raft
//! client runtime: a poll-set manager (component A) plus a self-pipe event
//! pipe (component B) used to wake the poll thread from other threads.

mod error;
mod event_pipe;
mod handle;
mod pollset;

pub use error::{ReactorError, Result};
pub use event_pipe::{event_pipe, EventPipeReceiver, EventPipeSender};
pub use handle::{Handle, HandleId};
pub use mio::Interest;
pub use pollset::PollSet;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn event_pipe_wakes_the_poll_thread() {
        let poll = PollSet::setup().unwrap();
        let waker = poll.waker();
        waker.notify();
        // A wakeup-only wait should return promptly rather than blocking
        // for the full timeout.
        let start = std::time::Instant::now();
        poll.wait_and_dispatch(Some(Duration::from_secs(5))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn handle_fires_on_readiness() {
        let poll = PollSet::setup().unwrap();
        let (sender, receiver) = event_pipe().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let receiver = Arc::new(std::sync::Mutex::new(receiver));
        let receiver2 = receiver.clone();
        let fd = {
            use std::os::unix::io::AsRawFd;
            receiver.lock().unwrap().receiver.as_raw_fd()
        };
        let handle = Handle::new(fd, Interest::READABLE, move || {
            receiver2.lock().unwrap().drain();
            count2.fetch_add(1, Ordering::SeqCst);
        });
        let id = poll.add(handle).unwrap();

        sender.notify();
        poll.wait_and_dispatch(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        poll.del(id).unwrap();
    }

    #[test]
    fn callback_can_remove_its_own_handle() {
        let poll = Arc::new(PollSet::setup().unwrap());
        let (sender, receiver) = event_pipe().unwrap();
        let receiver = Arc::new(std::sync::Mutex::new(receiver));
        let fd = {
            use std::os::unix::io::AsRawFd;
            receiver.lock().unwrap().receiver.as_raw_fd()
        };

        let poll_for_cb = poll.clone();
        let id_cell: Arc<std::sync::Mutex<Option<HandleId>>> = Arc::new(std::sync::Mutex::new(None));
        let id_cell2 = id_cell.clone();
        let receiver2 = receiver.clone();
        let handle = Handle::new(fd, Interest::READABLE, move || {
            receiver2.lock().unwrap().drain();
            let id = id_cell2.lock().unwrap().take().unwrap();
            poll_for_cb.del(id).unwrap();
        });
        let id = poll.add(handle).unwrap();
        *id_cell.lock().unwrap() = Some(id);

        sender.notify();
        poll.wait_and_dispatch(Some(Duration::from_secs(5))).unwrap();
        // Removing itself must not panic or deadlock; a second wait with no
        // further notifications should simply time out quickly without
        // invoking the (now removed) handle again.
        sender.notify();
        poll.wait_and_dispatch(Some(Duration::from_millis(50))).unwrap();
    }
}
