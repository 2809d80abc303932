//! Poll-set manager (component A): owns a readiness-notification set
//! (epoll, via `mio`), installs/removes handles with deferred destruction
//! so a callback can remove itself safely. Grounded on
//! `examples/original_source/src/epoll_mgr.c`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::ThreadId;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use crate::error::{ReactorError, Result};
use crate::event_pipe::{event_pipe, EventPipeReceiver, EventPipeSender};
use crate::handle::{Handle, HandleId};

enum HandleState {
    Installing,
    Installed,
    Destroying,
}

struct HandleSlot {
    raw_fd: RawFd,
    interest: Interest,
    // `None` only while a callback invocation is in flight (see
    // `dispatch_ready`); this lets a callback call `del()` on its own
    // handle without deadlocking on `handles`.
    callback: Option<Box<dyn FnMut() + Send>>,
    ref_hook: Option<Box<dyn Fn(bool) + Send>>,
    state: HandleState,
}

struct Handles {
    slab: Slab<HandleSlot>,
    pending_destroy: Vec<HandleId>,
}

/// Owns one epoll set. Not `Sync` in spirit even though the type permits
/// sharing a `&PollSet` across threads for `del()` — only the thread that
/// calls [`PollSet::wait_and_dispatch`] may run callbacks or call `add`
/// internals that assume single-threaded epoll ownership semantics from
/// the *callback's* perspective; see spec.md §5.
pub struct PollSet {
    poll: Mutex<Poll>,
    handles: Mutex<Handles>,
    poll_thread: Mutex<Option<ThreadId>>,
    ready: AtomicBool,
    wakeup_sender: EventPipeSender,
    wakeup_receiver: Mutex<EventPipeReceiver>,
    wakeup_token: Token,
}

const WAKEUP_TOKEN: Token = Token(usize::MAX);

impl PollSet {
    /// Equivalent to `epoll_mgr_setup()`: creates the epoll fd and installs
    /// its own wakeup self-pipe so foreign-thread `del()` and any other
    /// cross-thread notification has somewhere to land.
    pub fn setup() -> Result<Self> {
        let poll = Poll::new()?;
        let (sender, receiver) = event_pipe()?;
        poll.registry().register(
            &mut SourceFd(&std::os::unix::io::AsRawFd::as_raw_fd(&receiver.receiver)),
            WAKEUP_TOKEN,
            Interest::READABLE,
        )?;

        Ok(PollSet {
            poll: Mutex::new(poll),
            handles: Mutex::new(Handles {
                slab: Slab::new(),
                pending_destroy: Vec::new(),
            }),
            poll_thread: Mutex::new(None),
            ready: AtomicBool::new(true),
            wakeup_sender: sender,
            wakeup_receiver: Mutex::new(receiver),
            wakeup_token: WAKEUP_TOKEN,
        })
    }

    /// A cheap, cloneable handle that wakes the poll thread without going
    /// through a whole `Handle`/`add` round trip — used by foreign-thread
    /// `del()` and by any other component (retry scheduler, send queue)
    /// that needs to nudge the loop.
    pub fn waker(&self) -> EventPipeSender {
        self.wakeup_sender.clone()
    }

    /// `epoll_mgr_close()`.
    pub fn close(&self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// `epoll_handle_add()`: links the handle into the active set before
    /// arming readiness, then either finalizes or rolls back.
    pub fn add(&self, handle: Handle) -> Result<HandleId> {
        if let Some(hook) = &handle.ref_hook {
            hook(true); // take user ref in advance of handle install
        }

        let Handle {
            raw_fd,
            interest,
            callback,
            ref_hook,
        } = handle;

        let id = {
            let mut handles = self.handles.lock().unwrap();
            let key = handles.slab.insert(HandleSlot {
                raw_fd,
                interest,
                callback: Some(callback),
                ref_hook,
                state: HandleState::Installing,
            });
            HandleId(key)
        };

        let rc = {
            let poll = self.poll.lock().unwrap();
            poll.registry()
                .register(&mut SourceFd(&raw_fd), Token(id.0), interest)
        };

        let mut handles = self.handles.lock().unwrap();
        match rc {
            Ok(()) => {
                if let Some(slot) = handles.slab.get_mut(id.0) {
                    slot.state = HandleState::Installed;
                }
                Ok(id)
            }
            Err(e) => {
                let slot = handles.slab.remove(id.0);
                drop(handles);
                if let Some(hook) = &slot.ref_hook {
                    hook(false); // release user ref, install failed
                }
                Err(ReactorError::Io(e))
            }
        }
    }

    /// `epoll_handle_del()`. Called from the poll thread itself, this
    /// completes synchronously. From any other thread it marks the handle
    /// `Destroying`, unlinks it, and wakes the poll thread so it reaps the
    /// pending-destroy list on its next `wait_and_dispatch`.
    pub fn del(&self, id: HandleId) -> Result<()> {
        let on_poll_thread = self
            .poll_thread
            .lock()
            .unwrap()
            .map(|t| t == std::thread::current().id())
            .unwrap_or(false);

        if on_poll_thread {
            self.del_complete(id)
        } else {
            {
                let mut handles = self.handles.lock().unwrap();
                match handles.slab.get_mut(id.0) {
                    Some(slot) => slot.state = HandleState::Destroying,
                    None => return Err(ReactorError::NotInstalled),
                }
                handles.pending_destroy.push(id);
            }
            self.wakeup_sender.notify();
            Ok(())
        }
    }

    fn del_complete(&self, id: HandleId) -> Result<()> {
        let (raw_fd, ref_hook) = {
            let mut handles = self.handles.lock().unwrap();
            if !handles.slab.contains(id.0) {
                return Err(ReactorError::NotInstalled);
            }
            let slot = handles.slab.remove(id.0);
            (slot.raw_fd, slot.ref_hook)
        };

        let poll = self.poll.lock().unwrap();
        let _ = poll.registry().deregister(&mut SourceFd(&raw_fd));
        drop(poll);

        if let Some(hook) = ref_hook {
            hook(false);
        }
        Ok(())
    }

    /// Invokes one ready handle's callback exactly once, releasing the
    /// handles lock for the duration of the call so a callback may remove
    /// its own handle (the single-threaded `del()` path) without
    /// deadlocking.
    fn dispatch_ready(&self, id: HandleId) {
        let taken = {
            let mut handles = self.handles.lock().unwrap();
            match handles.slab.get_mut(id.0) {
                Some(slot) if matches!(slot.state, HandleState::Installed) => slot.callback.take(),
                _ => None,
            }
        };

        if let Some(mut callback) = taken {
            callback();
            let mut handles = self.handles.lock().unwrap();
            if let Some(slot) = handles.slab.get_mut(id.0) {
                if matches!(slot.state, HandleState::Installed) {
                    slot.callback = Some(callback);
                }
            }
        }
    }

    fn reap_pending_destroy(&self) {
        let pending = {
            let mut handles = self.handles.lock().unwrap();
            std::mem::take(&mut handles.pending_destroy)
        };
        for id in pending {
            if let Err(e) = self.del_complete(id) {
                log::warn!("reaping pending-destroy handle failed: {:?}", e);
            }
        }
    }

    /// Returns after at most `timeout`, having invoked each ready handle's
    /// callback exactly once per readiness edge, then reaping any handles
    /// that were marked for destruction by a foreign thread.
    pub fn wait_and_dispatch(&self, timeout: Option<Duration>) -> Result<()> {
        *self.poll_thread.lock().unwrap() = Some(std::thread::current().id());

        let mut events = Events::with_capacity(128);
        {
            let mut poll = self.poll.lock().unwrap();
            poll.poll(&mut events, timeout)?;
        }

        for event in events.iter() {
            let token = event.token();
            if token == self.wakeup_token {
                self.wakeup_receiver.lock().unwrap().drain();
                continue;
            }
            self.dispatch_ready(HandleId(token.0));
        }

        self.reap_pending_destroy();
        Ok(())
    }
}
