//! Sub-app table entries (spec §4.G "Sub-app table"): one per in-flight
//! request, keyed by the caller's `{uuid, sub_id[4]}`. The C original
//! ref-counts each entry by hand so the retry scanner and the reply
//! handler can each hold a transient reference across a lock release; here
//! that's just `Arc<SubApp>` — cloning the `Arc` *is* "taking an extra
//! reference", and the table prunes an entry once it's the only holder
//! left.

use std::sync::{Condvar, Mutex};
use std::time::Instant;

use uuid::Uuid;

use crate::error::ClientError;

/// Caller-supplied identity for one outstanding request: a UUID plus up to
/// four integer sub-keys (spec invariant 8). Ordered so the table can use
/// a `BTreeMap` (spec: "a reference-counted ordered map").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubAppKey {
    pub uuid: Uuid,
    pub sub_id: [u32; 4],
}

impl SubAppKey {
    pub fn new(uuid: Uuid, sub_id: [u32; 4]) -> Self {
        SubAppKey { uuid, sub_id }
    }
}

/// How the caller wants to learn about completion.
pub enum Completion {
    /// The caller is parked on [`SubApp`]'s condvar.
    Blocking,
    /// Invoked exactly once, off the instance lock, with the final result.
    Async(Box<dyn FnOnce(std::result::Result<Vec<u8>, ClientError>) + Send>),
}

pub(crate) struct SubAppState {
    pub rpc: Vec<u8>,
    pub reply_cap: usize,
    pub reply: Option<Vec<u8>>,
    pub msg_id: u64,
    pub last_send: Option<Instant>,
    pub num_sends: u32,
    pub error: Option<ClientError>,
    pub completion: Option<Completion>,
    pub canceled: bool,
    pub ready: bool,
    pub completing: bool,
    /// Set at construction, cleared by `submit_enqueue` once the caller has
    /// finished building the request; the retry loop skips entries still
    /// `initializing` (spec §4.G).
    pub initializing: bool,
    pub on_sendq: bool,
}

/// One outstanding request. Held by the table's `BTreeMap` plus, while it
/// is on the send queue or mid-completion, by whichever code cloned the
/// `Arc` (the C original's "extra reference").
pub struct SubApp {
    pub key: SubAppKey,
    pub(crate) state: Mutex<SubAppState>,
    pub(crate) cv: Condvar,
}

impl SubApp {
    pub(crate) fn new(key: SubAppKey, rpc: Vec<u8>, reply_cap: usize, msg_id: u64, completion: Completion) -> Self {
        SubApp {
            key,
            state: Mutex::new(SubAppState {
                rpc,
                reply_cap,
                reply: None,
                msg_id,
                last_send: None,
                num_sends: 0,
                error: None,
                completion: Some(completion),
                canceled: false,
                ready: false,
                completing: false,
                initializing: true,
                on_sendq: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().ready
    }

    pub fn is_canceled(&self) -> bool {
        self.state.lock().unwrap().canceled
    }

    /// True once this entry no longer needs to stay in the table: it has
    /// completed (or been canceled) and is not mid-completion-copy.
    pub(crate) fn is_quiescent(&self) -> bool {
        let s = self.state.lock().unwrap();
        (s.ready || s.canceled) && !s.completing
    }

    /// Blocks the calling thread until ready/canceled, or until `deadline`
    /// elapses (spec §5: "blocking submit honours a caller-supplied
    /// timeout via a timed wait").
    pub fn wait_for_completion(&self, deadline: Option<Instant>) -> std::result::Result<Vec<u8>, ClientError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.ready {
                if let Some(err) = state.error.take() {
                    return Err(err);
                }
                return Ok(state.reply.take().unwrap_or_default());
            }
            if state.canceled {
                return Err(ClientError::Canceled);
            }
            match deadline {
                None => state = self.cv.wait(state).unwrap(),
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        state.canceled = true;
                        return Err(ClientError::TimedOut);
                    }
                    let (next, timed_out) = self.cv.wait_timeout(state, dl - now).unwrap();
                    state = next;
                    if timed_out.timed_out() && !state.ready {
                        state.canceled = true;
                        return Err(ClientError::TimedOut);
                    }
                }
            }
        }
    }

    /// Completes this request (spec §4.G "Completion"): validates the
    /// reply size, stamps `completing` while the payload is installed (the
    /// flag `cancel` waits out — see [`crate::table::SubAppTable::cancel`]),
    /// then marks ready and wakes any waiter / dispatches the async
    /// callback exactly once. The original copies the reply into a
    /// caller-owned raw buffer while unlocked; here the reply is an owned
    /// `Vec<u8>` handed off by value, so there's no foreign memory to copy
    /// into outside the lock.
    pub(crate) fn complete(self: &std::sync::Arc<Self>, reply: Vec<u8>) {
        let completion = {
            let mut s = self.state.lock().unwrap();
            if s.canceled {
                s.error = Some(ClientError::Canceled);
                s.ready = true;
                self.cv.notify_all();
                return;
            }
            if reply.len() > s.reply_cap {
                s.error = Some(ClientError::E2Big {
                    reply_size: reply.len(),
                    buf_size: s.reply_cap,
                });
                s.ready = true;
                self.cv.notify_all();
                return;
            }
            s.completing = true;
            s.reply = Some(reply);
            s.completing = false;
            s.ready = true;
            self.cv.notify_all();
            s.completion.take()
        };
        if let Some(Completion::Async(cb)) = completion {
            let result = {
                let mut s = self.state.lock().unwrap();
                match s.error.take() {
                    Some(e) => Err(e),
                    None => Ok(s.reply.clone().unwrap_or_default()),
                }
            };
            cb(result);
        }
    }

    pub(crate) fn fail(self: &std::sync::Arc<Self>, err: ClientError) {
        let mut s = self.state.lock().unwrap();
        s.error = Some(err);
        s.ready = true;
        self.cv.notify_all();
        let completion = s.completion.take();
        drop(s);
        if let Some(Completion::Async(cb)) = completion {
            let err_result = {
                let mut s = self.state.lock().unwrap();
                Err(s.error.take().unwrap_or(ClientError::TimedOut))
            };
            cb(err_result);
        }
    }
}
