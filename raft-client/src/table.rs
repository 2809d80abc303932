//! Sub-app table, send queue, and cancellation (spec §4.G). The table is a
//! `BTreeMap` guarded by a single instance mutex, matching spec §5's
//! "the sub-app table and its FIFO are guarded by the instance mutex".

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::{ClientError, Result};
use crate::subapp::{Completion, SubApp, SubAppKey};

pub struct SubAppTable {
    entries: Mutex<BTreeMap<SubAppKey, Arc<SubApp>>>,
    sendq: Mutex<VecDeque<Arc<SubApp>>>,
    max_subapps: usize,
}

impl SubAppTable {
    pub fn new(max_subapps: usize) -> Self {
        SubAppTable {
            entries: Mutex::new(BTreeMap::new()),
            sendq: Mutex::new(VecDeque::new()),
            max_subapps,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts a new sub-app under `key`. Fails with `Already` if one is
    /// already outstanding for this key (invariant 8), `NoMem` if the
    /// table is at capacity.
    pub fn submit(
        &self,
        key: SubAppKey,
        rpc: Vec<u8>,
        reply_cap: usize,
        msg_id: u64,
        completion: Completion,
    ) -> Result<Arc<SubApp>> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&key) {
            return Err(ClientError::Already);
        }
        if entries.len() >= self.max_subapps {
            return Err(ClientError::NoMem);
        }
        let app = Arc::new(SubApp::new(key, rpc, reply_cap, msg_id, completion));
        entries.insert(key, app.clone());
        Ok(app)
    }

    /// Clears `initializing` and places the entry on the send queue — the
    /// point at which the retry loop is allowed to see it (spec §4.G).
    pub fn submit_enqueue(&self, app: &Arc<SubApp>) {
        {
            let mut s = app.state.lock().unwrap();
            s.initializing = false;
        }
        self.enqueue_locked(app);
    }

    /// *enqueue-locked*: if not already queued and not initializing, mark
    /// `on_sendq`, take an extra reference (the cloned `Arc`), append.
    pub fn enqueue_locked(&self, app: &Arc<SubApp>) {
        let mut s = app.state.lock().unwrap();
        if s.on_sendq || s.initializing {
            return;
        }
        s.on_sendq = true;
        drop(s);
        self.sendq.lock().unwrap().push_back(app.clone());
    }

    /// *dequeue-and-send*: pops the head, clears `on_sendq`. If the entry
    /// is canceled/ready/completing it is simply dropped (the reference
    /// taken by `enqueue_locked` goes away); otherwise the caller is
    /// handed the entry to stamp `last_send`/`num_sends` and transmit.
    pub fn dequeue_ready_to_send(&self) -> Option<Arc<SubApp>> {
        loop {
            let app = self.sendq.lock().unwrap().pop_front()?;
            let mut s = app.state.lock().unwrap();
            s.on_sendq = false;
            if s.canceled || s.ready || s.completing {
                continue;
            }
            s.last_send = Some(Instant::now());
            s.num_sends += 1;
            return Some(app.clone());
        }
    }

    pub fn get(&self, key: &SubAppKey) -> Option<Arc<SubApp>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Finds the sub-app awaiting `msg_id` (completion routing needs the
    /// message id since replies don't carry the caller's key).
    pub fn find_by_msg_id(&self, msg_id: u64) -> Option<Arc<SubApp>> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .find(|a| a.state.lock().unwrap().msg_id == msg_id)
            .cloned()
    }

    /// Scans every entry, re-enqueuing any whose `last_send` is stale and
    /// which is idle (spec §4.G "Retry scheduler").
    pub fn retry_scan(&self, retry_timeout_ms: u64) -> usize {
        let now = Instant::now();
        let entries: Vec<Arc<SubApp>> = self.entries.lock().unwrap().values().cloned().collect();
        let mut requeued = 0;
        for app in entries {
            let idle = {
                let s = app.state.lock().unwrap();
                !s.on_sendq && !s.initializing && !s.ready && !s.canceled && !s.completing
            };
            if !idle {
                continue;
            }
            let stale = {
                let s = app.state.lock().unwrap();
                match s.last_send {
                    None => true,
                    Some(last) => now.saturating_duration_since(last).as_millis() as u64 >= retry_timeout_ms,
                }
            };
            if stale {
                self.enqueue_locked(&app);
                requeued += 1;
            }
        }
        requeued
    }

    /// Removes table entries that are done and not referenced elsewhere —
    /// the Rust stand-in for the original's manual refcount reaching zero.
    pub fn prune_quiescent(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, app| !(app.is_quiescent() && Arc::strong_count(app) == 1));
    }

    /// `cancel(rncui, reply_buf)` (spec §4.G): verifies the caller's
    /// `reply_cap` matches what was submitted (guards against a stale
    /// buffer pointer being reused across calls), waits out any
    /// in-progress completion copy, then marks canceled and wakes waiters.
    pub fn cancel(&self, key: &SubAppKey, expected_reply_cap: usize) -> Result<()> {
        let app = self.get(key).ok_or(ClientError::ENoEnt)?;
        let mut s = app.state.lock().unwrap();
        if s.reply_cap != expected_reply_cap {
            return Err(ClientError::EStale);
        }
        while s.completing {
            s = app.cv.wait(s).unwrap();
        }
        s.canceled = true;
        app.cv.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn key() -> SubAppKey {
        SubAppKey::new(Uuid::new_v4(), [0, 0, 0, 0])
    }

    #[test]
    fn duplicate_submit_is_rejected() {
        let table = SubAppTable::new(8);
        let k = key();
        table.submit(k, vec![], 64, 1, Completion::Blocking).unwrap();
        match table.submit(k, vec![], 64, 2, Completion::Blocking) {
            Err(ClientError::Already) => {}
            other => panic!("expected Already, got {:?}", other.err().map(|e| e.to_string())),
        }
    }

    #[test]
    fn table_enforces_capacity() {
        let table = SubAppTable::new(1);
        table.submit(key(), vec![], 64, 1, Completion::Blocking).unwrap();
        match table.submit(key(), vec![], 64, 2, Completion::Blocking) {
            Err(ClientError::NoMem) => {}
            other => panic!("expected NoMem, got {:?}", other.err().map(|e| e.to_string())),
        }
    }

    #[test]
    fn enqueue_then_dequeue_stamps_send_bookkeeping() {
        let table = SubAppTable::new(8);
        let app = table.submit(key(), vec![1, 2, 3], 64, 1, Completion::Blocking).unwrap();
        table.submit_enqueue(&app);
        let sent = table.dequeue_ready_to_send().unwrap();
        assert_eq!(sent.key, app.key);
        assert_eq!(sent.state.lock().unwrap().num_sends, 1);
        assert!(table.dequeue_ready_to_send().is_none());
    }

    #[test]
    fn canceled_entries_are_skipped_on_dequeue() {
        let table = SubAppTable::new(8);
        let app = table.submit(key(), vec![], 64, 1, Completion::Blocking).unwrap();
        table.submit_enqueue(&app);
        app.state.lock().unwrap().canceled = true;
        assert!(table.dequeue_ready_to_send().is_none());
    }

    #[test]
    fn cancel_rejects_mismatched_buffer() {
        let table = SubAppTable::new(8);
        let k = key();
        table.submit(k, vec![], 64, 1, Completion::Blocking).unwrap();
        match table.cancel(&k, 128) {
            Err(ClientError::EStale) => {}
            other => panic!("expected EStale, got {:?}", other),
        }
    }

    #[test]
    fn cancel_wakes_a_blocking_waiter() {
        let table = Arc::new(SubAppTable::new(8));
        let k = key();
        let app = table.submit(k, vec![], 64, 1, Completion::Blocking).unwrap();
        let handle = std::thread::spawn(move || app.wait_for_completion(None));
        std::thread::sleep(std::time::Duration::from_millis(20));
        table.cancel(&k, 64).unwrap();
        match handle.join().unwrap() {
            Err(ClientError::Canceled) => {}
            other => panic!("expected Canceled, got {:?}", other),
        }
    }
}
