//! Per-client session state consumed by the synchronization layer.
//!
//! A session owns the decoder's sticky "fatal" flag, the object table and the outward retirement
//! channel. Everything here is shared with retirement workers, so it is `Sync`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::SyncConfig;
use crate::error::{ProtocolViolation, SyncError};
use crate::object::ObjectTable;

/// Receives retired fences so the remote client can be notified.
pub trait RetireSink: Send + Sync {
    fn retire_fence(&self, ctx_id: u32, ring_idx: u32, fence_id: u64);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Retirement {
    pub ctx_id: u32,
    pub ring_idx: u32,
    pub fence_id: u64,
}

/// [`RetireSink`] that records every retirement in arrival order.
#[derive(Debug, Default)]
pub struct RecordingRetireSink {
    log: Mutex<Vec<Retirement>>,
    cond: Condvar,
}

impl RecordingRetireSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retirements(&self) -> Vec<Retirement> {
        self.log.lock().expect("retire log lock poisoned").clone()
    }

    pub fn fence_ids(&self) -> Vec<u64> {
        self.retirements().iter().map(|r| r.fence_id).collect()
    }

    pub fn len(&self) -> usize {
        self.log.lock().expect("retire log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until at least `count` retirements were recorded. Returns `false` on timeout.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut log = self.log.lock().expect("retire log lock poisoned");
        while log.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            log = self
                .cond
                .wait_timeout(log, deadline - now)
                .expect("retire log lock poisoned")
                .0;
        }
        true
    }
}

impl RetireSink for RecordingRetireSink {
    fn retire_fence(&self, ctx_id: u32, ring_idx: u32, fence_id: u64) {
        self.log
            .lock()
            .expect("retire log lock poisoned")
            .push(Retirement {
                ctx_id,
                ring_idx,
                fence_id,
            });
        self.cond.notify_all();
    }
}

pub struct Session {
    ctx_id: u32,
    fatal: AtomicBool,
    objects: ObjectTable,
    retire: Arc<dyn RetireSink>,
    config: SyncConfig,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("ctx_id", &self.ctx_id)
            .field("fatal", &self.is_fatal())
            .field("objects", &self.objects.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(ctx_id: u32, retire: Arc<dyn RetireSink>, config: SyncConfig) -> Self {
        Self {
            ctx_id,
            fatal: AtomicBool::new(false),
            objects: ObjectTable::new(),
            retire,
            config,
        }
    }

    pub fn ctx_id(&self) -> u32 {
        self.ctx_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn retire_sink(&self) -> Arc<dyn RetireSink> {
        self.retire.clone()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    /// Marks the session fatal. Irreversible.
    pub fn set_fatal(&self, reason: &dyn fmt::Display) {
        if !self.fatal.swap(true, Ordering::AcqRel) {
            tracing::error!(ctx_id = self.ctx_id, %reason, "session marked fatal");
        }
    }

    /// Marks the session fatal for `violation` and hands back the matching error.
    pub fn fail(&self, violation: ProtocolViolation) -> SyncError {
        self.set_fatal(&violation);
        SyncError::Protocol(violation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fail_marks_session_fatal_once() {
        let session = Session::new(
            3,
            Arc::new(RecordingRetireSink::new()),
            SyncConfig::default(),
        );
        assert!(!session.is_fatal());

        let err = session.fail(ProtocolViolation::InvalidRingIndex(0));
        assert!(err.is_fatal());
        assert!(session.is_fatal());

        // Sticky.
        session.set_fatal(&"again");
        assert!(session.is_fatal());
    }

    #[test]
    fn recording_sink_wakes_waiters() {
        let sink = Arc::new(RecordingRetireSink::new());
        let producer = {
            let sink = sink.clone();
            thread::spawn(move || {
                for fence_id in 1..=3 {
                    sink.retire_fence(1, 2, fence_id);
                }
            })
        };

        assert!(sink.wait_for(3, Duration::from_secs(5)));
        producer.join().unwrap();
        assert_eq!(sink.fence_ids(), vec![1, 2, 3]);
        assert!(sink.retirements().iter().all(|r| r.ring_idx == 2));
        assert!(!sink.wait_for(4, Duration::from_millis(10)));
    }
}
