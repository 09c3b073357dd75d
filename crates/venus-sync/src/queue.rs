//! Server-side queues and their retirement workers.
//!
//! Each [`Queue`] owns a FIFO of submitted [`SyncToken`]s and a dedicated thread that waits on the
//! oldest one, reports it through the session's [`RetireSink`] and hands the token back to the
//! device's [`TokenPool`]. Only the head of the FIFO is ever waited on, so retirements for one
//! queue are reported in submission order even if the driver signals fences out of order.
//!
//! Lock discipline: the queue mutex and the pool mutex are only ever held together by
//! [`crate::Device::token_census`], which takes the pool mutex first.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::driver::{
    timeout_ns, DeviceHandle, DriverTable, FenceHandle, QueueCreateFlags, QueueHandle, VkResult,
};
use crate::error::{ProtocolViolation, Result, SyncError};
use crate::object::{ObjectId, VkObject};
use crate::session::{RetireSink, Session};
use crate::token::{SyncToken, TokenPool};

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<SyncToken>,
    join: bool,
}

#[derive(Debug, Default)]
struct QueueShared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("queue lock poisoned")
    }
}

/// Everything the retirement thread needs; deliberately excludes the [`Queue`] itself so the
/// thread never keeps its queue alive.
struct RetireWorker {
    ctx_id: u32,
    device: DeviceHandle,
    driver: Arc<dyn DriverTable>,
    pool: Arc<TokenPool>,
    retire: Arc<dyn RetireSink>,
    shared: Arc<QueueShared>,
    fence_wait_timeout: Duration,
}

/// Outcome of waiting on the head token.
enum HeadWait {
    Complete,
    TimedOut,
}

impl RetireWorker {
    fn run(self) {
        tracing::debug!(ctx_id = self.ctx_id, "queue retirement worker started");

        let mut state = self.shared.lock();
        loop {
            if state.join {
                break;
            }
            let Some(head) = state.pending.front() else {
                state = self.shared.cond.wait(state).expect("queue lock poisoned");
                continue;
            };
            let fence = head.fence();
            let device_lost = head.device_lost();
            drop(state);

            let outcome = self.wait_head(fence, device_lost);

            state = self.shared.lock();
            if let HeadWait::TimedOut = outcome {
                continue;
            }

            // Single consumer: nobody else pops, so the head is still the token waited on.
            let Some(token) = state.pending.pop_front() else {
                continue;
            };
            debug_assert_eq!(token.fence(), fence);
            drop(state);

            self.retire(token);

            state = self.shared.lock();
        }
        drop(state);

        tracing::debug!(ctx_id = self.ctx_id, "queue retirement worker exiting");
    }

    fn wait_head(&self, fence: FenceHandle, device_lost: bool) -> HeadWait {
        if device_lost {
            // Waiting on a fence after device loss cannot make progress.
            return HeadWait::Complete;
        }

        let result = self.driver.wait_for_fences(
            self.device,
            &[fence],
            true,
            timeout_ns(self.fence_wait_timeout),
        );
        match result {
            VkResult::Timeout => {
                tracing::trace!(ctx_id = self.ctx_id, ?fence, "sync fence wait timed out");
                HeadWait::TimedOut
            }
            VkResult::Success => HeadWait::Complete,
            result => {
                tracing::debug!(ctx_id = self.ctx_id, ?fence, ?result, "sync fence wait failed");
                HeadWait::Complete
            }
        }
    }

    fn retire(&self, token: SyncToken) {
        retire_token(self.ctx_id, &*self.retire, &self.pool, token);
    }
}

fn retire_token(ctx_id: u32, retire: &dyn RetireSink, pool: &TokenPool, token: SyncToken) {
    tracing::trace!(
        ctx_id,
        ring_idx = token.ring_idx(),
        fence_id = token.fence_id(),
        "retiring sync fence"
    );
    retire.retire_fence(ctx_id, token.ring_idx(), token.fence_id());
    pool.release(token);
}

pub struct Queue {
    handle: QueueHandle,
    flags: QueueCreateFlags,
    family: u32,
    index: u32,
    ctx_id: u32,

    /// Client-visible object id; 0 until [`Queue::assign_identity`] binds it.
    id: AtomicU64,
    /// Ring this queue reports against; 0 when unbound.
    ring_idx: AtomicU32,

    driver: Arc<dyn DriverTable>,
    pool: Arc<TokenPool>,
    retire: Arc<dyn RetireSink>,
    shared: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("handle", &self.handle)
            .field("flags", &self.flags)
            .field("family", &self.family)
            .field("index", &self.index)
            .field("id", &self.id())
            .field("ring_idx", &self.ring_idx())
            .finish_non_exhaustive()
    }
}

/// Identity of a queue within its device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub flags: QueueCreateFlags,
    pub family: u32,
    pub index: u32,
}

impl Queue {
    /// Creates the queue and starts its retirement worker.
    pub(crate) fn create(
        session: &Session,
        driver: Arc<dyn DriverTable>,
        pool: Arc<TokenPool>,
        device: DeviceHandle,
        key: QueueKey,
        handle: QueueHandle,
    ) -> Result<Arc<Self>> {
        let shared = Arc::new(QueueShared::default());
        let retire = session.retire_sink();
        let config = session.config();

        let worker = RetireWorker {
            ctx_id: session.ctx_id(),
            device,
            driver: driver.clone(),
            pool: pool.clone(),
            retire: retire.clone(),
            shared: shared.clone(),
            fence_wait_timeout: config.fence_wait_timeout,
        };
        let thread = std::thread::Builder::new()
            .name(format!("{}-{}", config.worker_name_prefix, session.ctx_id()))
            .spawn(move || worker.run())
            .map_err(SyncError::WorkerSpawn)?;

        Ok(Arc::new(Self {
            handle,
            flags: key.flags,
            family: key.family,
            index: key.index,
            ctx_id: session.ctx_id(),
            id: AtomicU64::new(0),
            ring_idx: AtomicU32::new(0),
            driver,
            pool,
            retire,
            shared,
            worker: Mutex::new(Some(thread)),
        }))
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle
    }

    pub fn key(&self) -> QueueKey {
        QueueKey {
            flags: self.flags,
            family: self.family,
            index: self.index,
        }
    }

    pub fn flags(&self) -> QueueCreateFlags {
        self.flags
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn driver(&self) -> &dyn DriverTable {
        &*self.driver
    }

    /// Client-visible id, or 0 while the queue is unbound.
    pub fn id(&self) -> ObjectId {
        self.id.load(Ordering::Acquire)
    }

    pub fn ring_idx(&self) -> u32 {
        self.ring_idx.load(Ordering::Acquire)
    }

    pub(crate) fn set_ring_idx(&self, ring_idx: u32) {
        self.ring_idx.store(ring_idx, Ordering::Release);
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Fences of the pending tokens, oldest first.
    pub fn pending_fences(&self) -> Vec<FenceHandle> {
        self.shared.lock().pending.iter().map(SyncToken::fence).collect()
    }

    /// `true` once the retirement worker has been joined.
    pub fn worker_joined(&self) -> bool {
        self.worker.lock().expect("queue worker lock poisoned").is_none()
    }

    /// Issues a synchronization-only submission and queues its token for retirement.
    ///
    /// Device loss is not reported as a failure: the token is queued with its device-lost flag set
    /// and retired without waiting. Any other driver failure returns the token to the pool.
    /// Fails with [`SyncError::QueueShutDown`] once the retirement worker has been stopped.
    pub fn submit(&self, flags: u32, ring_idx: u32, fence_id: u64) -> Result<()> {
        if self.shared.lock().join {
            return Err(SyncError::QueueShutDown);
        }
        let mut token = self.pool.acquire(flags, ring_idx, fence_id)?;

        match self.driver.queue_submit(self.handle, &[], Some(token.fence())) {
            VkResult::Success => {}
            VkResult::DeviceLost => {
                token.mark_device_lost();
                tracing::warn!(
                    ctx_id = self.ctx_id,
                    fence_id,
                    "sync submit hit device lost"
                );
            }
            result => {
                self.pool.release(token);
                tracing::warn!(
                    ctx_id = self.ctx_id,
                    fence_id,
                    ?result,
                    "sync submit failed"
                );
                return Err(SyncError::Driver {
                    op: "vkQueueSubmit",
                    result,
                });
            }
        }

        let mut state = self.shared.lock();
        if state.join {
            drop(state);
            self.pool.release(token);
            return Err(SyncError::QueueShutDown);
        }
        state.pending.push_back(token);
        drop(state);
        self.shared.cond.notify_one();
        Ok(())
    }

    /// Binds the client-visible id. Repeating the call with the same id is a no-op; a different id
    /// is a protocol violation.
    pub fn assign_identity(self: &Arc<Self>, session: &Session, id: ObjectId) -> Result<()> {
        let existing = self.id();
        if existing != 0 {
            if existing != id {
                return Err(session.fail(ProtocolViolation::IdentityMismatch {
                    existing,
                    requested: id,
                }));
            }
            return Ok(());
        }

        session
            .objects()
            .validate_id(id)
            .map_err(|violation| session.fail(violation))?;

        if let Err(existing) = self
            .id
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
        {
            if existing != id {
                return Err(session.fail(ProtocolViolation::IdentityMismatch {
                    existing,
                    requested: id,
                }));
            }
            return Ok(());
        }

        session
            .objects()
            .insert(id, VkObject::Queue(self.clone()))
            .map_err(|violation| session.fail(violation))
    }

    /// Stops the worker and retires every token still pending, without waiting on fences.
    ///
    /// The caller must have idled the device first; otherwise pending fences may not have signalled
    /// yet and completions would be reported early. Returns the number of drained tokens.
    pub(crate) fn retire_all(&self) -> usize {
        self.stop_worker();

        let drained: Vec<SyncToken> = self.shared.lock().pending.drain(..).collect();
        let count = drained.len();
        for token in drained {
            retire_token(self.ctx_id, &*self.retire, &self.pool, token);
        }
        count
    }

    fn stop_worker(&self) {
        let Some(thread) = self
            .worker
            .lock()
            .expect("queue worker lock poisoned")
            .take()
        else {
            return;
        };

        self.shared.lock().join = true;
        self.shared.cond.notify_one();
        if thread.join().is_err() {
            tracing::error!(ctx_id = self.ctx_id, "queue retirement worker panicked");
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        let drained = self.retire_all();
        if drained > 0 {
            tracing::debug!(ctx_id = self.ctx_id, drained, "queue dropped with pending tokens");
        }
    }
}
