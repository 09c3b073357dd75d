//! Devices: the realized queues, the shared token pool and the ring table.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::driver::{DeviceCaps, DeviceHandle, DriverTable, FenceHandle, QueueCreateFlags};
use crate::error::{ProtocolViolation, Result, SyncError};
use crate::queue::{Queue, QueueKey};
use crate::session::Session;
use crate::token::TokenPool;

/// Queues requested for one family at device creation (`VkDeviceQueueCreateInfo`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueCreateInfo {
    pub flags: QueueCreateFlags,
    pub family: u32,
    pub count: u32,
}

/// Where every token owned by a device's containers sat at one instant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenCensus {
    /// Fences on the pool's free list.
    pub free: Vec<FenceHandle>,
    /// Fences pending on each queue, in [`Device::queues`] order, oldest first.
    pub pending: Vec<Vec<FenceHandle>>,
}

pub struct Device {
    handle: DeviceHandle,
    driver: Arc<dyn DriverTable>,
    pool: Arc<TokenPool>,
    queues: Mutex<Vec<Arc<Queue>>>,
    /// Ring index -> bound queue. Slot 0 is reserved and always empty.
    rings: Mutex<Vec<Option<Arc<Queue>>>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle)
            .field("pool", &self.pool)
            .field("queues", &self.queues())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Creates one [`Queue`] (with its retirement worker) per distinct (flags, family, index).
    pub fn realize(
        session: &Session,
        driver: Arc<dyn DriverTable>,
        handle: DeviceHandle,
        caps: DeviceCaps,
        queue_infos: &[QueueCreateInfo],
    ) -> Result<Self> {
        let pool = Arc::new(TokenPool::new(driver.clone(), handle, caps));

        let mut queues: Vec<Arc<Queue>> = Vec::new();
        for info in queue_infos {
            for index in 0..info.count {
                let key = QueueKey {
                    flags: info.flags,
                    family: info.family,
                    index,
                };
                if queues.iter().any(|queue| queue.key() == key) {
                    continue;
                }

                let queue_handle = driver.get_device_queue(handle, key.flags, key.family, index);
                queues.push(Queue::create(
                    session,
                    driver.clone(),
                    pool.clone(),
                    handle,
                    key,
                    queue_handle,
                )?);
            }
        }

        tracing::debug!(
            ctx_id = session.ctx_id(),
            queues = queues.len(),
            external_fence_fd = caps.external_fence_fd,
            "device realized"
        );

        Ok(Self {
            handle,
            driver,
            pool,
            queues: Mutex::new(queues),
            rings: Mutex::new(vec![None; session.config().ring_count]),
        })
    }

    fn lock_queues(&self) -> MutexGuard<'_, Vec<Arc<Queue>>> {
        self.queues.lock().expect("device queue list lock poisoned")
    }

    fn lock_rings(&self) -> MutexGuard<'_, Vec<Option<Arc<Queue>>>> {
        self.rings.lock().expect("device ring table lock poisoned")
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn driver(&self) -> &dyn DriverTable {
        &*self.driver
    }

    pub fn pool(&self) -> &TokenPool {
        &self.pool
    }

    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.lock_queues().clone()
    }

    pub fn ring_count(&self) -> usize {
        self.lock_rings().len()
    }

    /// Finds the realized queue created with exactly these parameters.
    pub fn lookup_queue(
        &self,
        flags: QueueCreateFlags,
        family: u32,
        index: u32,
    ) -> Option<Arc<Queue>> {
        let key = QueueKey {
            flags,
            family,
            index,
        };
        self.lock_queues()
            .iter()
            .find(|queue| queue.key() == key)
            .cloned()
    }

    /// Claims ring slot `ring_idx` for `queue`.
    ///
    /// Fatal if the index is 0 or out of range, if the slot is taken, or if the queue already has a
    /// ring (even the same one). On failure the ring table is left untouched.
    pub fn bind_ring(&self, session: &Session, queue: &Arc<Queue>, ring_idx: u32) -> Result<()> {
        let mut rings = self.lock_rings();

        let slot = usize::try_from(ring_idx)
            .ok()
            .filter(|slot| *slot != 0 && *slot < rings.len())
            .ok_or_else(|| session.fail(ProtocolViolation::InvalidRingIndex(ring_idx)))?;

        let queue_ring = queue.ring_idx();
        if queue_ring != 0 {
            return Err(session.fail(ProtocolViolation::QueueAlreadyBound {
                queue_ring,
                requested: ring_idx,
            }));
        }
        if rings[slot].is_some() {
            return Err(session.fail(ProtocolViolation::RingAlreadyBound(ring_idx)));
        }

        rings[slot] = Some(queue.clone());
        queue.set_ring_idx(ring_idx);
        tracing::debug!(
            ctx_id = session.ctx_id(),
            ring_idx,
            family = queue.family(),
            index = queue.index(),
            "queue bound to ring"
        );
        Ok(())
    }

    pub fn ring_queue(&self, ring_idx: u32) -> Option<Arc<Queue>> {
        let slot = usize::try_from(ring_idx).ok()?;
        self.lock_rings().get(slot).cloned().flatten()
    }

    /// Snapshots the pool's free list and every queue's pending FIFO.
    ///
    /// The pool lock is held across all queue reads, so tokens in transit between a FIFO and the
    /// free list show up in neither.
    pub fn token_census(&self) -> TokenCensus {
        let queues = self.queues();
        self.pool.with_free_fences(|free| TokenCensus {
            free,
            pending: queues.iter().map(|queue| queue.pending_fences()).collect(),
        })
    }

    /// Submits a sync-only fence on the queue bound to `ring_idx`.
    pub fn submit_ring_fence(&self, flags: u32, ring_idx: u32, fence_id: u64) -> Result<()> {
        let queue = self
            .ring_queue(ring_idx)
            .ok_or(SyncError::UnboundRing(ring_idx))?;
        queue.submit(flags, ring_idx, fence_id)
    }

    /// Tears down one queue: joins its worker, retires everything still pending and detaches it from
    /// the queue list, its ring slot and (when bound) the object table.
    ///
    /// The device must already be idle. Returns the number of tokens drained after the join.
    pub fn destroy_queue(&self, session: &Session, queue: &Arc<Queue>) -> usize {
        let drained = queue.retire_all();

        self.lock_queues().retain(|q| !Arc::ptr_eq(q, queue));

        let ring_idx = queue.ring_idx();
        if ring_idx > 0 {
            let mut rings = self.lock_rings();
            if let Some(slot) = rings.get_mut(ring_idx as usize) {
                if slot.as_ref().is_some_and(|bound| Arc::ptr_eq(bound, queue)) {
                    *slot = None;
                }
            }
        }

        let id = queue.id();
        if id != 0 {
            session.objects().remove(id);
        }

        tracing::debug!(
            ctx_id = session.ctx_id(),
            family = queue.family(),
            index = queue.index(),
            drained,
            "queue destroyed"
        );
        drained
    }

    /// Idles the device, destroys every queue and frees the pooled fences.
    ///
    /// Returns the number of tokens drained from the queues.
    pub fn destroy(&self, session: &Session) -> usize {
        let result = self.driver.device_wait_idle(self.handle);
        if !result.is_success() {
            tracing::warn!(ctx_id = session.ctx_id(), ?result, "device wait idle failed");
        }

        let drained: usize = self
            .queues()
            .iter()
            .map(|queue| self.destroy_queue(session, queue))
            .sum();

        let fences = self.pool.destroy_free();
        tracing::debug!(ctx_id = session.ctx_id(), drained, fences, "device destroyed");
        drained
    }
}

impl Drop for Device {
    /// Idles the device when it was never destroyed, so the queues dropped with it only retire
    /// completed work.
    fn drop(&mut self) {
        let queues = self.lock_queues().len();
        if queues == 0 {
            return;
        }
        let result = self.driver.device_wait_idle(self.handle);
        tracing::debug!(queues, ?result, "device dropped without destroy");
    }
}
