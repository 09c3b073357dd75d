//! Reusable completion tokens and the per-device pool that recycles them.
//!
//! Creating driver fences is comparatively expensive, so every token retired by a queue goes back
//! onto the pool's free list and its fence is reset (not destroyed) when the token is handed out
//! again. A [`SyncToken`] is a move-only value: at any time it is owned by exactly one of the free
//! list, a queue's pending FIFO, or the code path currently transferring it between the two.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::driver::{
    DeviceCaps, DeviceHandle, DriverTable, ExternalFenceHandleTypes, FenceCreateInfo, FenceHandle,
    VkResult,
};
use crate::error::{Result, SyncError};

#[derive(Debug)]
pub struct SyncToken {
    fence: FenceHandle,
    flags: u32,
    ring_idx: u32,
    fence_id: u64,
    device_lost: bool,
}

impl SyncToken {
    pub fn fence(&self) -> FenceHandle {
        self.fence
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Ring the retirement is reported against; 0 when the submission is not ring-addressed.
    pub fn ring_idx(&self) -> u32 {
        self.ring_idx
    }

    pub fn fence_id(&self) -> u64 {
        self.fence_id
    }

    /// Set when the submission carrying this token hit device loss. Such a token is retired
    /// without waiting on its fence.
    pub fn device_lost(&self) -> bool {
        self.device_lost
    }

    pub(crate) fn mark_device_lost(&mut self) {
        self.device_lost = true;
    }
}

pub struct TokenPool {
    device: DeviceHandle,
    driver: Arc<dyn DriverTable>,
    export_types: ExternalFenceHandleTypes,
    free: Mutex<VecDeque<SyncToken>>,
    /// Tokens whose fence currently exists, whether free or in flight.
    allocated: AtomicUsize,
}

impl std::fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPool")
            .field("device", &self.device)
            .field("export_types", &self.export_types)
            .field("free", &self.free_len())
            .field("allocated", &self.allocated())
            .finish()
    }
}

impl TokenPool {
    pub fn new(driver: Arc<dyn DriverTable>, device: DeviceHandle, caps: DeviceCaps) -> Self {
        let export_types = if caps.external_fence_fd {
            ExternalFenceHandleTypes::SYNC_FD
        } else {
            ExternalFenceHandleTypes::empty()
        };
        Self {
            device,
            driver,
            export_types,
            free: Mutex::new(VecDeque::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SyncToken>> {
        self.free.lock().expect("token pool lock poisoned")
    }

    /// Hands out a token for a new sync submission, recycling a free one when possible.
    pub fn acquire(&self, flags: u32, ring_idx: u32, fence_id: u64) -> Result<SyncToken> {
        let recycled = self.lock().pop_front();

        let mut token = match recycled {
            Some(token) => match self.driver.reset_fences(self.device, &[token.fence]) {
                VkResult::Success => token,
                result => {
                    // A fence that cannot be reset could report stale completion; replace it.
                    tracing::warn!(fence_id, ?result, "failed to reset pooled sync fence");
                    self.driver.destroy_fence(self.device, token.fence);
                    self.allocated.fetch_sub(1, Ordering::AcqRel);
                    self.create(fence_id)?
                }
            },
            None => self.create(fence_id)?,
        };

        token.device_lost = false;
        token.flags = flags;
        token.ring_idx = ring_idx;
        token.fence_id = fence_id;
        Ok(token)
    }

    fn create(&self, fence_id: u64) -> Result<SyncToken> {
        let info = FenceCreateInfo {
            export_handle_types: self.export_types,
            ..Default::default()
        };
        let fence = self.driver.create_fence(self.device, &info).map_err(|result| {
            tracing::warn!(fence_id, ?result, "failed to create sync fence");
            SyncError::TokenAllocation { fence_id, result }
        })?;
        self.allocated.fetch_add(1, Ordering::AcqRel);

        Ok(SyncToken {
            fence,
            flags: 0,
            ring_idx: 0,
            fence_id,
            device_lost: false,
        })
    }

    /// Returns a retired (or rejected) token to the free list.
    pub fn release(&self, token: SyncToken) {
        self.lock().push_back(token);
    }

    pub fn free_len(&self) -> usize {
        self.lock().len()
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Fences of the tokens currently on the free list.
    pub fn free_fences(&self) -> Vec<FenceHandle> {
        self.lock().iter().map(SyncToken::fence).collect()
    }

    /// Runs `f` on the free fences while holding the pool lock, so no token can enter or leave the
    /// free list until it returns.
    pub(crate) fn with_free_fences<R>(&self, f: impl FnOnce(Vec<FenceHandle>) -> R) -> R {
        let free = self.lock();
        f(free.iter().map(SyncToken::fence).collect())
    }

    /// Destroys every free token's fence. Only valid at device teardown, after all queues drained.
    pub(crate) fn destroy_free(&self) -> usize {
        let drained: Vec<SyncToken> = self.lock().drain(..).collect();
        for token in &drained {
            self.driver.destroy_fence(self.device, token.fence);
        }
        self.allocated.fetch_sub(drained.len(), Ordering::AcqRel);
        drained.len()
    }
}

impl Drop for TokenPool {
    fn drop(&mut self) {
        let destroyed = self.destroy_free();
        if destroyed > 0 {
            tracing::debug!(destroyed, "token pool dropped with free fences");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SoftDriver;

    const DEV: DeviceHandle = DeviceHandle(1);

    fn pool(caps: DeviceCaps) -> (Arc<SoftDriver>, TokenPool) {
        let driver = Arc::new(SoftDriver::new());
        let pool = TokenPool::new(driver.clone(), DEV, caps);
        (driver, pool)
    }

    #[test]
    fn empty_pool_creates_new_fences() {
        let (driver, pool) = pool(DeviceCaps::default());
        let a = pool.acquire(0, 1, 100).unwrap();
        let b = pool.acquire(0, 1, 101).unwrap();

        assert_ne!(a.fence(), b.fence());
        assert_eq!(driver.fences_created(), 2);
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.free_len(), 0);
    }

    #[test]
    fn released_tokens_are_reset_and_reused() {
        let (driver, pool) = pool(DeviceCaps::default());
        let mut token = pool.acquire(7, 3, 100).unwrap();
        let fence = token.fence();
        token.mark_device_lost();
        driver.signal_fence(fence);
        pool.release(token);
        assert_eq!(pool.free_fences(), vec![fence]);

        let token = pool.acquire(1, 4, 200).unwrap();
        assert_eq!(token.fence(), fence);
        assert_eq!(token.flags(), 1);
        assert_eq!(token.ring_idx(), 4);
        assert_eq!(token.fence_id(), 200);
        assert!(!token.device_lost());
        assert!(!driver.fence_is_signaled(fence));
        assert_eq!(driver.fences_created(), 1);
        assert_eq!(driver.fence_reset_count(), 1);
    }

    #[test]
    fn creation_failure_has_no_side_effects() {
        let (driver, pool) = pool(DeviceCaps::default());
        driver.fail_fence_creations(1);

        let err = pool.acquire(0, 0, 55).unwrap_err();
        assert!(matches!(
            err,
            SyncError::TokenAllocation {
                fence_id: 55,
                result: VkResult::OutOfHostMemory
            }
        ));
        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.free_len(), 0);
        assert_eq!(driver.live_fence_count(), 0);
    }

    #[test]
    fn fences_are_exportable_only_with_external_fence_fd() {
        let (driver, pool) = pool(DeviceCaps {
            external_fence_fd: true,
        });
        let token = pool.acquire(0, 0, 1).unwrap();
        assert!(driver.export_fence_sync_fd(DEV, token.fence()).is_ok());

        let (driver, pool) = self::pool(DeviceCaps::default());
        let token = pool.acquire(0, 0, 1).unwrap();
        assert!(driver.export_fence_sync_fd(DEV, token.fence()).is_err());
    }

    #[test]
    fn dropping_the_pool_destroys_free_fences() {
        let (driver, pool) = pool(DeviceCaps::default());
        let a = pool.acquire(0, 0, 1).unwrap();
        pool.release(a);
        assert_eq!(driver.live_fence_count(), 1);

        drop(pool);
        assert_eq!(driver.live_fence_count(), 0);
    }

    #[test]
    fn destroy_free_releases_driver_fences() {
        let (driver, pool) = pool(DeviceCaps::default());
        let a = pool.acquire(0, 0, 1).unwrap();
        let b = pool.acquire(0, 0, 2).unwrap();
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.destroy_free(), 2);
        assert_eq!(pool.allocated(), 0);
        assert_eq!(driver.live_fence_count(), 0);
    }
}
