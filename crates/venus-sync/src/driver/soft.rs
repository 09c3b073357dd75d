//! Host-only software implementation of [`DriverTable`].
//!
//! Fences and semaphores are plain host objects guarded by one mutex. Work "executes" the moment it
//! is submitted when auto-signalling is enabled; otherwise fences stay pending until
//! [`SoftDriver::signal_fence`] is called, which lets tests complete them in any order.
//!
//! The software driver has no kernel sync objects, so exported sync-fd payloads are always reported
//! as already signalled.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{
    BindSparseInfo, DeviceHandle, DriverTable, EventCreateInfo, EventHandle, FenceCreateFlags,
    FenceCreateInfo, FenceHandle, QueueCreateFlags, QueueHandle, SemaphoreCreateInfo,
    SemaphoreHandle, SemaphoreImportFlags, SemaphoreType, SemaphoreValue, SemaphoreWaitInfo,
    SubmitInfo, SubmitInfo2, SyncFdPayload, VkResult,
};

#[derive(Debug)]
struct SoftFence {
    signaled: bool,
    exportable: bool,
}

#[derive(Debug)]
struct SoftSemaphore {
    semaphore_type: SemaphoreType,
    value: u64,
}

#[derive(Debug, Default)]
struct SoftState {
    next_handle: u64,
    queues: HashMap<(QueueCreateFlags, u32, u32), QueueHandle>,
    fences: HashMap<FenceHandle, SoftFence>,
    semaphores: HashMap<SemaphoreHandle, SoftSemaphore>,
    events: HashMap<EventHandle, bool>,

    auto_signal: bool,
    device_lost: bool,
    submit_results: VecDeque<VkResult>,
    fence_creation_failures: usize,
    export_failures: usize,

    fences_created: usize,
    fence_resets: usize,
    fence_wait_calls: usize,
    wait_idle_calls: usize,
    submitted_fences: Vec<FenceHandle>,
}

impl SoftState {
    fn alloc_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn signal_semaphore(&mut self, semaphore: SemaphoreHandle, value: u64) {
        if let Some(sem) = self.semaphores.get_mut(&semaphore) {
            sem.value = match sem.semaphore_type {
                SemaphoreType::Binary => 1,
                SemaphoreType::Timeline => sem.value.max(value),
            };
        }
    }

    fn semaphore_reached(&self, wait: &SemaphoreValue) -> bool {
        self.semaphores.get(&wait.semaphore).is_some_and(|sem| match sem.semaphore_type {
            SemaphoreType::Binary => sem.value != 0,
            SemaphoreType::Timeline => sem.value >= wait.value,
        })
    }

    /// Consumes the next injected submission result, if any.
    fn take_submit_result(&mut self) -> Option<VkResult> {
        if self.device_lost {
            return Some(VkResult::DeviceLost);
        }
        self.submit_results.pop_front()
    }
}

#[derive(Debug, Default)]
pub struct SoftDriver {
    state: Mutex<SoftState>,
    cond: Condvar,
}

impl SoftDriver {
    /// Creates a driver whose fences stay pending until explicitly signalled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a driver that completes every submission immediately.
    pub fn auto_signaling() -> Self {
        let driver = Self::new();
        driver.set_auto_signal(true);
        driver
    }

    fn lock(&self) -> MutexGuard<'_, SoftState> {
        self.state.lock().expect("soft driver lock poisoned")
    }

    pub fn set_auto_signal(&self, enabled: bool) {
        self.lock().auto_signal = enabled;
    }

    /// Signals a pending fence, waking any thread blocked on it.
    pub fn signal_fence(&self, fence: FenceHandle) {
        let mut state = self.lock();
        if let Some(f) = state.fences.get_mut(&fence) {
            f.signaled = true;
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Makes the next queue submission return `result` instead of executing.
    pub fn inject_submit_result(&self, result: VkResult) {
        self.lock().submit_results.push_back(result);
    }

    /// Makes the next `count` fence creations fail with `VK_ERROR_OUT_OF_HOST_MEMORY`.
    pub fn fail_fence_creations(&self, count: usize) {
        self.lock().fence_creation_failures = count;
    }

    /// Makes the next `count` sync-fd exports fail.
    pub fn fail_exports(&self, count: usize) {
        self.lock().export_failures = count;
    }

    /// Puts the device into the lost state: submissions and waits report `VK_ERROR_DEVICE_LOST`.
    pub fn lose_device(&self) {
        self.lock().device_lost = true;
        self.cond.notify_all();
    }

    pub fn fence_is_signaled(&self, fence: FenceHandle) -> bool {
        self.lock().fences.get(&fence).is_some_and(|f| f.signaled)
    }

    pub fn live_fence_count(&self) -> usize {
        self.lock().fences.len()
    }

    pub fn fences_created(&self) -> usize {
        self.lock().fences_created
    }

    pub fn fence_reset_count(&self) -> usize {
        self.lock().fence_resets
    }

    /// Number of `wait_for_fences` calls observed so far.
    pub fn fence_wait_calls(&self) -> usize {
        self.lock().fence_wait_calls
    }

    pub fn wait_idle_calls(&self) -> usize {
        self.lock().wait_idle_calls
    }

    /// Fences attached to successful submissions that did not complete on submit, in submission
    /// order. Cleared by `device_wait_idle`.
    pub fn submitted_fences(&self) -> Vec<FenceHandle> {
        self.lock().submitted_fences.clone()
    }

    fn execute_submission(
        &self,
        fence: Option<FenceHandle>,
        signals: impl IntoIterator<Item = SemaphoreValue>,
    ) -> VkResult {
        let mut state = self.lock();
        if let Some(result) = state.take_submit_result() {
            return result;
        }

        if let Some(fence) = fence {
            if !state.fences.contains_key(&fence) {
                return VkResult::Other(VkResult::ERROR_INVALID_EXTERNAL_HANDLE);
            }
            if !state.auto_signal {
                state.submitted_fences.push(fence);
            }
        }

        if state.auto_signal {
            for signal in signals {
                state.signal_semaphore(signal.semaphore, signal.value);
            }
            if let Some(f) = fence.and_then(|fence| state.fences.get_mut(&fence)) {
                f.signaled = true;
            }
            drop(state);
            self.cond.notify_all();
        }

        VkResult::Success
    }

    /// Waits on the condition variable until `ready` holds, the device is lost, or `timeout_ns`
    /// elapses.
    fn block_until(&self, timeout_ns: u64, ready: impl Fn(&SoftState) -> bool) -> VkResult {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.lock();
        loop {
            if state.device_lost {
                return VkResult::DeviceLost;
            }
            if ready(&state) {
                return VkResult::Success;
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return VkResult::Timeout;
                    }
                    deadline - now
                }
                // Effectively infinite.
                None => Duration::from_secs(3600),
            };
            state = self
                .cond
                .wait_timeout(state, remaining)
                .expect("soft driver lock poisoned")
                .0;
        }
    }
}

impl DriverTable for SoftDriver {
    fn get_device_queue(
        &self,
        _device: DeviceHandle,
        flags: QueueCreateFlags,
        family: u32,
        index: u32,
    ) -> QueueHandle {
        let mut state = self.lock();
        if let Some(handle) = state.queues.get(&(flags, family, index)) {
            return *handle;
        }
        let handle = QueueHandle(state.alloc_handle());
        state.queues.insert((flags, family, index), handle);
        handle
    }

    fn device_wait_idle(&self, _device: DeviceHandle) -> VkResult {
        let mut state = self.lock();
        state.wait_idle_calls += 1;
        if state.device_lost {
            return VkResult::DeviceLost;
        }
        // Everything that was submitted has finished executing once the device is idle.
        let submitted = std::mem::take(&mut state.submitted_fences);
        for fence in submitted {
            if let Some(f) = state.fences.get_mut(&fence) {
                f.signaled = true;
            }
        }
        drop(state);
        self.cond.notify_all();
        VkResult::Success
    }

    fn create_fence(
        &self,
        _device: DeviceHandle,
        info: &FenceCreateInfo,
    ) -> Result<FenceHandle, VkResult> {
        let mut state = self.lock();
        if state.fence_creation_failures > 0 {
            state.fence_creation_failures -= 1;
            return Err(VkResult::OutOfHostMemory);
        }
        let handle = FenceHandle(state.alloc_handle());
        state.fences.insert(
            handle,
            SoftFence {
                signaled: info.flags.contains(FenceCreateFlags::SIGNALED),
                exportable: !info.export_handle_types.is_empty(),
            },
        );
        state.fences_created += 1;
        Ok(handle)
    }

    fn destroy_fence(&self, _device: DeviceHandle, fence: FenceHandle) {
        self.lock().fences.remove(&fence);
    }

    fn reset_fences(&self, _device: DeviceHandle, fences: &[FenceHandle]) -> VkResult {
        let mut state = self.lock();
        for fence in fences {
            match state.fences.get_mut(fence) {
                Some(f) => f.signaled = false,
                None => return VkResult::Other(VkResult::ERROR_INVALID_EXTERNAL_HANDLE),
            }
        }
        state.fence_resets += fences.len();
        VkResult::Success
    }

    fn get_fence_status(&self, _device: DeviceHandle, fence: FenceHandle) -> VkResult {
        let state = self.lock();
        if state.device_lost {
            return VkResult::DeviceLost;
        }
        match state.fences.get(&fence) {
            Some(f) if f.signaled => VkResult::Success,
            Some(_) => VkResult::NotReady,
            None => VkResult::Other(VkResult::ERROR_INVALID_EXTERNAL_HANDLE),
        }
    }

    fn wait_for_fences(
        &self,
        _device: DeviceHandle,
        fences: &[FenceHandle],
        wait_all: bool,
        timeout_ns: u64,
    ) -> VkResult {
        self.lock().fence_wait_calls += 1;
        self.block_until(timeout_ns, |state| {
            let mut signaled = fences
                .iter()
                .map(|fence| state.fences.get(fence).is_some_and(|f| f.signaled));
            if wait_all {
                signaled.all(|s| s)
            } else {
                signaled.any(|s| s)
            }
        })
    }

    fn export_fence_sync_fd(
        &self,
        _device: DeviceHandle,
        fence: FenceHandle,
    ) -> Result<SyncFdPayload, VkResult> {
        let mut state = self.lock();
        if state.export_failures > 0 {
            state.export_failures -= 1;
            return Err(VkResult::Other(VkResult::ERROR_INVALID_EXTERNAL_HANDLE));
        }
        match state.fences.get(&fence) {
            Some(f) if f.exportable => Ok(SyncFdPayload::Signaled),
            _ => Err(VkResult::Other(VkResult::ERROR_INVALID_EXTERNAL_HANDLE)),
        }
    }

    fn queue_submit(
        &self,
        _queue: QueueHandle,
        submits: &[SubmitInfo],
        fence: Option<FenceHandle>,
    ) -> VkResult {
        let signals = submits
            .iter()
            .flat_map(|submit| submit.signal_semaphores.iter().copied());
        self.execute_submission(fence, signals)
    }

    fn queue_submit2(
        &self,
        _queue: QueueHandle,
        submits: &[SubmitInfo2],
        fence: Option<FenceHandle>,
    ) -> VkResult {
        let signals = submits.iter().flat_map(|submit| {
            submit
                .signal_semaphore_infos
                .iter()
                .map(|info| SemaphoreValue {
                    semaphore: info.semaphore,
                    value: info.value,
                })
        });
        self.execute_submission(fence, signals)
    }

    fn queue_bind_sparse(
        &self,
        _queue: QueueHandle,
        binds: &[BindSparseInfo],
        fence: Option<FenceHandle>,
    ) -> VkResult {
        let signals = binds.iter().flat_map(|bind| {
            bind.signal_semaphores.iter().map(|semaphore| SemaphoreValue {
                semaphore: *semaphore,
                value: 1,
            })
        });
        self.execute_submission(fence, signals)
    }

    fn create_semaphore(
        &self,
        _device: DeviceHandle,
        info: &SemaphoreCreateInfo,
    ) -> Result<SemaphoreHandle, VkResult> {
        let mut state = self.lock();
        let handle = SemaphoreHandle(state.alloc_handle());
        let value = match info.semaphore_type {
            SemaphoreType::Binary => 0,
            SemaphoreType::Timeline => info.initial_value,
        };
        state.semaphores.insert(
            handle,
            SoftSemaphore {
                semaphore_type: info.semaphore_type,
                value,
            },
        );
        Ok(handle)
    }

    fn destroy_semaphore(&self, _device: DeviceHandle, semaphore: SemaphoreHandle) {
        self.lock().semaphores.remove(&semaphore);
    }

    fn get_semaphore_counter_value(
        &self,
        _device: DeviceHandle,
        semaphore: SemaphoreHandle,
    ) -> Result<u64, VkResult> {
        let state = self.lock();
        if state.device_lost {
            return Err(VkResult::DeviceLost);
        }
        state
            .semaphores
            .get(&semaphore)
            .map(|sem| sem.value)
            .ok_or(VkResult::Other(VkResult::ERROR_INVALID_EXTERNAL_HANDLE))
    }

    fn wait_semaphores(
        &self,
        _device: DeviceHandle,
        info: &SemaphoreWaitInfo,
        timeout_ns: u64,
    ) -> VkResult {
        self.block_until(timeout_ns, |state| {
            let mut reached = info.semaphores.iter().map(|wait| state.semaphore_reached(wait));
            if info.wait_any {
                reached.any(|r| r)
            } else {
                reached.all(|r| r)
            }
        })
    }

    fn signal_semaphore(&self, _device: DeviceHandle, signal: SemaphoreValue) -> VkResult {
        let mut state = self.lock();
        if state.device_lost {
            return VkResult::DeviceLost;
        }
        state.signal_semaphore(signal.semaphore, signal.value);
        drop(state);
        self.cond.notify_all();
        VkResult::Success
    }

    fn export_semaphore_sync_fd(
        &self,
        _device: DeviceHandle,
        semaphore: SemaphoreHandle,
    ) -> Result<SyncFdPayload, VkResult> {
        let mut state = self.lock();
        if state.export_failures > 0 {
            state.export_failures -= 1;
            return Err(VkResult::Other(VkResult::ERROR_INVALID_EXTERNAL_HANDLE));
        }
        if !state.semaphores.contains_key(&semaphore) {
            return Err(VkResult::Other(VkResult::ERROR_INVALID_EXTERNAL_HANDLE));
        }
        Ok(SyncFdPayload::Signaled)
    }

    fn import_semaphore_sync_fd(
        &self,
        _device: DeviceHandle,
        semaphore: SemaphoreHandle,
        _flags: SemaphoreImportFlags,
        payload: SyncFdPayload,
    ) -> VkResult {
        let mut state = self.lock();
        match state.semaphores.get(&semaphore).map(|sem| sem.semaphore_type) {
            Some(SemaphoreType::Binary) => {}
            // Sync-fd payloads can only be imported into binary semaphores.
            Some(SemaphoreType::Timeline) | None => {
                return VkResult::Other(VkResult::ERROR_INVALID_EXTERNAL_HANDLE)
            }
        }
        // An fd-backed payload would be waited on by the kernel; treat it as already complete.
        drop(payload);
        state.signal_semaphore(semaphore, 1);
        drop(state);
        self.cond.notify_all();
        VkResult::Success
    }

    fn create_event(
        &self,
        _device: DeviceHandle,
        _info: &EventCreateInfo,
    ) -> Result<EventHandle, VkResult> {
        let mut state = self.lock();
        let handle = EventHandle(state.alloc_handle());
        state.events.insert(handle, false);
        Ok(handle)
    }

    fn destroy_event(&self, _device: DeviceHandle, event: EventHandle) {
        self.lock().events.remove(&event);
    }

    fn get_event_status(&self, _device: DeviceHandle, event: EventHandle) -> VkResult {
        let state = self.lock();
        if state.device_lost {
            return VkResult::DeviceLost;
        }
        match state.events.get(&event) {
            Some(true) => VkResult::EventSet,
            Some(false) => VkResult::EventReset,
            None => VkResult::Other(VkResult::ERROR_INVALID_EXTERNAL_HANDLE),
        }
    }

    fn set_event(&self, _device: DeviceHandle, event: EventHandle) -> VkResult {
        match self.lock().events.get_mut(&event) {
            Some(set) => {
                *set = true;
                VkResult::Success
            }
            None => VkResult::Other(VkResult::ERROR_INVALID_EXTERNAL_HANDLE),
        }
    }

    fn reset_event(&self, _device: DeviceHandle, event: EventHandle) -> VkResult {
        match self.lock().events.get_mut(&event) {
            Some(set) => {
                *set = false;
                VkResult::Success
            }
            None => VkResult::Other(VkResult::ERROR_INVALID_EXTERNAL_HANDLE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ExternalFenceHandleTypes;
    use std::sync::Arc;
    use std::thread;

    const DEV: DeviceHandle = DeviceHandle(1);

    #[test]
    fn queue_handles_are_stable_per_triple() {
        let driver = SoftDriver::new();
        let a = driver.get_device_queue(DEV, QueueCreateFlags::empty(), 0, 0);
        let b = driver.get_device_queue(DEV, QueueCreateFlags::empty(), 0, 1);
        assert_ne!(a, b);
        assert_eq!(a, driver.get_device_queue(DEV, QueueCreateFlags::empty(), 0, 0));
    }

    #[test]
    fn pending_fence_times_out_then_completes_once_signalled() {
        let driver = Arc::new(SoftDriver::new());
        let queue = driver.get_device_queue(DEV, QueueCreateFlags::empty(), 0, 0);
        let fence = driver.create_fence(DEV, &FenceCreateInfo::default()).unwrap();

        assert_eq!(driver.queue_submit(queue, &[], Some(fence)), VkResult::Success);
        assert_eq!(
            driver.wait_for_fences(DEV, &[fence], true, 1_000_000),
            VkResult::Timeout
        );

        let signaller = {
            let driver = driver.clone();
            thread::spawn(move || driver.signal_fence(fence))
        };
        assert_eq!(
            driver.wait_for_fences(DEV, &[fence], true, u64::MAX),
            VkResult::Success
        );
        signaller.join().unwrap();
        assert_eq!(driver.fence_wait_calls(), 2);
    }

    #[test]
    fn injected_results_preempt_execution() {
        let driver = SoftDriver::auto_signaling();
        let queue = driver.get_device_queue(DEV, QueueCreateFlags::empty(), 0, 0);
        let fence = driver.create_fence(DEV, &FenceCreateInfo::default()).unwrap();

        driver.inject_submit_result(VkResult::OutOfDeviceMemory);
        assert_eq!(
            driver.queue_submit(queue, &[], Some(fence)),
            VkResult::OutOfDeviceMemory
        );
        assert!(!driver.fence_is_signaled(fence));

        assert_eq!(driver.queue_submit(queue, &[], Some(fence)), VkResult::Success);
        assert!(driver.fence_is_signaled(fence));
    }

    #[test]
    fn lost_device_fails_waits_and_submissions() {
        let driver = SoftDriver::new();
        let queue = driver.get_device_queue(DEV, QueueCreateFlags::empty(), 0, 0);
        let fence = driver.create_fence(DEV, &FenceCreateInfo::default()).unwrap();
        driver.lose_device();

        assert_eq!(
            driver.queue_submit(queue, &[], Some(fence)),
            VkResult::DeviceLost
        );
        assert_eq!(
            driver.wait_for_fences(DEV, &[fence], true, u64::MAX),
            VkResult::DeviceLost
        );
    }

    #[test]
    fn only_exportable_fences_export() {
        let driver = SoftDriver::new();
        let plain = driver.create_fence(DEV, &FenceCreateInfo::default()).unwrap();
        let exportable = driver
            .create_fence(
                DEV,
                &FenceCreateInfo {
                    export_handle_types: ExternalFenceHandleTypes::SYNC_FD,
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(driver.export_fence_sync_fd(DEV, plain).is_err());
        assert!(matches!(
            driver.export_fence_sync_fd(DEV, exportable),
            Ok(SyncFdPayload::Signaled)
        ));
    }

    #[test]
    fn submission_log_only_tracks_unfinished_work() {
        let driver = SoftDriver::new();
        let queue = driver.get_device_queue(DEV, QueueCreateFlags::empty(), 0, 0);
        let pending = driver.create_fence(DEV, &FenceCreateInfo::default()).unwrap();
        let immediate = driver.create_fence(DEV, &FenceCreateInfo::default()).unwrap();

        driver.queue_submit(queue, &[], Some(pending));
        driver.set_auto_signal(true);
        driver.queue_submit(queue, &[], Some(immediate));
        assert_eq!(driver.submitted_fences(), vec![pending]);

        assert_eq!(driver.device_wait_idle(DEV), VkResult::Success);
        assert!(driver.fence_is_signaled(pending));
        assert!(driver.submitted_fences().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn fd_backed_import_signals_binary_semaphore() {
        let driver = SoftDriver::new();
        let sem = driver
            .create_semaphore(DEV, &SemaphoreCreateInfo::default())
            .unwrap();
        let fd = std::os::fd::OwnedFd::from(std::fs::File::open("/dev/null").unwrap());

        assert_eq!(
            driver.import_semaphore_sync_fd(
                DEV,
                sem,
                SemaphoreImportFlags::TEMPORARY,
                SyncFdPayload::Fd(fd),
            ),
            VkResult::Success
        );
        assert_eq!(driver.get_semaphore_counter_value(DEV, sem), Ok(1));
    }

    #[test]
    fn timeline_semaphore_waits_for_value() {
        let driver = SoftDriver::new();
        let sem = driver
            .create_semaphore(
                DEV,
                &SemaphoreCreateInfo {
                    semaphore_type: SemaphoreType::Timeline,
                    initial_value: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        let wait = SemaphoreWaitInfo {
            wait_any: false,
            semaphores: vec![SemaphoreValue {
                semaphore: sem,
                value: 5,
            }],
        };

        assert_eq!(driver.wait_semaphores(DEV, &wait, 0), VkResult::Timeout);
        assert_eq!(
            driver.signal_semaphore(DEV, SemaphoreValue { semaphore: sem, value: 5 }),
            VkResult::Success
        );
        assert_eq!(driver.wait_semaphores(DEV, &wait, 0), VkResult::Success);
        assert_eq!(driver.get_semaphore_counter_value(DEV, sem), Ok(5));
    }
}
