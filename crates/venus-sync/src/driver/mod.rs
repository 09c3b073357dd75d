//! Boundary to the native graphics driver.
//!
//! [`DriverTable`] is the vetted set of entry points the synchronization layer is allowed to call.
//! Production builds back it with the host Vulkan loader; [`soft::SoftDriver`] is a host-only
//! implementation used by tests and the soak binary.

pub mod soft;

use std::time::Duration;

pub use soft::SoftDriver;

/// Result codes reported by driver entry points (subset of `VkResult`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VkResult {
    Success,
    NotReady,
    Timeout,
    EventSet,
    EventReset,
    Incomplete,
    OutOfHostMemory,
    OutOfDeviceMemory,
    DeviceLost,
    Other(i32),
}

impl VkResult {
    pub const ERROR_INVALID_EXTERNAL_HANDLE: i32 = -1_000_072_003;

    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => VkResult::Success,
            1 => VkResult::NotReady,
            2 => VkResult::Timeout,
            3 => VkResult::EventSet,
            4 => VkResult::EventReset,
            5 => VkResult::Incomplete,
            -1 => VkResult::OutOfHostMemory,
            -2 => VkResult::OutOfDeviceMemory,
            -4 => VkResult::DeviceLost,
            other => VkResult::Other(other),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            VkResult::Success => 0,
            VkResult::NotReady => 1,
            VkResult::Timeout => 2,
            VkResult::EventSet => 3,
            VkResult::EventReset => 4,
            VkResult::Incomplete => 5,
            VkResult::OutOfHostMemory => -1,
            VkResult::OutOfDeviceMemory => -2,
            VkResult::DeviceLost => -4,
            VkResult::Other(raw) => raw,
        }
    }

    pub fn is_success(self) -> bool {
        self == VkResult::Success
    }

    /// Negative codes are errors; positive codes are statuses.
    pub fn is_error(self) -> bool {
        self.as_raw() < 0
    }
}

macro_rules! driver_handle {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

driver_handle! {
    DeviceHandle;
    QueueHandle;
    FenceHandle;
    SemaphoreHandle;
    EventHandle;
    /// Command buffers are recorded elsewhere; this layer only forwards their handles.
    CommandBufferHandle;
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct QueueCreateFlags: u32 {
        const PROTECTED = 0x1;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FenceCreateFlags: u32 {
        const SIGNALED = 0x1;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ExternalFenceHandleTypes: u32 {
        const SYNC_FD = 0x8;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ExternalSemaphoreHandleTypes: u32 {
        const SYNC_FD = 0x10;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SemaphoreImportFlags: u32 {
        const TEMPORARY = 0x1;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FenceCreateInfo {
    pub flags: FenceCreateFlags,
    /// Non-empty when the fence payload must be exportable.
    pub export_handle_types: ExternalFenceHandleTypes,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SemaphoreType {
    #[default]
    Binary,
    Timeline,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SemaphoreCreateInfo {
    pub semaphore_type: SemaphoreType,
    pub initial_value: u64,
    pub export_handle_types: ExternalSemaphoreHandleTypes,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventCreateInfo {
    pub flags: u32,
}

/// Semaphore reference plus the timeline value to wait on / signal (ignored for binary).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreValue {
    pub semaphore: SemaphoreHandle,
    pub value: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmitInfo {
    pub wait_semaphores: Vec<SemaphoreValue>,
    pub command_buffers: Vec<CommandBufferHandle>,
    pub signal_semaphores: Vec<SemaphoreValue>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreSubmitInfo {
    pub semaphore: SemaphoreHandle,
    pub value: u64,
    pub stage_mask: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmitInfo2 {
    pub wait_semaphore_infos: Vec<SemaphoreSubmitInfo>,
    pub command_buffers: Vec<CommandBufferHandle>,
    pub signal_semaphore_infos: Vec<SemaphoreSubmitInfo>,
}

/// Sparse binding payloads belong to memory virtualization; only the sync edges are modelled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindSparseInfo {
    pub wait_semaphores: Vec<SemaphoreHandle>,
    pub bind_count: u32,
    pub signal_semaphores: Vec<SemaphoreHandle>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SemaphoreWaitInfo {
    /// Satisfied when any (instead of all) of the semaphores reaches its value.
    pub wait_any: bool,
    pub semaphores: Vec<SemaphoreValue>,
}

/// An exported or imported sync-fd payload.
///
/// Dropping the payload closes the underlying file descriptor.
#[derive(Debug)]
pub enum SyncFdPayload {
    /// The payload was already signalled; no file descriptor is attached (`fd == -1`).
    Signaled,
    #[cfg(unix)]
    Fd(std::os::fd::OwnedFd),
}

/// Capabilities of the physical device that influence how sync objects are created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    /// `VK_KHR_external_fence_fd` is available.
    pub external_fence_fd: bool,
}

/// Entry points into the native graphics API.
///
/// Every method is callable from any thread: retirement workers call [`DriverTable::wait_for_fences`]
/// concurrently with the decoding thread issuing submissions.
pub trait DriverTable: Send + Sync {
    fn get_device_queue(
        &self,
        device: DeviceHandle,
        flags: QueueCreateFlags,
        family: u32,
        index: u32,
    ) -> QueueHandle;

    fn device_wait_idle(&self, device: DeviceHandle) -> VkResult;

    fn create_fence(
        &self,
        device: DeviceHandle,
        info: &FenceCreateInfo,
    ) -> Result<FenceHandle, VkResult>;

    fn destroy_fence(&self, device: DeviceHandle, fence: FenceHandle);

    fn reset_fences(&self, device: DeviceHandle, fences: &[FenceHandle]) -> VkResult;

    fn get_fence_status(&self, device: DeviceHandle, fence: FenceHandle) -> VkResult;

    /// Blocks until the fences are signalled, `timeout_ns` elapses, or the device is lost.
    fn wait_for_fences(
        &self,
        device: DeviceHandle,
        fences: &[FenceHandle],
        wait_all: bool,
        timeout_ns: u64,
    ) -> VkResult;

    fn export_fence_sync_fd(
        &self,
        device: DeviceHandle,
        fence: FenceHandle,
    ) -> Result<SyncFdPayload, VkResult>;

    fn queue_submit(
        &self,
        queue: QueueHandle,
        submits: &[SubmitInfo],
        fence: Option<FenceHandle>,
    ) -> VkResult;

    fn queue_submit2(
        &self,
        queue: QueueHandle,
        submits: &[SubmitInfo2],
        fence: Option<FenceHandle>,
    ) -> VkResult;

    fn queue_bind_sparse(
        &self,
        queue: QueueHandle,
        binds: &[BindSparseInfo],
        fence: Option<FenceHandle>,
    ) -> VkResult;

    fn create_semaphore(
        &self,
        device: DeviceHandle,
        info: &SemaphoreCreateInfo,
    ) -> Result<SemaphoreHandle, VkResult>;

    fn destroy_semaphore(&self, device: DeviceHandle, semaphore: SemaphoreHandle);

    fn get_semaphore_counter_value(
        &self,
        device: DeviceHandle,
        semaphore: SemaphoreHandle,
    ) -> Result<u64, VkResult>;

    fn wait_semaphores(
        &self,
        device: DeviceHandle,
        info: &SemaphoreWaitInfo,
        timeout_ns: u64,
    ) -> VkResult;

    fn signal_semaphore(&self, device: DeviceHandle, signal: SemaphoreValue) -> VkResult;

    fn export_semaphore_sync_fd(
        &self,
        device: DeviceHandle,
        semaphore: SemaphoreHandle,
    ) -> Result<SyncFdPayload, VkResult>;

    fn import_semaphore_sync_fd(
        &self,
        device: DeviceHandle,
        semaphore: SemaphoreHandle,
        flags: SemaphoreImportFlags,
        payload: SyncFdPayload,
    ) -> VkResult;

    fn create_event(
        &self,
        device: DeviceHandle,
        info: &EventCreateInfo,
    ) -> Result<EventHandle, VkResult>;

    fn destroy_event(&self, device: DeviceHandle, event: EventHandle);

    fn get_event_status(&self, device: DeviceHandle, event: EventHandle) -> VkResult;

    fn set_event(&self, device: DeviceHandle, event: EventHandle) -> VkResult;

    fn reset_event(&self, device: DeviceHandle, event: EventHandle) -> VkResult;
}

/// Converts a host timeout into the nanosecond form the driver expects, saturating.
pub fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}
