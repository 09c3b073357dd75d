//! Handlers for decoded queue, fence, semaphore and event commands.
//!
//! Arguments arrive already parsed and type-checked; object handles embedded in them have been
//! translated to driver handles by the decoder, except for ids that name objects being created or
//! destroyed here. Handlers that forward a single driver call return its [`VkResult`] for the reply.
//! An `Err` return means the session has been marked fatal.

use crate::device::Device;
use crate::driver::{
    BindSparseInfo, EventCreateInfo, EventHandle, FenceCreateInfo, FenceHandle,
    QueueCreateFlags, SemaphoreCreateInfo, SemaphoreHandle, SemaphoreImportFlags, SemaphoreValue,
    SemaphoreWaitInfo, SubmitInfo, SubmitInfo2, SyncFdPayload, VkResult,
};
use crate::error::{ProtocolViolation, Result, SyncError};
use crate::object::{ObjectId, ObjectTable, VkObject};
use crate::queue::Queue;
use crate::session::Session;

/// Ring metadata a client may chain onto a queue retrieval request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueTimelineInfo {
    pub ring_idx: u32,
}

/// `VkDeviceQueueInfo2` plus the optional timeline (ring) extension struct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceQueueInfo2 {
    pub flags: QueueCreateFlags,
    pub family: u32,
    pub index: u32,
    pub timeline: Option<QueueTimelineInfo>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImportSemaphoreResourceInfo {
    pub semaphore: SemaphoreHandle,
    /// Resource backing the payload; 0 means "import an already-signalled payload".
    pub resource_id: u32,
}

fn register(
    session: &Session,
    id: ObjectId,
    create: impl FnOnce() -> std::result::Result<VkObject, VkResult>,
) -> Result<VkResult> {
    session
        .objects()
        .validate_id(id)
        .map_err(|violation| session.fail(violation))?;

    let object = match create() {
        Ok(object) => object,
        Err(result) => return Ok(result),
    };
    session
        .objects()
        .insert(id, object)
        .map_err(|violation| session.fail(violation))?;
    Ok(VkResult::Success)
}

/// Removes `id` if it names an object of the kind `lookup` selects. A null id is a no-op.
fn unregister<T>(
    session: &Session,
    id: ObjectId,
    lookup: impl Fn(&ObjectTable, ObjectId) -> Option<T>,
) -> Result<Option<T>> {
    if id == 0 {
        return Ok(None);
    }
    let Some(handle) = lookup(session.objects(), id) else {
        return Err(session.fail(ProtocolViolation::UnknownObject(id)));
    };
    session.objects().remove(id);
    Ok(Some(handle))
}

// Queues.

pub fn get_device_queue(
    session: &Session,
    device: &Device,
    family: u32,
    index: u32,
    id: ObjectId,
) -> Result<()> {
    let flags = QueueCreateFlags::empty();
    let Some(queue) = device.lookup_queue(flags, family, index) else {
        return Err(session.fail(ProtocolViolation::QueueNotFound {
            flags,
            family,
            index,
        }));
    };
    queue.assign_identity(session, id)
}

pub fn get_device_queue2(
    session: &Session,
    device: &Device,
    info: &DeviceQueueInfo2,
    id: ObjectId,
) -> Result<()> {
    let Some(queue) = device.lookup_queue(info.flags, info.family, info.index) else {
        return Err(session.fail(ProtocolViolation::QueueNotFound {
            flags: info.flags,
            family: info.family,
            index: info.index,
        }));
    };

    if let Some(timeline) = info.timeline {
        device.bind_ring(session, &queue, timeline.ring_idx)?;
    }

    queue.assign_identity(session, id)
}

pub fn queue_submit(queue: &Queue, submits: &[SubmitInfo], fence: Option<FenceHandle>) -> VkResult {
    queue.driver().queue_submit(queue.handle(), submits, fence)
}

pub fn queue_submit2(
    queue: &Queue,
    submits: &[SubmitInfo2],
    fence: Option<FenceHandle>,
) -> VkResult {
    queue.driver().queue_submit2(queue.handle(), submits, fence)
}

pub fn queue_bind_sparse(
    queue: &Queue,
    binds: &[BindSparseInfo],
    fence: Option<FenceHandle>,
) -> VkResult {
    queue.driver().queue_bind_sparse(queue.handle(), binds, fence)
}

/// Blocking the decoding thread on a queue is never allowed.
pub fn queue_wait_idle(session: &Session, _queue: &Queue) -> Result<()> {
    Err(session.fail(ProtocolViolation::BlockingQueueWait))
}

// Fences.

pub fn create_fence(
    session: &Session,
    device: &Device,
    id: ObjectId,
    info: &FenceCreateInfo,
) -> Result<VkResult> {
    register(session, id, || {
        device
            .driver()
            .create_fence(device.handle(), info)
            .map(VkObject::Fence)
    })
}

pub fn destroy_fence(session: &Session, device: &Device, id: ObjectId) -> Result<()> {
    if let Some(fence) = unregister(session, id, ObjectTable::fence)? {
        device.driver().destroy_fence(device.handle(), fence);
    }
    Ok(())
}

pub fn reset_fences(device: &Device, fences: &[FenceHandle]) -> VkResult {
    device.driver().reset_fences(device.handle(), fences)
}

pub fn get_fence_status(device: &Device, fence: FenceHandle) -> VkResult {
    device.driver().get_fence_status(device.handle(), fence)
}

/// Device loss observed here ends the session: nothing submitted afterwards can be trusted.
pub fn wait_for_fences(
    session: &Session,
    device: &Device,
    fences: &[FenceHandle],
    wait_all: bool,
    timeout_ns: u64,
) -> VkResult {
    let result = device
        .driver()
        .wait_for_fences(device.handle(), fences, wait_all, timeout_ns);
    if result == VkResult::DeviceLost {
        session.set_fatal(&SyncError::DeviceLost {
            op: "vkWaitForFences",
        });
    }
    result
}

/// Resets a fence's payload by exporting it as a sync fd and closing the fd.
pub fn reset_fence_resource(session: &Session, device: &Device, fence: FenceHandle) -> Result<()> {
    match device.driver().export_fence_sync_fd(device.handle(), fence) {
        Ok(payload) => {
            drop(payload);
            Ok(())
        }
        Err(result) => {
            tracing::warn!(?fence, ?result, "fence sync fd export failed");
            Err(session.fail(ProtocolViolation::FenceExportFailed))
        }
    }
}

// Semaphores.

pub fn create_semaphore(
    session: &Session,
    device: &Device,
    id: ObjectId,
    info: &SemaphoreCreateInfo,
) -> Result<VkResult> {
    register(session, id, || {
        device
            .driver()
            .create_semaphore(device.handle(), info)
            .map(VkObject::Semaphore)
    })
}

pub fn destroy_semaphore(session: &Session, device: &Device, id: ObjectId) -> Result<()> {
    if let Some(semaphore) = unregister(session, id, ObjectTable::semaphore)? {
        device.driver().destroy_semaphore(device.handle(), semaphore);
    }
    Ok(())
}

pub fn get_semaphore_counter_value(
    device: &Device,
    semaphore: SemaphoreHandle,
) -> std::result::Result<u64, VkResult> {
    device
        .driver()
        .get_semaphore_counter_value(device.handle(), semaphore)
}

pub fn wait_semaphores(
    session: &Session,
    device: &Device,
    info: &SemaphoreWaitInfo,
    timeout_ns: u64,
) -> VkResult {
    let result = device
        .driver()
        .wait_semaphores(device.handle(), info, timeout_ns);
    if result == VkResult::DeviceLost {
        session.set_fatal(&SyncError::DeviceLost {
            op: "vkWaitSemaphores",
        });
    }
    result
}

pub fn signal_semaphore(device: &Device, signal: SemaphoreValue) -> VkResult {
    device.driver().signal_semaphore(device.handle(), signal)
}

/// Consumes the semaphore's pending payload by exporting it as a sync fd and closing the fd.
pub fn wait_semaphore_resource(
    session: &Session,
    device: &Device,
    semaphore: SemaphoreHandle,
) -> Result<()> {
    match device
        .driver()
        .export_semaphore_sync_fd(device.handle(), semaphore)
    {
        Ok(payload) => {
            drop(payload);
            Ok(())
        }
        Err(result) => {
            tracing::warn!(?semaphore, ?result, "semaphore sync fd export failed");
            Err(session.fail(ProtocolViolation::SemaphoreExportFailed))
        }
    }
}

/// Imports an already-signalled payload into the semaphore (temporary import).
pub fn import_semaphore_resource(
    session: &Session,
    device: &Device,
    info: &ImportSemaphoreResourceInfo,
) -> Result<()> {
    if info.resource_id != 0 {
        return Err(session.fail(ProtocolViolation::UnsupportedImportResource(
            info.resource_id,
        )));
    }

    let result = device.driver().import_semaphore_sync_fd(
        device.handle(),
        info.semaphore,
        SemaphoreImportFlags::TEMPORARY,
        SyncFdPayload::Signaled,
    );
    if !result.is_success() {
        tracing::warn!(semaphore = ?info.semaphore, ?result, "semaphore import failed");
        return Err(session.fail(ProtocolViolation::SemaphoreImportFailed));
    }
    Ok(())
}

// Events.

pub fn create_event(
    session: &Session,
    device: &Device,
    id: ObjectId,
    info: &EventCreateInfo,
) -> Result<VkResult> {
    register(session, id, || {
        device
            .driver()
            .create_event(device.handle(), info)
            .map(VkObject::Event)
    })
}

pub fn destroy_event(session: &Session, device: &Device, id: ObjectId) -> Result<()> {
    if let Some(event) = unregister(session, id, ObjectTable::event)? {
        device.driver().destroy_event(device.handle(), event);
    }
    Ok(())
}

pub fn get_event_status(device: &Device, event: EventHandle) -> VkResult {
    device.driver().get_event_status(device.handle(), event)
}

pub fn set_event(device: &Device, event: EventHandle) -> VkResult {
    device.driver().set_event(device.handle(), event)
}

pub fn reset_event(device: &Device, event: EventHandle) -> VkResult {
    device.driver().reset_event(device.handle(), event)
}
