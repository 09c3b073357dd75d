use thiserror::Error;

use crate::driver::{QueueCreateFlags, VkResult};
use crate::object::ObjectId;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the queue synchronization layer.
///
/// Only [`SyncError::Protocol`] is session-fatal; every other variant fails the single
/// operation that produced it and leaves the session usable.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to create sync fence for fence_id {fence_id} ({result:?})")]
    TokenAllocation { fence_id: u64, result: VkResult },

    #[error("{op} failed ({result:?})")]
    Driver { op: &'static str, result: VkResult },

    #[error("device lost during {op}")]
    DeviceLost { op: &'static str },

    #[error("no queue is bound to ring {0}")]
    UnboundRing(u32),

    #[error("queue retirement worker has been stopped")]
    QueueShutDown,

    #[error("failed to spawn queue retirement worker")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
}

impl SyncError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Protocol(_))
    }
}

/// Conditions that end all trust in a client's command stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("queue already has object id {existing}, client supplied {requested}")]
    IdentityMismatch {
        existing: ObjectId,
        requested: ObjectId,
    },

    #[error("invalid object id {0}")]
    InvalidObjectId(ObjectId),

    #[error("object id {0} is already in use")]
    DuplicateObjectId(ObjectId),

    #[error("unknown object id {0}")]
    UnknownObject(ObjectId),

    #[error("no queue with flags={flags:?} family={family} index={index}")]
    QueueNotFound {
        flags: QueueCreateFlags,
        family: u32,
        index: u32,
    },

    #[error("invalid ring_idx {0}")]
    InvalidRingIndex(u32),

    #[error("sync_queue {0} already bound")]
    RingAlreadyBound(u32),

    #[error("queue already bound to ring {queue_ring}, client requested ring {requested}")]
    QueueAlreadyBound { queue_ring: u32, requested: u32 },

    #[error("blocking queue wait is not allowed")]
    BlockingQueueWait,

    #[error("failed to export fence payload")]
    FenceExportFailed,

    #[error("failed to export semaphore payload")]
    SemaphoreExportFailed,

    #[error("failed to import semaphore payload")]
    SemaphoreImportFailed,

    #[error("unsupported semaphore import from resource {0}")]
    UnsupportedImportResource(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_protocol_violations_are_fatal() {
        assert!(SyncError::from(ProtocolViolation::InvalidRingIndex(0)).is_fatal());
        assert!(!SyncError::UnboundRing(3).is_fatal());
        assert!(!SyncError::QueueShutDown.is_fatal());
        assert!(!SyncError::Driver {
            op: "vkQueueSubmit",
            result: VkResult::OutOfHostMemory,
        }
        .is_fatal());
        assert!(!SyncError::DeviceLost {
            op: "vkWaitForFences"
        }
        .is_fatal());
    }

    #[test]
    fn messages_carry_context() {
        let err = SyncError::from(ProtocolViolation::IdentityMismatch {
            existing: 7,
            requested: 9,
        });
        assert_eq!(
            err.to_string(),
            "protocol violation: queue already has object id 7, client supplied 9"
        );
    }
}
