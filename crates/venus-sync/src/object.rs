//! Registry of client-visible objects keyed by protocol-assigned ids.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::driver::{EventHandle, FenceHandle, SemaphoreHandle};
use crate::error::ProtocolViolation;
use crate::queue::Queue;

/// Protocol-assigned object identifier. Zero is never a valid id.
pub type ObjectId = u64;

#[derive(Clone, Debug)]
pub enum VkObject {
    Queue(Arc<Queue>),
    Fence(FenceHandle),
    Semaphore(SemaphoreHandle),
    Event(EventHandle),
}

impl VkObject {
    pub fn kind(&self) -> &'static str {
        match self {
            VkObject::Queue(_) => "queue",
            VkObject::Fence(_) => "fence",
            VkObject::Semaphore(_) => "semaphore",
            VkObject::Event(_) => "event",
        }
    }
}

#[derive(Debug, Default)]
pub struct ObjectTable {
    objects: Mutex<HashMap<ObjectId, VkObject>>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectId, VkObject>> {
        self.objects.lock().expect("object table lock poisoned")
    }

    /// Checks that `id` may name a new object: nonzero and not used by any live object.
    pub fn validate_id(&self, id: ObjectId) -> Result<(), ProtocolViolation> {
        if id == 0 {
            return Err(ProtocolViolation::InvalidObjectId(id));
        }
        if self.lock().contains_key(&id) {
            return Err(ProtocolViolation::DuplicateObjectId(id));
        }
        Ok(())
    }

    pub fn insert(&self, id: ObjectId, object: VkObject) -> Result<(), ProtocolViolation> {
        if id == 0 {
            return Err(ProtocolViolation::InvalidObjectId(id));
        }
        let mut objects = self.lock();
        if objects.contains_key(&id) {
            return Err(ProtocolViolation::DuplicateObjectId(id));
        }
        objects.insert(id, object);
        Ok(())
    }

    pub fn remove(&self, id: ObjectId) -> Option<VkObject> {
        self.lock().remove(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn queue(&self, id: ObjectId) -> Option<Arc<Queue>> {
        match self.lock().get(&id) {
            Some(VkObject::Queue(queue)) => Some(queue.clone()),
            _ => None,
        }
    }

    pub fn fence(&self, id: ObjectId) -> Option<FenceHandle> {
        match self.lock().get(&id) {
            Some(VkObject::Fence(fence)) => Some(*fence),
            _ => None,
        }
    }

    pub fn semaphore(&self, id: ObjectId) -> Option<SemaphoreHandle> {
        match self.lock().get(&id) {
            Some(VkObject::Semaphore(semaphore)) => Some(*semaphore),
            _ => None,
        }
    }

    pub fn event(&self, id: ObjectId) -> Option<EventHandle> {
        match self.lock().get(&id) {
            Some(VkObject::Event(event)) => Some(*event),
            _ => None,
        }
    }
}
