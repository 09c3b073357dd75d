//! Queue synchronization for a virtualized Vulkan command stream.
//!
//! Every client-visible queue owns a retirement worker thread. Fences submitted through
//! [`Queue::submit`] (or ring-addressed through [`Device::submit_ring_fence`]) are tracked as
//! [`SyncToken`]s; the worker waits for them strictly in submission order and reports each one to
//! the session's [`RetireSink`] before recycling its fence through the device's [`TokenPool`].
//!
//! - [`device`]: device realize/destroy, the queue list and the ring table.
//! - [`queue`]: per-queue pending list, retirement worker and identity binding.
//! - [`token`]: sync tokens and the recycled fence pool.
//! - [`dispatch`]: handlers for queue, fence, semaphore and event commands.
//! - [`driver`]: the native driver boundary plus a software implementation.
//! - [`session`] / [`object`]: per-client state shared with the workers.
#![forbid(unsafe_code)]

pub mod config;
pub mod device;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod object;
pub mod queue;
pub mod session;
pub mod token;

pub use config::{ConfigError, SyncConfig};
pub use device::{Device, QueueCreateInfo, TokenCensus};
pub use driver::{DriverTable, SoftDriver, VkResult};
pub use error::{ProtocolViolation, Result, SyncError};
pub use object::{ObjectId, ObjectTable, VkObject};
pub use queue::{Queue, QueueKey};
pub use session::{RecordingRetireSink, RetireSink, Retirement, Session};
pub use token::{SyncToken, TokenPool};
