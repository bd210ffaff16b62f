//! Durable queue for submissions that could not be delivered immediately.

mod store;
mod types;
mod upload;

pub use store::QueueStore;
pub use types::{
  Delivered, DrainOutcome, DrainReport, EvictionPolicy, Evicted, PendingSubmission, QueueStatus,
};
pub use upload::UploadQueue;
