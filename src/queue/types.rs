use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::SyncError;
use crate::net::api_types::SubmissionReceipt;

/// A write waiting to be delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSubmission {
  pub id: Uuid,
  pub payload: Vec<u8>,
  pub metadata: BTreeMap<String, String>,
  pub enqueued_at: DateTime<Utc>,
  /// Failed delivery attempts so far
  pub attempts: u32,
}

impl PendingSubmission {
  pub fn new(payload: Vec<u8>, metadata: BTreeMap<String, String>) -> Self {
    Self {
      id: Uuid::new_v4(),
      payload,
      metadata,
      enqueued_at: Utc::now(),
      attempts: 0,
    }
  }
}

/// When a submission is given up on instead of retried again.
///
/// `None` disables a rule; `EvictionPolicy::default()` keeps everything forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
  pub max_attempts: Option<u32>,
  pub max_age: Option<Duration>,
}

impl EvictionPolicy {
  /// Why `submission` should be evicted at `now`, if it should.
  pub fn reason(&self, submission: &PendingSubmission, now: DateTime<Utc>) -> Option<String> {
    if let Some(max) = self.max_attempts {
      if submission.attempts >= max {
        return Some(format!("gave up after {} attempts", submission.attempts));
      }
    }
    if let Some(max_age) = self.max_age {
      if now - submission.enqueued_at > max_age {
        return Some(format!(
          "older than {} hours",
          max_age.num_hours()
        ));
      }
    }
    None
  }
}

/// Snapshot of the queue for the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
  pub pending: usize,
  pub last_error: Option<SyncError>,
  pub draining: bool,
  pub oldest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
  pub id: Uuid,
  /// Absent when the server accepted the batch with a body we couldn't read
  pub receipt: Option<SubmissionReceipt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evicted {
  pub id: Uuid,
  pub reason: String,
}

/// Why a drain returned.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
  /// Nothing left to deliver
  Completed,
  /// A delivery failed transiently; the rest waits for the next trigger
  Stopped(SyncError),
  /// Another drain was running; this call did nothing
  AlreadyDraining,
}

/// What one drain did.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
  pub delivered: Vec<Delivered>,
  pub rejected: Vec<(Uuid, SyncError)>,
  pub evicted: Vec<Evicted>,
  pub remaining: usize,
  pub outcome: DrainOutcome,
}

impl DrainReport {
  pub(crate) fn empty(outcome: DrainOutcome, remaining: usize) -> Self {
    Self {
      delivered: Vec::new(),
      rejected: Vec::new(),
      evicted: Vec::new(),
      remaining,
      outcome,
    }
  }

  pub fn was_delivered(&self, id: Uuid) -> bool {
    self.delivered.iter().any(|d| d.id == id)
  }
}
