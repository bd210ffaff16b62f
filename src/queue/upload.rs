//! Durable upload queue with sequential, stop-on-first-failure draining.

use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::store::QueueStore;
use super::types::{
  Delivered, DrainOutcome, DrainReport, EvictionPolicy, Evicted, PendingSubmission, QueueStatus,
};
use crate::auth::AuthPipeline;
use crate::error::{SyncError, SyncResult};
use crate::net::api_types::SubmissionReceipt;
use crate::net::ApiRequest;

struct QueueInner {
  pending: Mutex<VecDeque<PendingSubmission>>,
  last_error: Mutex<Option<SyncError>>,
  store: Option<QueueStore>,
  pipeline: AuthPipeline,
  target: Url,
  policy: EvictionPolicy,
  draining: AtomicBool,
}

/// Shared handle to the upload queue.
///
/// Submissions are delivered one at a time in enqueue order. A transient failure
/// stops the drain so nothing is ever delivered ahead of an older submission.
#[derive(Clone)]
pub struct UploadQueue {
  inner: Arc<QueueInner>,
}

impl UploadQueue {
  /// Create the queue, restoring submissions persisted by a previous run.
  pub fn new(
    pipeline: AuthPipeline,
    target: Url,
    policy: EvictionPolicy,
    store: Option<QueueStore>,
  ) -> Self {
    let pending: VecDeque<_> = match store.as_ref().map(QueueStore::load) {
      Some(Ok(pending)) => pending.into(),
      Some(Err(e)) => {
        warn!(error = %e, "could not load persisted submissions, starting with an empty queue");
        VecDeque::new()
      }
      None => VecDeque::new(),
    };
    if !pending.is_empty() {
      info!(pending = pending.len(), "restored pending submissions");
    }

    Self {
      inner: Arc::new(QueueInner {
        pending: Mutex::new(pending),
        last_error: Mutex::new(None),
        store,
        pipeline,
        target,
        policy,
        draining: AtomicBool::new(false),
      }),
    }
  }

  /// Queue a submission. Never fails; if it can't be persisted it is kept in memory.
  pub fn enqueue(&self, payload: Vec<u8>, metadata: BTreeMap<String, String>) -> Uuid {
    let submission = PendingSubmission::new(payload, metadata);
    let id = submission.id;

    if let Some(store) = &self.inner.store {
      if let Err(e) = store.insert(&submission) {
        warn!(%id, error = %e, "could not persist submission, keeping it in memory only");
      }
    }
    self.inner.lock_pending().push_back(submission);
    info!(%id, "submission queued");
    id
  }

  pub fn len(&self) -> usize {
    self.inner.lock_pending().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Copy of the pending submissions in delivery order.
  pub fn pending(&self) -> Vec<PendingSubmission> {
    self.inner.lock_pending().iter().cloned().collect()
  }

  pub fn status(&self) -> QueueStatus {
    let (pending, oldest) = {
      let queue = self.inner.lock_pending();
      (queue.len(), queue.front().map(|s| s.enqueued_at))
    };
    QueueStatus {
      pending,
      last_error: self.inner.lock_last_error().clone(),
      draining: self.inner.draining.load(Ordering::Acquire),
      oldest,
    }
  }

  /// Deliver pending submissions in order until the queue is empty or one fails.
  ///
  /// Rejected submissions are dropped and draining continues. A call made while
  /// another drain runs returns immediately with [`DrainOutcome::AlreadyDraining`].
  /// Returns `AuthenticationRequired` if the session ended; nothing is dropped then.
  pub async fn drain(&self) -> SyncResult<DrainReport> {
    let Some(_guard) = DrainGuard::acquire(&self.inner.draining) else {
      debug!("drain already in progress");
      return Ok(DrainReport::empty(DrainOutcome::AlreadyDraining, self.len()));
    };

    let mut report = DrainReport::empty(DrainOutcome::Completed, 0);
    while let Some(submission) = self.inner.front() {
      let id = submission.id;

      if let Some(reason) = self.inner.policy.reason(&submission, Utc::now()) {
        warn!(%id, %reason, attempts = submission.attempts, "evicting submission");
        self.inner.remove(id);
        report.evicted.push(Evicted { id, reason });
        continue;
      }

      match self.inner.deliver(&submission).await {
        Ok(receipt) => {
          info!(%id, task_id = receipt.as_ref().map(|r| r.task_id.as_str()), "submission delivered");
          self.inner.remove(id);
          report.delivered.push(Delivered { id, receipt });
        }
        Err(e @ SyncError::DeliveryRejected { .. }) => {
          warn!(%id, error = %e, "submission rejected by server, dropping it");
          self.inner.remove(id);
          self.inner.set_last_error(Some(e.clone()));
          report.rejected.push((id, e));
        }
        Err(e @ SyncError::AuthenticationRequired(_)) => {
          warn!(%id, "drain stopped, sign-in required");
          self.inner.set_last_error(Some(e.clone()));
          return Err(e);
        }
        Err(e) => {
          self.inner.record_failure(id, &e);
          report.outcome = DrainOutcome::Stopped(e);
          break;
        }
      }
    }

    if report.outcome == DrainOutcome::Completed && report.rejected.is_empty() {
      self.inner.set_last_error(None);
    }
    report.remaining = self.len();
    info!(
      delivered = report.delivered.len(),
      rejected = report.rejected.len(),
      evicted = report.evicted.len(),
      remaining = report.remaining,
      "drain finished"
    );
    Ok(report)
  }
}

impl QueueInner {
  fn lock_pending(&self) -> MutexGuard<'_, VecDeque<PendingSubmission>> {
    self
      .pending
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn lock_last_error(&self) -> MutexGuard<'_, Option<SyncError>> {
    self
      .last_error
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn set_last_error(&self, error: Option<SyncError>) {
    *self.lock_last_error() = error;
  }

  fn front(&self) -> Option<PendingSubmission> {
    self.lock_pending().front().cloned()
  }

  fn remove(&self, id: Uuid) {
    self.lock_pending().retain(|s| s.id != id);
    if let Some(store) = &self.store {
      if let Err(e) = store.remove(id) {
        warn!(%id, error = %e, "could not remove submission from disk");
      }
    }
  }

  fn record_failure(&self, id: Uuid, error: &SyncError) {
    let attempts = {
      let mut pending = self.lock_pending();
      match pending.iter_mut().find(|s| s.id == id) {
        Some(submission) => {
          submission.attempts += 1;
          submission.attempts
        }
        None => return,
      }
    };
    warn!(%id, attempts, error = %error, "delivery failed, will retry on next trigger");

    if let Some(store) = &self.store {
      if let Err(e) = store.record_attempt(id, attempts, &error.to_string()) {
        warn!(%id, error = %e, "could not record delivery attempt");
      }
    }
    self.set_last_error(Some(error.clone()));
  }

  fn delivery_request(&self, submission: &PendingSubmission) -> ApiRequest {
    let mut url = self.target.clone();
    if !submission.metadata.is_empty() {
      url.query_pairs_mut().extend_pairs(submission.metadata.iter());
    }
    ApiRequest::post(url)
      .with_header("content-type", "application/json")
      .with_header("idempotency-key", submission.id.to_string())
      .with_body(submission.payload.clone())
  }

  async fn deliver(&self, submission: &PendingSubmission) -> SyncResult<Option<SubmissionReceipt>> {
    let request = self.delivery_request(submission);
    let response = self.pipeline.send(&request).await?;

    match response.status {
      200..=299 => Ok(response.json().ok()),
      408 | 429 | 500..=599 => Err(SyncError::ServerError {
        status: response.status,
      }),
      status => Err(SyncError::DeliveryRejected {
        status,
        reason: response.body_snippet(),
      }),
    }
  }
}

/// Holds the single drain slot; released even if the draining future is dropped.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self(flag))
  }
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}
