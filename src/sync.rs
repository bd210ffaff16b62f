//! Sync triggers: the background worker that drains the upload queue and the
//! connectivity monitor that tells it when the backend is reachable again.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::SyncError;
use crate::net::{ApiRequest, Transport};
use crate::queue::{DrainReport, UploadQueue};

/// What woke the sync worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  ConnectivityRestored,
  PeriodicWake,
  UserRetry,
}

/// Reported to the UI after each drain.
#[derive(Debug)]
pub enum SyncEvent {
  Drained {
    trigger: SyncTrigger,
    report: DrainReport,
  },
  /// The session ended; the user has to sign in again before anything is delivered
  Failed {
    trigger: SyncTrigger,
    error: SyncError,
  },
}

/// Handle to a running sync worker.
pub struct SyncHandle {
  tx: mpsc::UnboundedSender<SyncTrigger>,
  task: JoinHandle<()>,
}

impl SyncHandle {
  /// Ask the worker to drain. Returns false if the worker has stopped.
  pub fn trigger(&self, trigger: SyncTrigger) -> bool {
    self.tx.send(trigger).is_ok()
  }

  pub fn retry_now(&self) -> bool {
    self.trigger(SyncTrigger::UserRetry)
  }

  /// Sender for other trigger sources, such as the connectivity monitor.
  pub fn sender(&self) -> mpsc::UnboundedSender<SyncTrigger> {
    self.tx.clone()
  }

  /// Stop the worker once every outstanding sender is gone and the current drain ends.
  pub async fn shutdown(self) {
    drop(self.tx);
    if let Err(e) = self.task.await {
      warn!(error = %e, "sync worker ended abnormally");
    }
  }
}

/// Drains the queue whenever a trigger arrives or the periodic interval elapses.
pub struct SyncWorker;

impl SyncWorker {
  /// Spawn the worker. An `interval` of `None` or zero disables periodic wakes.
  pub fn spawn(
    queue: UploadQueue,
    interval: Option<Duration>,
  ) -> (SyncHandle, mpsc::UnboundedReceiver<SyncEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
      let mut ticker = interval.filter(|period| !period.is_zero()).map(|period| {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
      });

      loop {
        let trigger = tokio::select! {
          received = rx.recv() => match received {
            Some(trigger) => trigger,
            None => break,
          },
          _ = next_tick(&mut ticker) => SyncTrigger::PeriodicWake,
        };

        if trigger == SyncTrigger::PeriodicWake && queue.is_empty() {
          continue;
        }
        debug!(?trigger, pending = queue.len(), "sync triggered");

        let event = match queue.drain().await {
          Ok(report) => SyncEvent::Drained { trigger, report },
          Err(error) => SyncEvent::Failed { trigger, error },
        };
        // Nobody listening is fine; draining is the point
        let _ = events_tx.send(event);
      }
      debug!("sync worker stopped");
    });

    (SyncHandle { tx, task }, events_rx)
  }
}

async fn next_tick(ticker: &mut Option<Interval>) {
  match ticker {
    Some(ticker) => {
      ticker.tick().await;
    }
    None => std::future::pending().await,
  }
}

/// Polls the health endpoint and fires `ConnectivityRestored` on offline to online transitions.
pub struct ConnectivityMonitor {
  transport: Arc<dyn Transport>,
  health: Url,
  period: Duration,
}

impl ConnectivityMonitor {
  pub fn new(transport: Arc<dyn Transport>, health: Url, period: Duration) -> Self {
    Self {
      transport,
      health,
      period,
    }
  }

  /// Whether the backend answers at all. Server errors count as unreachable.
  pub async fn probe(&self) -> bool {
    match self.transport.execute(&ApiRequest::get(self.health.clone())).await {
      Ok(response) => response.status < 500,
      Err(_) => false,
    }
  }

  /// Start polling. The first successful probe counts as a transition, so a
  /// backend that is reachable at startup triggers one drain.
  pub fn spawn(self, triggers: mpsc::UnboundedSender<SyncTrigger>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = time::interval(self.period.max(Duration::from_millis(1)));
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      let mut online = false;

      loop {
        ticker.tick().await;
        let reachable = self.probe().await;
        match (online, reachable) {
          (false, true) => {
            info!(health = %self.health, "connectivity restored");
            if triggers.send(SyncTrigger::ConnectivityRestored).is_err() {
              break;
            }
          }
          (true, false) => info!(health = %self.health, "connectivity lost"),
          _ => {}
        }
        online = reachable;
      }
    })
  }
}
