//! Violation and snooze timers
//!
//! A timer pairs a fixed expiry instant with an optional armed wakeup
//! task. Expiry checks are pure instant comparisons, so evaluation never
//! depends on whether a task actually ran; the task only nudges the
//! owning sensor to re-evaluate once the instant passes. Dropping or
//! cancelling a timer aborts the wakeup.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Sent to a sensor's evaluation loop when a timer's expiry passes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    /// Grace-target or snooze key the timer was scheduled under
    pub key: String,
}

/// A scheduled expiry with an optional wakeup task
#[derive(Debug)]
pub struct ViolationTimer {
    key: String,
    expiry: DateTime<Utc>,
    handle: Option<JoinHandle<()>>,
}

impl ViolationTimer {
    /// Schedule a timer; arms a wakeup only if the expiry is in the future
    pub fn schedule(
        key: impl Into<String>,
        expiry: DateTime<Utc>,
        notify: mpsc::Sender<TimerFired>,
    ) -> Self {
        let key = key.into();
        let handle = arm(key.clone(), expiry, notify);
        trace!(key, %expiry, armed = handle.is_some(), "Scheduled timer");
        Self { key, expiry, handle }
    }

    /// Recreate a timer from a persisted ISO 8601 expiry
    ///
    /// Unparseable timestamps become an immediate expiry so a restored
    /// violation is at worst reported too early, never lost.
    pub fn from_iso(
        key: impl Into<String>,
        expiry_iso: &str,
        notify: mpsc::Sender<TimerFired>,
    ) -> Self {
        let expiry = match DateTime::parse_from_rfc3339(expiry_iso) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(err) => {
                warn!(expiry_iso, error = %err, "Bad persisted expiry, treating as expired");
                Utc::now()
            }
        };
        Self::schedule(key, expiry, notify)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }

    /// Expiry in the shape persisted and shown in attributes
    pub fn expiry_iso(&self) -> String {
        self.expiry.to_rfc3339()
    }

    /// Whether the expiry has passed at the given instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Abort the wakeup task; checking expiry stays valid afterwards
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            trace!(key = %self.key, "Cancelled timer");
        }
    }
}

impl Drop for ViolationTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn arm(
    key: String,
    expiry: DateTime<Utc>,
    notify: mpsc::Sender<TimerFired>,
) -> Option<JoinHandle<()>> {
    // Already-expired timers need no wakeup; callers see the expiry on
    // their next evaluation pass.
    let delay = (expiry - Utc::now()).to_std().ok()?;
    Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = notify.send(TimerFired { key }).await;
    }))
}
