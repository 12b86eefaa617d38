//! Per-campaign send pipeline.
//!
//! A pipe owns the fetch-render-schedule state machine for one running
//! campaign: it pulls subscriber batches from storage, renders messages,
//! paces them against the per-campaign daily quota and the campaign's send
//! window, and hands them to the manager's worker queue. Lifecycle is
//! tracked with an in-flight waitgroup; cleanup runs exactly once when the
//! last message drains.

use crate::manager::{EngineShared, Notification};
use crate::message::render_message;
use crate::messenger::Message;
use crate::sendwindow::SendWindow;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use lettermill_common::{Error, Result};
use lettermill_storage::models::{Campaign, CampaignStatus, Subscriber};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::waitgroup::WaitGroup;

/// A rendered message bound to one subscriber, ready for a worker.
pub struct CampaignMessage {
    pub message: Message,
    pub messenger: String,
    pub campaign_id: i64,
    pub subscriber_id: i64,
    pub(crate) pipe: Arc<Pipe>,
}

/// A campaign message with the time at which the scheduler releases it.
struct ScheduledMessage {
    msg: CampaignMessage,
    at: Instant,
}

/// Runtime pipeline for one running campaign.
pub struct Pipe {
    pub(crate) camp: Campaign,
    window: Option<SendWindow>,

    sent: AtomicI64,
    last_id: AtomicI64,
    errors: AtomicU64,
    stopped: AtomicBool,
    with_errors: AtomicBool,

    /// Messages released for the current UTC hour but not yet recorded as
    /// sent.
    scheduled: AtomicI64,
    /// UTC hour (0-23) for which `scheduled` is valid. -1 until first use.
    scheduled_hour: AtomicI64,

    /// Successful sends not yet flushed to the campaign counters.
    unflushed: AtomicI64,

    /// Guards the single release of the sentinel waitgroup ticket.
    sentinel_released: AtomicBool,

    pub(crate) wg: WaitGroup,
    sched_tx: StdMutex<Option<mpsc::Sender<ScheduledMessage>>>,

    /// Back-reference for handing messages and retry tasks an owning
    /// handle to this pipe.
    self_ref: Weak<Pipe>,

    shared: Arc<EngineShared>,
}

impl Pipe {
    /// Create a pipe for a campaign, register it and start its scheduler.
    ///
    /// The waitgroup starts with a sentinel ticket held until the
    /// campaign's subscribers are exhausted (or the pipe is stopped), so
    /// in-flight batches can't race cleanup.
    pub(crate) fn new(camp: Campaign, shared: Arc<EngineShared>) -> Result<Arc<Self>> {
        let window = match camp.send_interval.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => Some(SendWindow::parse(s).map_err(|e| {
                Error::Validation(format!("campaign {}: {}", camp.name, e))
            })?),
            None => None,
        };

        let (sched_tx, sched_rx) = mpsc::channel(shared.cfg.batch_size * 2);

        let pipe = Arc::new_cyclic(|self_ref| Self {
            camp,
            window,
            sent: AtomicI64::new(0),
            last_id: AtomicI64::new(0),
            errors: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            with_errors: AtomicBool::new(false),
            scheduled: AtomicI64::new(0),
            scheduled_hour: AtomicI64::new(-1),
            unflushed: AtomicI64::new(0),
            sentinel_released: AtomicBool::new(false),
            wg: WaitGroup::new(),
            sched_tx: StdMutex::new(Some(sched_tx)),
            self_ref: self_ref.clone(),
            shared,
        });

        pipe.wg.add(1);

        pipe.shared
            .pipes
            .lock()
            .unwrap()
            .insert(pipe.camp.id, pipe.clone());

        tokio::spawn(run_scheduler(pipe.clone(), sched_rx));

        // Cleanup fires once every message (and the sentinel) has drained.
        let p = pipe.clone();
        tokio::spawn(async move {
            p.wg.wait().await;
            p.cleanup().await;
        });

        Ok(pipe)
    }

    pub fn campaign_id(&self) -> i64 {
        self.camp.id
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Messages successfully sent so far in this pipe's run.
    pub fn sent_count(&self) -> i64 {
        self.sent.load(Ordering::Acquire)
    }

    /// Process the next batch of subscribers.
    ///
    /// Returns false once all subscribers have been processed, the pipe has
    /// been stopped, or this hour's quota is spent (in which case the pipe
    /// re-queues itself at the top of the next UTC hour).
    pub(crate) async fn next_subscribers(&self) -> Result<bool> {
        let mut limit = self.shared.cfg.batch_size as i64;
        let has_quota = self.camp.has_daily_quota();
        let now = Utc::now();

        // Outside the campaign's send window the hour's allowance is zero.
        if let Some(window) = &self.window {
            let minute = (now.hour() * 60 + now.minute()) as u16;
            if !window.contains_minute(minute) {
                debug!(campaign = %self.camp.name, "outside send window, deferring to next hour");
                self.schedule_hourly_retry(now);
                return Ok(false);
            }
        }

        if has_quota {
            let per_hour = per_hour_allowance(self.camp.daily_quota.unwrap_or(0));

            // Reset the scheduled counter when the hour rolls over.
            let current_hour = now.hour() as i64;
            if self.scheduled_hour.load(Ordering::Acquire) != current_hour {
                self.scheduled.store(0, Ordering::Release);
                self.scheduled_hour.store(current_hour, Ordering::Release);
            }

            let sent_this_hour = self
                .shared
                .store
                .get_campaign_hourly_sent(self.camp.id, now)
                .await
                .map_err(|e| {
                    Error::Internal(format!(
                        "error fetching hourly sent count ({}): {}",
                        self.camp.name, e
                    ))
                })?;

            let allowed = per_hour - sent_this_hour - self.scheduled.load(Ordering::Acquire);
            if allowed <= 0 {
                self.schedule_hourly_retry(now);
                return Ok(false);
            }
            limit = limit.min(allowed);
        }

        let subs = self
            .shared
            .store
            .next_subscribers(self.camp.id, limit as usize)
            .await
            .map_err(|e| {
                Error::Internal(format!(
                    "error fetching campaign subscribers ({}): {}",
                    self.camp.name, e
                ))
            })?;

        if subs.is_empty() {
            // All subscribers processed; let the waitgroup drain.
            if !self.is_stopped() {
                self.release_sentinel();
            }
            return Ok(false);
        }

        if has_quota {
            self.schedule_batch(subs, now).await?;
        } else {
            self.push_batch(subs).await;
        }

        Ok(true)
    }

    /// Spread a batch evenly over the remainder of the current UTC hour.
    async fn schedule_batch(&self, subs: Vec<Subscriber>, now: DateTime<Utc>) -> Result<()> {
        let per_hour = per_hour_allowance(self.camp.daily_quota.unwrap_or(0));

        // Recompute the allowance best-effort; the DB may have moved under us.
        let sent_this_hour = self
            .shared
            .store
            .get_campaign_hourly_sent(self.camp.id, now)
            .await
            .unwrap_or(0);

        let mut remaining = per_hour - sent_this_hour - self.scheduled.load(Ordering::Acquire);
        if remaining <= 0 {
            self.schedule_hourly_retry(now);
            return Ok(());
        }
        if remaining < subs.len() as i64 {
            remaining = subs.len() as i64;
        }

        let rest = until_next_hour(now);
        let spacing = even_spacing(rest, remaining);

        let sched_tx = match self.sched_tx.lock().unwrap().clone() {
            Some(tx) => tx,
            None => return Ok(()),
        };

        let base = Instant::now();
        for (i, s) in subs.into_iter().enumerate() {
            let msg = match self.new_message(s) {
                Ok(m) => m,
                Err((email, e)) => {
                    error!(campaign = %self.camp.name, subscriber = %email, error = %e, "error rendering message");
                    continue;
                }
            };

            // A release time nudged before `base` is treated as immediate.
            let offset_ns = i as i64 * spacing.as_nanos() as i64 + jitter_nanos(spacing);
            let at = base + Duration::from_nanos(offset_ns.max(0) as u64);

            if sched_tx.send(ScheduledMessage { msg, at }).await.is_err() {
                // Scheduler is gone; the pipe is being cleaned up.
                self.wg.done();
                break;
            }

            self.scheduled.fetch_add(1, Ordering::AcqRel);
        }

        Ok(())
    }

    /// Push a batch straight to the worker queue, enforcing the global
    /// sliding window inline. Blocks when the queue is full.
    ///
    /// The whole fetched batch is pushed even if the pipe is stopped
    /// mid-iteration: the cursor has already advanced past these
    /// subscribers, so skipping any of them here would lose them silently.
    /// The dispatcher stops fetching new batches once the pipe is stopped.
    async fn push_batch(&self, subs: Vec<Subscriber>) {
        for s in subs {
            let msg = match self.new_message(s) {
                Ok(m) => m,
                Err((email, e)) => {
                    error!(campaign = %self.camp.name, subscriber = %email, error = %e, "error rendering message");
                    continue;
                }
            };

            if self.shared.msg_tx.send(msg).await.is_err() {
                self.wg.done();
                return;
            }

            self.shared.sliding.throttle().await;
        }
    }

    /// Render a message for one subscriber, taking a waitgroup ticket.
    fn new_message(&self, s: Subscriber) -> std::result::Result<CampaignMessage, (String, Error)> {
        let email = s.email.clone();

        let Some(pipe) = self.self_ref.upgrade() else {
            return Err((email, Error::Internal("pipe already released".to_string())));
        };

        let message = render_message(
            &self.shared.renderer,
            &self.camp,
            &s,
            &self.shared.cfg.from_email,
        )
        .map_err(|e| (email, e))?;

        self.wg.add(1);

        Ok(CampaignMessage {
            message,
            messenger: self.camp.messenger.clone(),
            campaign_id: self.camp.id,
            subscriber_id: s.id,
            pipe,
        })
    }

    /// Re-queue the pipe at the top of the next UTC hour (at least a second
    /// out). An extra waitgroup ticket keeps cleanup from firing during the
    /// wait; the requeue itself is non-blocking and a full queue drops the
    /// attempt (the scan loop re-adopts the campaign on a later tick).
    fn schedule_hourly_retry(&self, now: DateTime<Utc>) {
        let Some(pipe) = self.self_ref.upgrade() else {
            return;
        };

        let wait = until_next_hour(now).max(Duration::from_secs(1));

        self.wg.add(1);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;

            if !pipe.is_stopped() {
                if let Err(e) = pipe.shared.next_tx.try_send(pipe.clone()) {
                    warn!(campaign = %pipe.camp.name, error = %e, "could not requeue pipe after quota wait");
                }
            }

            pipe.wg.done();
        });
    }

    /// Track a send error, auto-pausing the campaign at the threshold.
    pub(crate) fn on_error(&self) {
        if self.shared.cfg.max_send_errors == 0 {
            return;
        }

        let count = self.errors.fetch_add(1, Ordering::AcqRel) + 1;
        if count < self.shared.cfg.max_send_errors {
            return;
        }

        self.stop(true);
        warn!(
            campaign = %self.camp.name,
            errors = count,
            "error threshold reached, pausing campaign"
        );
    }

    /// Record one successful send and flush counters at the threshold.
    pub(crate) async fn record_sent(&self, subscriber_id: i64) {
        self.sent.fetch_add(1, Ordering::AcqRel);
        self.last_id.fetch_max(subscriber_id, Ordering::AcqRel);

        let now = Utc::now();
        if let Err(e) = self
            .shared
            .store
            .increment_campaign_hourly_sent(self.camp.id, now)
            .await
        {
            warn!(campaign = %self.camp.name, error = %e, "error updating hourly sent count");
        }

        let pending = self.unflushed.fetch_add(1, Ordering::AcqRel) + 1;
        if pending >= self.shared.cfg.flush_threshold as i64 {
            self.flush_counts().await;
        }
    }

    /// Flush accumulated sent-count deltas to storage.
    async fn flush_counts(&self) {
        let delta = self.unflushed.swap(0, Ordering::AcqRel);
        if delta == 0 {
            return;
        }

        if let Err(e) = self
            .shared
            .store
            .update_campaign_counts(self.camp.id, 0, delta, self.last_id.load(Ordering::Acquire))
            .await
        {
            // Put the delta back; the next flush retries it.
            self.unflushed.fetch_add(delta, Ordering::AcqRel);
            warn!(campaign = %self.camp.name, error = %e, "error flushing campaign counts");
        }
    }

    /// Mark the pipe stopped. In-flight messages still drain; no new
    /// messages are accepted. Idempotent.
    pub fn stop(&self, with_errors: bool) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        if with_errors {
            self.with_errors.store(true, Ordering::Release);
        }

        self.release_sentinel();
    }

    /// Release the sentinel waitgroup ticket exactly once.
    fn release_sentinel(&self) {
        if !self.sentinel_released.swap(true, Ordering::AcqRel) {
            self.wg.done();
        }
    }

    /// Finish the campaign: unregister, flush counters and transition the
    /// status. Runs exactly once, after the waitgroup drains.
    async fn cleanup(&self) {
        // Close the scheduler queue so its task exits.
        self.sched_tx.lock().unwrap().take();

        self.shared.pipes.lock().unwrap().remove(&self.camp.id);

        self.flush_counts().await;

        // Auto-paused due to errors.
        if self.with_errors.load(Ordering::Acquire) {
            if let Err(e) = self
                .shared
                .store
                .update_campaign_status(self.camp.id, CampaignStatus::Paused)
                .await
            {
                error!(campaign = %self.camp.name, error = %e, "error pausing campaign");
            } else {
                info!(campaign = %self.camp.name, "campaign paused");
            }

            self.notify(CampaignStatus::Paused, "Too many errors");
            return;
        }

        // Manually stopped (pause, cancel): the caller already set the
        // status it wanted.
        if self.is_stopped() {
            info!(campaign = %self.camp.name, "stopped processing campaign");
            return;
        }

        // Natural exhaustion: a still-running campaign is finished.
        let camp = match self.shared.store.get_campaign(self.camp.id).await {
            Ok(c) => c,
            Err(e) => {
                error!(campaign = %self.camp.name, error = %e, "error fetching campaign for finish");
                return;
            }
        };

        if camp.status == CampaignStatus::Running.as_str()
            || camp.status == CampaignStatus::Scheduled.as_str()
        {
            if let Err(e) = self
                .shared
                .store
                .update_campaign_status(self.camp.id, CampaignStatus::Finished)
                .await
            {
                error!(campaign = %self.camp.name, error = %e, "error finishing campaign");
            } else {
                info!(campaign = %self.camp.name, "campaign finished");
            }

            self.notify(CampaignStatus::Finished, "");
        } else {
            info!(campaign = %self.camp.name, status = %camp.status, "finished processing campaign");
        }
    }

    fn notify(&self, status: CampaignStatus, reason: &str) {
        let _ = self.shared.notif_tx.send(Notification {
            campaign_id: self.camp.id,
            campaign_name: self.camp.name.clone(),
            status,
            reason: reason.to_string(),
        });
    }
}

/// Drain the pipe's scheduled queue, releasing each message to the worker
/// queue at its scheduled time. Exits when the queue is closed by cleanup.
async fn run_scheduler(pipe: Arc<Pipe>, mut rx: mpsc::Receiver<ScheduledMessage>) {
    while let Some(sm) = rx.recv().await {
        tokio::time::sleep_until(sm.at).await;

        // Stopped in the meantime: drop the message and its ticket.
        if pipe.is_stopped() {
            pipe.wg.done();
            continue;
        }

        // The global sliding window is enforced at actual release time.
        pipe.shared.sliding.throttle().await;

        if pipe.is_stopped() {
            pipe.wg.done();
            continue;
        }

        if pipe.shared.msg_tx.send(sm.msg).await.is_err() {
            pipe.wg.done();
        }
    }
}

/// ceil(daily_quota / 24): the per-UTC-hour message allowance.
fn per_hour_allowance(daily_quota: i32) -> i64 {
    (daily_quota as i64 + 23) / 24
}

/// Time left until the top of the next UTC hour.
fn until_next_hour(now: DateTime<Utc>) -> Duration {
    let next = (now + ChronoDuration::hours(1))
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);

    (next - now).to_std().unwrap_or(Duration::ZERO)
}

/// Even spacing of `remaining` releases over the rest of the hour.
fn even_spacing(rest: Duration, remaining: i64) -> Duration {
    if remaining <= 0 {
        return Duration::ZERO;
    }
    rest / remaining as u32
}

/// Random offset in [-spacing/20, +spacing/20) so release times don't land
/// on exact multiples. Zero when spacing is a second or less.
fn jitter_nanos(spacing: Duration) -> i64 {
    if spacing <= Duration::from_secs(1) {
        return 0;
    }

    let range = (spacing.as_nanos() / 10) as i64;
    if range == 0 {
        return 0;
    }

    rand::thread_rng().gen_range(0..range) - range / 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_per_hour_allowance() {
        assert_eq!(per_hour_allowance(24), 1);
        assert_eq!(per_hour_allowance(25), 2);
        assert_eq!(per_hour_allowance(240), 10);
        assert_eq!(per_hour_allowance(1), 1);
        assert_eq!(per_hour_allowance(0), 0);
    }

    #[test]
    fn test_until_next_hour() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 9, 59, 30).unwrap();
        assert_eq!(until_next_hour(now), Duration::from_secs(30));

        let top = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();
        assert_eq!(until_next_hour(top), Duration::from_secs(3600));
    }

    #[test]
    fn test_even_spacing() {
        assert_eq!(
            even_spacing(Duration::from_secs(3600), 60),
            Duration::from_secs(60)
        );
        assert_eq!(
            even_spacing(Duration::from_secs(1800), 1),
            Duration::from_secs(1800)
        );
        assert_eq!(even_spacing(Duration::from_secs(3600), 0), Duration::ZERO);
    }

    #[test]
    fn test_jitter_bounds() {
        let spacing = Duration::from_secs(60);
        let half = (spacing.as_nanos() / 20) as i64;
        for _ in 0..100 {
            let j = jitter_nanos(spacing);
            assert!(j >= -half && j < half);
        }
        assert_eq!(jitter_nanos(Duration::from_millis(500)), 0);
    }
}
