//! Campaign manager: the top-level coordinator of the send engine.
//!
//! Owns the messenger registry, the registry of active pipes, the shared
//! worker queue and the pipe dispatch queue. `run()` starts the worker
//! pool, a scan loop that adopts newly running campaigns, and a dispatcher
//! that drives each pipe's batch fetches.

use crate::message::Renderer;
use crate::messenger::Messenger;
use crate::pipe::{CampaignMessage, Pipe};
use crate::window::SlidingWindow;
use lettermill_common::config::EngineConfig;
use lettermill_common::{Error, Result};
use lettermill_storage::models::CampaignStatus;
use lettermill_storage::store::CampaignStore;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the pipe dispatch queue. Self-requeues beyond this are
/// dropped and re-adopted by the scan loop.
const PIPE_QUEUE_CAP: usize = 1024;

/// A campaign status transition surfaced to the operator.
#[derive(Debug, Clone)]
pub struct Notification {
    pub campaign_id: i64,
    pub campaign_name: String,
    pub status: CampaignStatus,
    pub reason: String,
}

/// State shared between the manager, its pipes and its workers.
pub(crate) struct EngineShared {
    pub(crate) cfg: EngineConfig,
    pub(crate) store: Arc<dyn CampaignStore>,
    pub(crate) renderer: Renderer,
    pub(crate) sliding: SlidingWindow,
    pub(crate) pipes: StdMutex<HashMap<i64, Arc<Pipe>>>,
    pub(crate) msg_tx: mpsc::Sender<CampaignMessage>,
    pub(crate) next_tx: mpsc::Sender<Arc<Pipe>>,
    pub(crate) notif_tx: mpsc::UnboundedSender<Notification>,
}

/// The campaign send manager.
pub struct Manager {
    shared: Arc<EngineShared>,
    messengers: RwLock<HashMap<String, Arc<dyn Messenger>>>,
    msg_rx: Arc<Mutex<mpsc::Receiver<CampaignMessage>>>,
    next_rx: StdMutex<Option<mpsc::Receiver<Arc<Pipe>>>>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<Manager>,
}

impl Manager {
    /// Build a manager. The returned receiver carries campaign status
    /// notifications (pause on errors, finish).
    pub fn new(
        cfg: EngineConfig,
        store: Arc<dyn CampaignStore>,
        root_url: &str,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Notification>) {
        let (msg_tx, msg_rx) = mpsc::channel(cfg.batch_size * 2);
        let (next_tx, next_rx) = mpsc::channel(PIPE_QUEUE_CAP);
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();

        let sliding = SlidingWindow::new(
            cfg.sliding_window,
            cfg.sliding_window_rate,
            Duration::from_secs(cfg.sliding_window_duration_secs),
        );

        let shared = Arc::new(EngineShared {
            renderer: Renderer::new(root_url),
            sliding,
            pipes: StdMutex::new(HashMap::new()),
            msg_tx,
            next_tx,
            notif_tx,
            store,
            cfg,
        });

        let manager = Arc::new_cyclic(|self_ref| Self {
            shared,
            messengers: RwLock::new(HashMap::new()),
            msg_rx: Arc::new(Mutex::new(msg_rx)),
            next_rx: StdMutex::new(Some(next_rx)),
            handles: StdMutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        });

        (manager, notif_rx)
    }

    /// Register a messenger. Fails on a duplicate name.
    pub async fn add_messenger(&self, m: Arc<dyn Messenger>) -> Result<()> {
        let mut messengers = self.messengers.write().await;
        let name = m.name().to_string();

        if messengers.contains_key(&name) {
            return Err(Error::Messenger(format!(
                "messenger '{}' is already registered",
                name
            )));
        }

        info!(messenger = %name, "registered messenger");
        messengers.insert(name, m);
        Ok(())
    }

    /// Close and unregister all messengers. Refused while campaigns are
    /// running, so a settings reload cannot race in-flight pushes.
    pub async fn clear_messengers(&self) -> Result<()> {
        if self.has_running_campaigns() {
            return Err(Error::Validation(
                "cannot swap messengers while campaigns are running".to_string(),
            ));
        }

        let mut messengers = self.messengers.write().await;
        for (name, m) in messengers.drain() {
            if let Err(e) = m.close().await {
                warn!(messenger = %name, error = %e, "error closing messenger");
            }
        }
        Ok(())
    }

    /// Whether any campaign currently has a live pipe.
    pub fn has_running_campaigns(&self) -> bool {
        !self.shared.pipes.lock().unwrap().is_empty()
    }

    /// Signal a running campaign's pipe to stop (pause/cancel). Returns
    /// false when the campaign has no live pipe.
    pub fn stop_campaign(&self, campaign_id: i64) -> bool {
        let pipe = self
            .shared
            .pipes
            .lock()
            .unwrap()
            .get(&campaign_id)
            .cloned();

        match pipe {
            Some(p) => {
                p.stop(false);
                true
            }
            None => false,
        }
    }

    /// Start the worker pool, the campaign scan loop and the dispatcher.
    pub fn run(&self) {
        let Some(manager) = self.self_ref.upgrade() else {
            return;
        };

        let mut handles = self.handles.lock().unwrap();

        for i in 0..self.shared.cfg.concurrency.max(1) {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.worker_loop(i).await;
            }));
        }

        {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.scan_loop().await;
            }));
        }

        handles.push(tokio::spawn(async move {
            manager.dispatch_loop().await;
        }));

        info!(
            workers = self.shared.cfg.concurrency,
            "campaign manager started"
        );
    }

    /// Stop everything: signal pipes, drain the worker queue, close
    /// messengers. Pipes waiting out quota timers discard their messages
    /// when those timers fire; their cleanup is not waited for here.
    pub async fn close(&self) {
        info!("campaign manager shutting down");

        // Pipes first: no new fetches, queued messages drain through the
        // still-running workers.
        let pipes: Vec<Arc<Pipe>> = self
            .shared
            .pipes
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for p in &pipes {
            p.stop(false);
        }

        // Let the workers empty the message queue.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.shared.msg_tx.capacity() < self.shared.msg_tx.max_capacity()
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for h in self.handles.lock().unwrap().drain(..) {
            h.abort();
        }

        let mut messengers = self.messengers.write().await;
        for (name, m) in messengers.drain() {
            if let Err(e) = m.close().await {
                warn!(messenger = %name, error = %e, "error closing messenger");
            }
        }

        info!("campaign manager shut down");
    }

    /// Poll storage for running/scheduled campaigns without a live pipe and
    /// adopt them.
    async fn scan_loop(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.shared.cfg.scan_interval_secs.max(1)));

        loop {
            ticker.tick().await;

            let active: Vec<i64> = self
                .shared
                .pipes
                .lock()
                .unwrap()
                .keys()
                .copied()
                .collect();

            let campaigns = match self.shared.store.next_campaigns(&active).await {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, "error scanning for campaigns");
                    continue;
                }
            };

            for mut camp in campaigns {
                // A scheduled campaign whose time has come starts running.
                if camp.status == CampaignStatus::Scheduled.as_str() {
                    if let Err(e) = self
                        .shared
                        .store
                        .update_campaign_status(camp.id, CampaignStatus::Running)
                        .await
                    {
                        error!(campaign = %camp.name, error = %e, "error starting scheduled campaign");
                        continue;
                    }
                    camp.status = CampaignStatus::Running.as_str().to_string();
                }

                match self.add_pipe_for(camp).await {
                    Ok(pipe) => {
                        if self.shared.next_tx.send(pipe).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "error creating campaign pipe");
                    }
                }
            }
        }
    }

    /// Validate the campaign's messenger and build its pipe.
    async fn add_pipe_for(
        &self,
        camp: lettermill_storage::models::Campaign,
    ) -> Result<Arc<Pipe>> {
        if !self.messengers.read().await.contains_key(&camp.messenger) {
            // Fatal for the campaign: without a backend it can never send.
            let _ = self
                .shared
                .store
                .update_campaign_status(camp.id, CampaignStatus::Cancelled)
                .await;

            return Err(Error::Messenger(format!(
                "unknown messenger '{}' on campaign '{}'",
                camp.messenger, camp.name
            )));
        }

        info!(campaign = %camp.name, id = camp.id, "starting campaign pipe");
        Pipe::new(camp, self.shared.clone())
    }

    /// Drive pipes round-robin: each processed batch puts the pipe back at
    /// the end of the queue.
    async fn dispatch_loop(self: Arc<Self>) {
        let mut rx = match self.next_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return,
        };

        while let Some(pipe) = rx.recv().await {
            if pipe.is_stopped() {
                continue;
            }

            match pipe.next_subscribers().await {
                Ok(true) => self.requeue(pipe),
                Ok(false) => {
                    // Exhausted (sentinel released) or waiting out the
                    // hourly quota (self-requeues).
                }
                Err(e) => {
                    // Transient storage errors: log and retry the pipe.
                    error!(campaign_id = pipe.campaign_id(), error = %e, "error processing batch");
                    self.requeue(pipe);
                }
            }
        }
    }

    /// Requeue without blocking the dispatcher (it is its own consumer).
    fn requeue(&self, pipe: Arc<Pipe>) {
        if let Err(mpsc::error::TrySendError::Full(pipe)) = self.shared.next_tx.try_send(pipe) {
            let tx = self.shared.next_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(pipe).await;
            });
        }
    }

    /// Consume campaign messages and push them through the resolved
    /// messenger, tracking successes and errors on the owning pipe.
    async fn worker_loop(self: Arc<Self>, id: usize) {
        debug!(worker = id, "send worker started");

        loop {
            let msg = {
                let mut rx = self.msg_rx.lock().await;
                rx.recv().await
            };

            let Some(msg) = msg else {
                break;
            };

            let CampaignMessage {
                message,
                messenger,
                campaign_id,
                subscriber_id,
                pipe,
            } = msg;

            let backend = self.messengers.read().await.get(&messenger).cloned();

            let result = match backend {
                Some(m) => m.push(message).await,
                None => Err(Error::Messenger(format!(
                    "unknown messenger '{}'",
                    messenger
                ))),
            };

            match result {
                Ok(()) => {
                    pipe.record_sent(subscriber_id).await;
                }
                Err(e) => {
                    error!(
                        campaign_id,
                        subscriber_id,
                        error = %e,
                        "error sending message"
                    );
                    pipe.on_error();
                }
            }

            pipe.wg.done();
        }

        debug!(worker = id, "send worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::Message;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use lettermill_storage::models::{Bounce, Campaign, Subscriber};
    use std::sync::atomic::{AtomicU64, Ordering};
    use uuid::Uuid;

    /// In-memory store driving one or more campaigns through the engine.
    struct MockStore {
        campaigns: StdMutex<HashMap<i64, Campaign>>,
        subscribers: StdMutex<HashMap<i64, Vec<Subscriber>>>,
        cursors: StdMutex<HashMap<i64, i64>>,
        hourly: StdMutex<HashMap<(i64, u32), i64>>,
    }

    impl MockStore {
        fn new(campaigns: Vec<Campaign>, subscribers: HashMap<i64, Vec<Subscriber>>) -> Self {
            Self {
                campaigns: StdMutex::new(
                    campaigns.into_iter().map(|c| (c.id, c)).collect(),
                ),
                subscribers: StdMutex::new(subscribers),
                cursors: StdMutex::new(HashMap::new()),
                hourly: StdMutex::new(HashMap::new()),
            }
        }

        fn status(&self, id: i64) -> String {
            self.campaigns.lock().unwrap()[&id].status.clone()
        }

        fn sent(&self, id: i64) -> i32 {
            self.campaigns.lock().unwrap()[&id].sent
        }
    }

    #[async_trait]
    impl CampaignStore for MockStore {
        async fn next_campaigns(&self, exclude: &[i64]) -> lettermill_common::Result<Vec<Campaign>> {
            Ok(self
                .campaigns
                .lock()
                .unwrap()
                .values()
                .filter(|c| {
                    (c.status == "running" || c.status == "scheduled")
                        && !exclude.contains(&c.id)
                })
                .cloned()
                .collect())
        }

        async fn get_campaign(&self, id: i64) -> lettermill_common::Result<Campaign> {
            self.campaigns
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("campaign {}", id)))
        }

        async fn update_campaign_status(
            &self,
            id: i64,
            status: CampaignStatus,
        ) -> lettermill_common::Result<()> {
            if let Some(c) = self.campaigns.lock().unwrap().get_mut(&id) {
                c.status = status.as_str().to_string();
            }
            Ok(())
        }

        async fn next_subscribers(
            &self,
            campaign_id: i64,
            limit: usize,
        ) -> lettermill_common::Result<Vec<Subscriber>> {
            let mut cursors = self.cursors.lock().unwrap();
            let cursor = cursors.entry(campaign_id).or_insert(0);

            let subs: Vec<Subscriber> = self
                .subscribers
                .lock()
                .unwrap()
                .get(&campaign_id)
                .map(|all| {
                    all.iter()
                        .filter(|s| s.id > *cursor && s.status == "enabled")
                        .take(limit)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            if let Some(last) = subs.last() {
                *cursor = last.id;
            }
            Ok(subs)
        }

        async fn get_campaign_hourly_sent(
            &self,
            campaign_id: i64,
            at: DateTime<Utc>,
        ) -> lettermill_common::Result<i64> {
            use chrono::Timelike;
            Ok(*self
                .hourly
                .lock()
                .unwrap()
                .get(&(campaign_id, at.hour()))
                .unwrap_or(&0))
        }

        async fn increment_campaign_hourly_sent(
            &self,
            campaign_id: i64,
            at: DateTime<Utc>,
        ) -> lettermill_common::Result<()> {
            use chrono::Timelike;
            *self
                .hourly
                .lock()
                .unwrap()
                .entry((campaign_id, at.hour()))
                .or_insert(0) += 1;
            Ok(())
        }

        async fn update_campaign_counts(
            &self,
            campaign_id: i64,
            to_send_delta: i64,
            sent_delta: i64,
            last_subscriber_id: i64,
        ) -> lettermill_common::Result<()> {
            if let Some(c) = self.campaigns.lock().unwrap().get_mut(&campaign_id) {
                c.to_send += to_send_delta as i32;
                c.sent += sent_delta as i32;
                c.last_subscriber_id = c.last_subscriber_id.max(last_subscriber_id);
            }
            Ok(())
        }

        async fn record_bounce(&self, _bounce: &Bounce) -> lettermill_common::Result<()> {
            Ok(())
        }
    }

    /// Messenger that counts pushes, optionally failing or delaying each.
    struct MockMessenger {
        pushes: AtomicU64,
        fail: bool,
        delay: Duration,
    }

    impl MockMessenger {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                pushes: AtomicU64::new(0),
                fail,
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                pushes: AtomicU64::new(0),
                fail: false,
                delay,
            })
        }
    }

    #[async_trait]
    impl Messenger for MockMessenger {
        fn name(&self) -> &str {
            "email"
        }

        async fn push(&self, _msg: Message) -> lettermill_common::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.pushes.fetch_add(1, Ordering::AcqRel);
            if self.fail {
                Err(Error::Smtp("simulated failure".to_string()))
            } else {
                Ok(())
            }
        }

        async fn flush(&self) -> lettermill_common::Result<()> {
            Ok(())
        }

        async fn close(&self) -> lettermill_common::Result<()> {
            Ok(())
        }
    }

    fn test_campaign(id: i64, daily_quota: Option<i32>) -> Campaign {
        Campaign {
            id,
            uuid: Uuid::new_v4(),
            name: format!("campaign-{}", id),
            subject: "Hello {{name}}".to_string(),
            from_email: Some("News <news@example.org>".to_string()),
            body: "Hi {{name}}".to_string(),
            content_type: "html".to_string(),
            status: "running".to_string(),
            messenger: "email".to_string(),
            daily_quota,
            send_interval: None,
            to_send: 0,
            sent: 0,
            last_subscriber_id: 0,
            send_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_subscribers(n: i64) -> Vec<Subscriber> {
        (1..=n)
            .map(|i| Subscriber {
                id: i,
                uuid: Uuid::new_v4(),
                email: format!("sub{}@example.com", i),
                name: format!("Sub {}", i),
                attribs: serde_json::json!({}),
                status: "enabled".to_string(),
            })
            .collect()
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            concurrency: 2,
            batch_size: 10,
            max_send_errors: 5,
            scan_interval_secs: 1,
            flush_threshold: 3,
            ..EngineConfig::default()
        }
    }

    async fn wait_for_status(store: &MockStore, id: i64, status: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while store.status(id) != status {
            assert!(
                tokio::time::Instant::now() < deadline,
                "campaign {} never reached status {}, still {}",
                id,
                status,
                store.status(id)
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_direct_path_sends_all_and_finishes() {
        let store = Arc::new(MockStore::new(
            vec![test_campaign(1, None)],
            HashMap::from([(1, test_subscribers(10))]),
        ));
        let messenger = MockMessenger::new(false);

        let (manager, _notifs) =
            Manager::new(test_config(), store.clone(), "https://news.example.com");
        manager.add_messenger(messenger.clone()).await.unwrap();
        manager.run();

        wait_for_status(&store, 1, "finished").await;

        assert_eq!(messenger.pushes.load(Ordering::Acquire), 10);
        assert_eq!(store.sent(1), 10);
        assert!(!manager.has_running_campaigns());

        manager.close().await;
    }

    #[tokio::test]
    async fn test_error_threshold_pauses_campaign() {
        let store = Arc::new(MockStore::new(
            vec![test_campaign(1, None)],
            HashMap::from([(1, test_subscribers(50))]),
        ));
        let messenger = MockMessenger::new(true);

        let (manager, mut notifs) =
            Manager::new(test_config(), store.clone(), "https://news.example.com");
        manager.add_messenger(messenger.clone()).await.unwrap();
        manager.run();

        wait_for_status(&store, 1, "paused").await;

        assert!(messenger.pushes.load(Ordering::Acquire) >= 5);

        let notif = tokio::time::timeout(Duration::from_secs(5), notifs.recv())
            .await
            .expect("notification should arrive")
            .expect("channel open");
        assert_eq!(notif.campaign_id, 1);
        assert_eq!(notif.status, CampaignStatus::Paused);
        assert_eq!(notif.reason, "Too many errors");

        // Once paused, dispatch is quiescent: no further pushes.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let settled = messenger.pushes.load(Ordering::Acquire);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(messenger.pushes.load(Ordering::Acquire), settled);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_unknown_messenger_cancels_campaign() {
        let mut camp = test_campaign(1, None);
        camp.messenger = "postback".to_string();

        let store = Arc::new(MockStore::new(
            vec![camp],
            HashMap::from([(1, test_subscribers(5))]),
        ));
        let messenger = MockMessenger::new(false);

        let (manager, _notifs) =
            Manager::new(test_config(), store.clone(), "https://news.example.com");
        manager.add_messenger(messenger.clone()).await.unwrap();
        manager.run();

        wait_for_status(&store, 1, "cancelled").await;
        assert_eq!(messenger.pushes.load(Ordering::Acquire), 0);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_stop_campaign_leaves_status_untouched() {
        // A slow messenger keeps the campaign mid-flight long enough to
        // pause it; the engine must not rewrite the operator's status.
        let store = Arc::new(MockStore::new(
            vec![test_campaign(1, None)],
            HashMap::from([(1, test_subscribers(100))]),
        ));
        let messenger = MockMessenger::slow(Duration::from_millis(20));

        let (manager, _notifs) =
            Manager::new(test_config(), store.clone(), "https://news.example.com");
        manager.add_messenger(messenger.clone()).await.unwrap();
        manager.run();

        // Wait for the first deliveries, then pause.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while messenger.pushes.load(Ordering::Acquire) == 0 {
            assert!(tokio::time::Instant::now() < deadline, "no deliveries started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        store
            .update_campaign_status(1, CampaignStatus::Paused)
            .await
            .unwrap();
        assert!(manager.stop_campaign(1));

        // The pipe drains its queued messages and unregisters without
        // rewriting the status or fetching further batches.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.has_running_campaigns() {
            assert!(tokio::time::Instant::now() < deadline, "pipe never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(store.status(1), "paused");
        assert!(messenger.pushes.load(Ordering::Acquire) < 100);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_messenger_rejected() {
        let store = Arc::new(MockStore::new(vec![], HashMap::new()));
        let (manager, _notifs) =
            Manager::new(test_config(), store, "https://news.example.com");

        manager
            .add_messenger(MockMessenger::new(false))
            .await
            .unwrap();
        assert!(manager
            .add_messenger(MockMessenger::new(false))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_quota_limits_first_hour_batch() {
        // daily_quota 24 => 1 message per UTC hour. Only one message may be
        // released promptly; the rest wait for later hours.
        let store = Arc::new(MockStore::new(
            vec![test_campaign(1, Some(24))],
            HashMap::from([(1, test_subscribers(100))]),
        ));
        let messenger = MockMessenger::new(false);

        let (manager, _notifs) =
            Manager::new(test_config(), store.clone(), "https://news.example.com");
        manager.add_messenger(messenger.clone()).await.unwrap();
        manager.run();

        // Allow a couple of scan/dispatch cycles.
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(
            messenger.pushes.load(Ordering::Acquire) <= 1,
            "quota of ceil(24/24)=1 per hour exceeded: {} pushes",
            messenger.pushes.load(Ordering::Acquire)
        );
        assert_eq!(store.status(1), "running");

        manager.close().await;
    }
}
