//! Bounce mailbox scanning.
//!
//! Each configured POP3 mailbox is drained on its own interval: messages
//! are downloaded, parsed and classified into `Bounce` records, pushed onto
//! an in-memory channel and deleted from the server. A recorder task writes
//! the records through the store, which resolves subscribers and applies
//! the configured bounce actions.

mod classify;
mod pop;

pub use classify::{classify, is_valid_uuid, parse_bounce};
pub use pop::Pop3Client;

use lettermill_common::config::{BounceConfig, BounceMailboxConfig};
use lettermill_common::Result;
use lettermill_storage::models::Bounce;
use lettermill_storage::store::CampaignStore;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the in-memory bounce channel. A full channel drops new
/// bounces rather than stalling the mailbox scan.
const BOUNCE_QUEUE_CAP: usize = 512;

/// Scans configured bounce mailboxes and records the results.
pub struct BounceScanner {
    cfg: BounceConfig,
    store: Arc<dyn CampaignStore>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl BounceScanner {
    pub fn new(cfg: BounceConfig, store: Arc<dyn CampaignStore>) -> Self {
        Self {
            cfg,
            store,
            handles: StdMutex::new(Vec::new()),
        }
    }

    /// Start one scan task per mailbox plus the recorder.
    pub fn run(&self) {
        if !self.cfg.enabled || self.cfg.mailboxes.is_empty() {
            info!("bounce scanning disabled");
            return;
        }

        let (tx, rx) = mpsc::channel::<Bounce>(BOUNCE_QUEUE_CAP);
        let mut handles = self.handles.lock().unwrap();

        for mailbox in self.cfg.mailboxes.clone() {
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                scan_loop(mailbox, tx).await;
            }));
        }

        let store = self.store.clone();
        handles.push(tokio::spawn(async move {
            record_loop(rx, store).await;
        }));

        info!(
            mailboxes = self.cfg.mailboxes.len(),
            "bounce scanner started"
        );
    }

    /// Stop all scan tasks.
    pub fn stop(&self) {
        for h in self.handles.lock().unwrap().drain(..) {
            h.abort();
        }
    }
}

/// Periodically drain one mailbox.
async fn scan_loop(mailbox: BounceMailboxConfig, tx: mpsc::Sender<Bounce>) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(mailbox.scan_interval_minutes.max(1) * 60));

    loop {
        ticker.tick().await;

        match scan_mailbox(&mailbox, &tx).await {
            Ok(0) => {}
            Ok(n) => info!(host = %mailbox.host, count = n, "processed bounce messages"),
            Err(e) => error!(host = %mailbox.host, error = %e, "error scanning bounce mailbox"),
        }
    }
}

/// One scan cycle: download up to the configured limit, emit bounces,
/// delete the downloaded messages.
async fn scan_mailbox(mailbox: &BounceMailboxConfig, tx: &mpsc::Sender<Bounce>) -> Result<usize> {
    let mut client = Pop3Client::connect(mailbox).await?;

    if mailbox.auth_protocol != "none" {
        client.auth(&mailbox.username, &mailbox.password).await?;
    }

    let (total, _) = client.stat().await?;
    if total == 0 {
        client.quit().await?;
        return Ok(0);
    }

    let count = if mailbox.fetch_limit > 0 {
        total.min(mailbox.fetch_limit)
    } else {
        total
    };

    for id in 1..=count {
        let raw = client.retr(id).await?;

        match parse_bounce(&raw, &mailbox.username, &mailbox.host) {
            Ok(bounce) => {
                debug!(
                    email = %bounce.email,
                    campaign_uuid = %bounce.campaign_uuid,
                    r#type = %bounce.bounce_type,
                    "bounce detected"
                );

                // Non-blocking: a backed-up recorder drops bounces rather
                // than stalling the scan.
                if tx.try_send(bounce).is_err() {
                    warn!(host = %mailbox.host, "bounce queue full, dropping bounce");
                }
            }
            Err(e) => {
                warn!(host = %mailbox.host, error = %e, "skipping unparseable bounce message");
            }
        }
    }

    // Delete everything that was downloaded.
    for id in 1..=count {
        client.dele(id).await?;
    }

    client.quit().await?;
    Ok(count)
}

/// Write bounces through the store as they arrive.
async fn record_loop(mut rx: mpsc::Receiver<Bounce>, store: Arc<dyn CampaignStore>) {
    while let Some(bounce) = rx.recv().await {
        if let Err(e) = store.record_bounce(&bounce).await {
            error!(email = %bounce.email, error = %e, "error recording bounce");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Loopback POP3 server with two canned bounce messages.
    async fn fake_pop3(listener: TcpListener) -> Vec<String> {
        let hard = "X-Listmonk-Campaign: 550e8400-e29b-41d4-a716-446655440000\r\n\
                    Final-Recipient: rfc822; gone@x.com\r\n\
                    \r\n\
                    Status: 5.1.1";
        let soft = "Final-Recipient: rfc822; full@x.com\r\n\
                    \r\n\
                    Status: 4.2.2 mailbox full";

        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = tokio::io::BufReader::new(read);
        let mut commands = Vec::new();

        write.write_all(b"+OK ready\r\n").await.unwrap();

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let cmd = line.trim_end().to_string();
            commands.push(cmd.clone());

            let upper = cmd.to_ascii_uppercase();
            if upper == "STAT" {
                write.write_all(b"+OK 2 1024\r\n").await.unwrap();
            } else if upper.starts_with("RETR") {
                let msg = if upper.ends_with('1') { hard } else { soft };
                write.write_all(b"+OK\r\n").await.unwrap();
                write.write_all(msg.as_bytes()).await.unwrap();
                write.write_all(b"\r\n.\r\n").await.unwrap();
            } else if upper == "QUIT" {
                write.write_all(b"+OK bye\r\n").await.unwrap();
                break;
            } else {
                write.write_all(b"+OK\r\n").await.unwrap();
            }
        }

        commands
    }

    #[tokio::test]
    async fn test_scan_mailbox_emits_and_deletes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(fake_pop3(listener));

        let mailbox = BounceMailboxConfig {
            host: "127.0.0.1".to_string(),
            port,
            auth_protocol: "userpass".to_string(),
            username: "bounces@example.net".to_string(),
            password: "secret".to_string(),
            tls_enabled: false,
            tls_skip_verify: false,
            scan_interval_minutes: 15,
            fetch_limit: 100,
        };

        let (tx, mut rx) = mpsc::channel(16);
        let processed = scan_mailbox(&mailbox, &tx).await.unwrap();
        assert_eq!(processed, 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.email, "gone@x.com");
        assert_eq!(
            first.campaign_uuid,
            "550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(first.bounce_type.as_str(), "hard");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.email, "full@x.com");
        assert_eq!(second.bounce_type.as_str(), "soft");

        let commands = server.await.unwrap();
        assert!(commands.contains(&"DELE 1".to_string()));
        assert!(commands.contains(&"DELE 2".to_string()));
    }
}
