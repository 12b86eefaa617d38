//! lettermill - campaign send engine entry point

use anyhow::Result;
use lettermill_common::config::{Config, SmtpServerConfig};
use lettermill_engine::messenger::{sanitize_server_name, Emailer, EMAIL_MESSENGER_NAME};
use lettermill_engine::{BounceScanner, Manager, Notification};
use lettermill_storage::{DatabasePool, PgCampaignStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    init_logging(&config.logging.level);

    info!("Starting lettermill...");

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;

    // Run migrations
    db_pool.migrate().await?;

    let store = Arc::new(PgCampaignStore::new(
        db_pool.clone(),
        config.bounce.actions.clone(),
    ));

    // Campaign manager
    let (manager, notif_rx) = Manager::new(
        config.engine.clone(),
        store.clone(),
        &config.app.root_url,
    );

    register_messengers(&manager, &config).await?;

    // Surface campaign status transitions to the operator log.
    let notif_handle = tokio::spawn(consume_notifications(notif_rx));

    manager.run();

    // Bounce mailbox scanning
    let bounce_scanner = BounceScanner::new(config.bounce.clone(), store.clone());
    bounce_scanner.run();

    info!("lettermill started");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    bounce_scanner.stop();
    manager.close().await;
    notif_handle.abort();

    info!("lettermill shutdown complete");

    Ok(())
}

/// Build the grouped "email" messenger over all enabled SMTP servers, plus
/// a standalone messenger per named server.
async fn register_messengers(manager: &Arc<Manager>, config: &Config) -> Result<()> {
    let servers: Vec<SmtpServerConfig> = config
        .smtp_servers
        .iter()
        .filter(|s| s.enabled)
        .cloned()
        .collect();

    if servers.is_empty() {
        anyhow::bail!("no enabled SMTP servers configured");
    }

    let message_id_host = config.app.message_id_host.as_deref();

    let emailer = Emailer::new(EMAIL_MESSENGER_NAME, &servers, message_id_host)?;
    manager.add_messenger(Arc::new(emailer)).await?;

    // Named servers double as standalone messengers so campaigns can pin a
    // specific server.
    if servers.len() > 1 {
        for srv in &servers {
            let name = sanitize_server_name(&srv.name);
            if name.is_empty() {
                continue;
            }

            let emailer = Emailer::new(&name, std::slice::from_ref(srv), message_id_host)?;
            manager.add_messenger(Arc::new(emailer)).await?;
        }
    }

    info!(
        servers = servers.len(),
        "initialized SMTP messengers"
    );
    Ok(())
}

async fn consume_notifications(mut rx: mpsc::UnboundedReceiver<Notification>) {
    while let Some(n) = rx.recv().await {
        match n.reason.as_str() {
            "" => info!(
                campaign = %n.campaign_name,
                status = %n.status,
                "campaign status changed"
            ),
            reason => warn!(
                campaign = %n.campaign_name,
                status = %n.status,
                reason,
                "campaign status changed"
            ),
        }
    }

    error!("notification channel closed");
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},lettermill=debug", level)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
