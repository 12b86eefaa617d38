//! SMTP e-mail messenger.
//!
//! Wraps one or more SMTP server pools behind the `Messenger` contract.
//! A multi-server messenger picks a uniformly random server per push.
//! The envelope sender and visible From are rewritten to the authenticated
//! account where necessary (relays like Gmail reject mismatched senders),
//! preserving the original author via Reply-To.

use super::smtp::{SmtpAuth, SmtpPool, TlsMode};
use super::{Message, Messenger};
use async_trait::async_trait;
use chrono::Utc;
use lettermill_common::config::SmtpServerConfig;
use lettermill_common::{Error, Result};
use lettermill_storage::models::ContentType;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

/// Name of the default round-robin messenger covering all SMTP servers.
pub const EMAIL_MESSENGER_NAME: &str = "email";

static RE_SERVER_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9\-]").unwrap());

/// Normalize a configured SMTP server name: lowercase, non-alphanumerics
/// collapsed to dashes, `email-` prefix enforced. Empty stays empty.
pub fn sanitize_server_name(name: &str) -> String {
    let name = RE_SERVER_NAME
        .replace_all(&name.trim().to_lowercase(), "-")
        .to_string();

    if name.is_empty() || name.starts_with("email-") {
        name
    } else {
        format!("email-{}", name)
    }
}

/// One configured SMTP server with its live pool.
struct Server {
    host: String,
    username: String,
    email_headers: HashMap<String, String>,
    message_id_host: String,
    pool: SmtpPool,
}

/// The SMTP e-mail messenger.
pub struct Emailer {
    name: String,
    servers: Vec<Server>,
}

impl Emailer {
    /// Build a messenger over the given SMTP servers.
    ///
    /// `message_id_host` overrides the host fragment of generated
    /// Message-ID headers; it falls back to each server's host (a dev
    /// `localhost` there gets mail filtered by the big providers).
    pub fn new(
        name: impl Into<String>,
        configs: &[SmtpServerConfig],
        message_id_host: Option<&str>,
    ) -> Result<Self> {
        let mut servers = Vec::with_capacity(configs.len());

        for cfg in configs {
            // App passwords (Gmail, Outlook, iCloud) are handed out with
            // spaces for readability; servers expect them without.
            let password: String = cfg.password.replace(' ', "");

            let auth = SmtpAuth::from_protocol(&cfg.auth_protocol, &cfg.username, &password)?;

            let tls = TlsMode::parse(&cfg.tls_type).ok_or_else(|| {
                Error::Config(format!("unknown TLS type '{}'", cfg.tls_type))
            })?;

            let hello = cfg
                .hello_hostname
                .clone()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "localhost".to_string());

            let pool = SmtpPool::new(
                cfg.host.clone(),
                cfg.port,
                hello,
                tls,
                cfg.tls_skip_verify,
                auth,
                cfg.max_conns,
                Duration::from_secs(cfg.idle_timeout_secs),
                Duration::from_secs(cfg.wait_timeout_secs),
            )?;

            servers.push(Server {
                host: cfg.host.clone(),
                username: cfg.username.clone(),
                email_headers: cfg.email_headers.clone(),
                message_id_host: message_id_host
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| cfg.host.clone()),
                pool,
            });

            info!(host = %cfg.host, port = cfg.port, "initialized SMTP server pool");
        }

        Ok(Self {
            name: name.into(),
            servers,
        })
    }
}

#[async_trait]
impl Messenger for Emailer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, msg: Message) -> Result<()> {
        let srv = match self.servers.len() {
            0 => return Err(Error::Messenger("no SMTP servers configured".to_string())),
            1 => &self.servers[0],
            n => &self.servers[rand::thread_rng().gen_range(0..n)],
        };

        let sender = rewrite_sender(&msg.from, &srv.username);
        let data = assemble(&msg, &sender, srv);

        srv.pool.send(&sender.envelope_from, &msg.to, &data).await
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for srv in &self.servers {
            srv.pool.close().await;
        }
        Ok(())
    }
}

/// The resolved sender after envelope/From rewriting.
#[derive(Debug, PartialEq, Eq)]
struct Sender {
    envelope_from: String,
    from_header: String,
    reply_to: Option<String>,
}

/// Rewrite the envelope sender and From header against the authenticated
/// account.
///
/// When the server username is itself an address it becomes the envelope
/// sender; a From that doesn't mention it is rewritten to
/// `"display name" <username>` with the original preserved in Reply-To.
fn rewrite_sender(from: &str, username: &str) -> Sender {
    if !username.contains('@') {
        return Sender {
            envelope_from: extract_address(from),
            from_header: from.to_string(),
            reply_to: None,
        };
    }

    if from.contains(username) {
        return Sender {
            envelope_from: username.to_string(),
            from_header: from.to_string(),
            reply_to: None,
        };
    }

    let (display, _) = parse_address(from);
    let from_header = match display {
        Some(name) => format!("\"{}\" <{}>", name, username),
        None => format!("<{}>", username),
    };

    Sender {
        envelope_from: username.to_string(),
        from_header,
        reply_to: Some(from.to_string()),
    }
}

/// Split an RFC 5322 mailbox into display name and bare address.
fn parse_address(s: &str) -> (Option<String>, String) {
    let s = s.trim();

    if let (Some(open), Some(close)) = (s.rfind('<'), s.rfind('>')) {
        if open < close {
            let addr = s[open + 1..close].trim().to_string();
            let display = s[..open].trim().trim_matches('"').trim();
            let display = if display.is_empty() {
                None
            } else {
                Some(display.to_string())
            };
            return (display, addr);
        }
    }

    (None, s.to_string())
}

/// Bare address part of a mailbox string.
fn extract_address(s: &str) -> String {
    parse_address(s).1
}

/// Assemble the full RFC 5322 payload: rewritten/standard headers followed
/// by the rendered body.
fn assemble(msg: &Message, sender: &Sender, srv: &Server) -> Vec<u8> {
    let mut headers: Vec<(String, String)> = Vec::with_capacity(msg.headers.len() + 8);

    headers.push(("From".to_string(), sender.from_header.clone()));
    if let Some(reply_to) = &sender.reply_to {
        headers.push(("Reply-To".to_string(), reply_to.clone()));
    }
    headers.push(("To".to_string(), msg.to.join(", ")));
    headers.push(("Subject".to_string(), msg.subject.clone()));

    for (k, v) in &msg.headers {
        push_unless_present(&mut headers, k, v);
    }

    for (k, v) in &srv.email_headers {
        push_unless_present(&mut headers, k, v);
    }

    push_unless_present(&mut headers, "MIME-Version", "1.0");
    push_unless_present(
        &mut headers,
        "Date",
        &Utc::now().format("%a, %d %b %Y %H:%M:%S %z").to_string(),
    );
    push_unless_present(
        &mut headers,
        "Message-ID",
        &format!(
            "<{}.lettermill@{}>",
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            srv.message_id_host
        ),
    );

    let content_type = match msg.content_type {
        ContentType::Plain => "text/plain; charset=\"UTF-8\"",
        _ => "text/html; charset=\"UTF-8\"",
    };
    push_unless_present(&mut headers, "Content-Type", content_type);

    let mut data = Vec::with_capacity(msg.body.len() + 512);
    for (k, v) in &headers {
        data.extend_from_slice(k.as_bytes());
        data.extend_from_slice(b": ");
        data.extend_from_slice(v.as_bytes());
        data.extend_from_slice(b"\r\n");
    }
    data.extend_from_slice(b"\r\n");
    data.extend_from_slice(&msg.body);
    data
}

fn push_unless_present(headers: &mut Vec<(String, String)>, key: &str, value: &str) {
    if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(key)) {
        headers.push((key.to_string(), value.to_string()));
    }
}
