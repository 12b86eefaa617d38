//! Messenger backends.
//!
//! A messenger accepts a fully-rendered message and delivers it. The engine
//! routes each campaign message to the messenger registered under the
//! campaign's messenger name.

mod email;
mod smtp;

pub use email::{sanitize_server_name, Emailer, EMAIL_MESSENGER_NAME};
pub use smtp::{SmtpAuth, SmtpPool, TlsMode};

use async_trait::async_trait;
use lettermill_common::Result;
use lettermill_storage::models::ContentType;

/// A fully-rendered outgoing message.
#[derive(Debug, Clone)]
pub struct Message {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: Vec<u8>,
    pub content_type: ContentType,
    pub headers: Vec<(String, String)>,
}

/// A pluggable delivery backend. Implementations must be thread-safe;
/// `push` blocks until the message has been handed to the server (or a
/// pool/wire error surfaces).
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Unique messenger name used for campaign routing.
    fn name(&self) -> &str;

    /// Deliver one message.
    async fn push(&self, msg: Message) -> Result<()>;

    /// Flush any buffered state.
    async fn flush(&self) -> Result<()>;

    /// Close connections and release resources.
    async fn close(&self) -> Result<()>;
}
