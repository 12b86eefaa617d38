//! lettermill Engine - the campaign send engine
//!
//! This crate contains the manager/worker pipeline that streams campaign
//! subscribers out of storage, renders and paces messages, dispatches them
//! through pluggable messengers (chiefly SMTP), and ingests bounce mail
//! back into the store.

pub mod bounce;
pub mod manager;
pub mod message;
pub mod messenger;
pub mod pipe;
pub mod sendwindow;
mod tls;
pub mod waitgroup;
pub mod window;

pub use bounce::BounceScanner;
pub use manager::{Manager, Notification};
pub use message::Renderer;
pub use messenger::{Emailer, Message, Messenger, EMAIL_MESSENGER_NAME};
pub use pipe::Pipe;
pub use sendwindow::SendWindow;
pub use window::SlidingWindow;
