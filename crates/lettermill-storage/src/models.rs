//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Cancelled,
    Finished,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Cancelled => "cancelled",
            CampaignStatus::Finished => "finished",
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Campaign body content type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Richtext,
    Html,
    Markdown,
    Plain,
    Visual,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Richtext => "richtext",
            ContentType::Html => "html",
            ContentType::Markdown => "markdown",
            ContentType::Plain => "plain",
            ContentType::Visual => "visual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "richtext" => Some(ContentType::Richtext),
            "html" => Some(ContentType::Html),
            "markdown" => Some(ContentType::Markdown),
            "plain" => Some(ContentType::Plain),
            "visual" => Some(ContentType::Visual),
            _ => None,
        }
    }
}

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub subject: String,
    pub from_email: Option<String>,
    pub body: String,
    pub content_type: String,
    pub status: String,
    pub messenger: String,
    /// Per-day send cap distributed over 24 UTC hours. None means unlimited.
    pub daily_quota: Option<i32>,
    /// Hour-of-day send window, "HH:MM-HH:MM" in UTC
    pub send_interval: Option<String>,
    pub to_send: i32,
    pub sent: i32,
    pub last_subscriber_id: i64,
    pub send_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Parsed content type, defaulting to richtext for unknown values
    pub fn content_type(&self) -> ContentType {
        ContentType::parse(&self.content_type).unwrap_or(ContentType::Richtext)
    }

    /// Whether a daily quota is in effect
    pub fn has_daily_quota(&self) -> bool {
        self.daily_quota.map(|q| q > 0).unwrap_or(false)
    }
}

/// Subscriber status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Enabled,
    Disabled,
    Blocklisted,
}

impl SubscriberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberStatus::Enabled => "enabled",
            SubscriberStatus::Disabled => "disabled",
            SubscriberStatus::Blocklisted => "blocklisted",
        }
    }
}

/// Subscriber model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: i64,
    pub uuid: Uuid,
    pub email: String,
    pub name: String,
    /// Opaque key/value attributes available to templates
    pub attribs: serde_json::Value,
    pub status: String,
}

/// Bounce severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceType {
    Hard,
    Soft,
    Complaint,
}

impl BounceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BounceType::Hard => "hard",
            BounceType::Soft => "soft",
            BounceType::Complaint => "complaint",
        }
    }
}

impl std::fmt::Display for BounceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bounce event extracted from a bounce mailbox.
///
/// The UUID fields hold either a valid v4 UUID or the empty string; an empty
/// value triggers an email-based lookup when the bounce is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bounce {
    #[serde(rename = "type")]
    pub bounce_type: BounceType,
    pub email: String,
    pub campaign_uuid: String,
    pub subscriber_uuid: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub meta: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_campaign_status_roundtrip() {
        assert_eq!(CampaignStatus::Running.to_string(), "running");
        assert_eq!(CampaignStatus::Finished.as_str(), "finished");
    }

    #[test]
    fn test_content_type_parse() {
        assert_eq!(ContentType::parse("visual"), Some(ContentType::Visual));
        assert_eq!(ContentType::parse("bogus"), None);
    }

    #[test]
    fn test_has_daily_quota() {
        let mut c = test_campaign();
        assert!(!c.has_daily_quota());
        c.daily_quota = Some(0);
        assert!(!c.has_daily_quota());
        c.daily_quota = Some(24);
        assert!(c.has_daily_quota());
    }

    fn test_campaign() -> Campaign {
        Campaign {
            id: 1,
            uuid: Uuid::new_v4(),
            name: "test".to_string(),
            subject: "Hello".to_string(),
            from_email: None,
            body: "Hi {{name}}".to_string(),
            content_type: "html".to_string(),
            status: "running".to_string(),
            messenger: "email".to_string(),
            daily_quota: None,
            send_interval: None,
            to_send: 0,
            sent: 0,
            last_subscriber_id: 0,
            send_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
