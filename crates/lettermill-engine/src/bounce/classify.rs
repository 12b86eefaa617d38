//! Bounce message classification and field extraction.
//!
//! Extraction prefers structured headers over body regexes: DSN headers on
//! the last MIME part first, then labeled patterns across the raw body, and
//! for the campaign UUID a last-resort search near campaign-related
//! keywords. Body-derived UUIDs are lower confidence, so a header value
//! always wins when both exist.

use crate::message::{HDR_CAMPAIGN_UUID, HDR_SUBSCRIBER_UUID};
use chrono::{DateTime, Utc};
use lettermill_common::{Error, Result};
use lettermill_storage::models::{Bounce, BounceType};
use mailparse::{MailHeaderMap, ParsedMail};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// SMTP enhanced status code (5.x.x hard, 4.x.x soft) anywhere in the body.
static RE_SMTP_STATUS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^(?:Status:\s*)?(?:\d{3}\s+)?([45]\.\d+\.\d+)").unwrap());

/// Conventional phrasings of permanent failures.
static RE_HARD_BOUNCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(NXDOMAIN|user unknown|address not found|mailbox not found|address.*reject|does not exist|invalid recipient|no such user|recipient.*invalid|undeliverable|permanent.*failure|permanent.*error|bad.*address|unknown.*user|account.*disabled|address.*disabled)",
    )
    .unwrap()
});

static RE_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12})").unwrap()
});

static RE_CAMPAIGN_UUID_BODY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r#"(?i)(?:^|[\s>"']|{}[:\s]+)([a-f0-9-]{{36}})(?:[<"'\s,;]|$)"#,
        HDR_CAMPAIGN_UUID
    ))
    .unwrap()
});

static RE_SUBSCRIBER_UUID_BODY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r#"(?i)(?:^|[\s>"']|{}[:\s]+)([a-f0-9-]{{36}})(?:[<"'\s,;]|$)"#,
        HDR_SUBSCRIBER_UUID
    ))
    .unwrap()
});

static RE_EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,})").unwrap());

static RE_RFC822_EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)rfc822;\s*([a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,})").unwrap()
});

static RE_FINAL_RECIPIENT_BODY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)final[- ]?recipient[:\s]+(?:rfc822;)?\s*([a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,})")
        .unwrap()
});

static RE_ORIGINAL_RECIPIENT_BODY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)original[- ]?recipient[:\s]+(?:rfc822;)?\s*([a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,})")
        .unwrap()
});

static RE_GENERIC_RECIPIENT_BODY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:to|recipient|undelivered[^:]*to)[:\s]+([a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,})")
        .unwrap()
});

static RE_RECEIVED_BODY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Received:\s+?(.*)").unwrap());

/// Keywords near which a bare UUID in the body is taken as the campaign's.
const CAMPAIGN_KEYWORDS: &[&str] = &["campaign", "x-listmonk-campaign", "lettermill"];

/// Ancillary metadata recorded with each bounce.
#[derive(Debug, Default, Serialize)]
struct BounceMeta {
    from: String,
    subject: String,
    message_id: String,
    delivered_to: String,
    received: Vec<String>,
    classify_reason: String,
}

/// Classify a bounce body as hard or soft.
///
/// Precedence: SMTP enhanced status code, then hard-bounce keywords, then
/// soft by default. The returned reason records what matched.
pub fn classify(body: &str) -> (BounceType, String) {
    for cap in RE_SMTP_STATUS.captures_iter(body) {
        let status = &cap[1];
        match status.as_bytes().first() {
            Some(b'5') => return (BounceType::Hard, format!("smtp_status={}", status)),
            Some(b'4') => return (BounceType::Soft, format!("smtp_status={}", status)),
            _ => {}
        }
    }

    if let Some(cap) = RE_HARD_BOUNCE.captures(body) {
        return (BounceType::Hard, format!("body_match={}", &cap[1]));
    }

    (BounceType::Soft, "default".to_string())
}

/// Whether a string is a well-formed UUID.
pub fn is_valid_uuid(s: &str) -> bool {
    !s.is_empty() && uuid::Uuid::parse_str(s).is_ok()
}

/// Parse one raw bounce message into a `Bounce`.
///
/// `bounce_mailbox` is the scanning mailbox's own address; it is never
/// accepted as the bounced recipient. `source` names the mailbox host the
/// message came from.
pub fn parse_bounce(raw: &[u8], bounce_mailbox: &str, source: &str) -> Result<Bounce> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| Error::Validation(format!("unparseable bounce message: {}", e)))?;

    let body = String::from_utf8_lossy(raw).into_owned();

    // DSNs typically carry the original message's headers in the last MIME
    // part; prefer those over the envelope wrapper's.
    let header_part = last_part(&parsed);

    let campaign_uuid = extract_uuid(
        header_part,
        HDR_CAMPAIGN_UUID,
        &RE_CAMPAIGN_UUID_BODY,
        &body,
        true,
    );
    let subscriber_uuid = extract_uuid(
        header_part,
        HDR_SUBSCRIBER_UUID,
        &RE_SUBSCRIBER_UUID_BODY,
        &body,
        false,
    );

    let email = extract_recipient(header_part, &body, bounce_mailbox);

    let delivered_to = header_value(header_part, "Delivered-To");
    let (bounce_type, classify_reason) = classify(&body);

    let mut received: Vec<String> = header_part
        .get_headers()
        .get_all_values("Received")
        .into_iter()
        .collect();
    if received.is_empty() {
        received = RE_RECEIVED_BODY
            .captures_iter(&body)
            .map(|c| c[1].trim().to_string())
            .collect();
    }

    let created_at = header_value(header_part, "Date")
        .and_then(|d| DateTime::parse_from_rfc2822(&d).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let meta = BounceMeta {
        from: header_value(header_part, "From").unwrap_or_default(),
        subject: header_value(header_part, "Subject").unwrap_or_default(),
        message_id: header_value(header_part, "Message-ID").unwrap_or_default(),
        delivered_to: delivered_to.clone().unwrap_or_default(),
        received,
        classify_reason,
    };

    Ok(Bounce {
        bounce_type,
        email,
        campaign_uuid,
        subscriber_uuid,
        source: source.to_string(),
        created_at,
        meta: serde_json::to_value(&meta).unwrap_or_default(),
    })
}

/// The last direct MIME part of a multipart message, the message itself
/// otherwise.
fn last_part<'a, 'b>(parsed: &'b ParsedMail<'a>) -> &'b ParsedMail<'a> {
    parsed.subparts.last().unwrap_or(parsed)
}

fn header_value(part: &ParsedMail<'_>, name: &str) -> Option<String> {
    part.get_headers()
        .get_first_value(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Extract a UUID: header first, then the labeled body regex, then (for the
/// campaign UUID only) any UUID near a campaign keyword. Malformed values
/// collapse to the empty string so record-time fallbacks can engage.
fn extract_uuid(
    part: &ParsedMail<'_>,
    header: &str,
    body_re: &Regex,
    body: &str,
    keyword_fallback: bool,
) -> String {
    let mut value = header_value(part, header).unwrap_or_default();

    if value.is_empty() || !is_valid_uuid(&value) {
        if let Some(cap) = body_re.captures(body) {
            value = cap[1].to_string();
        }
    }

    if keyword_fallback && !is_valid_uuid(&value) {
        if let Some(found) = uuid_near_keywords(body) {
            value = found;
        }
    }

    if is_valid_uuid(value.trim()) {
        value.trim().to_string()
    } else {
        String::new()
    }
}

/// Find a UUID within 200 characters of a campaign-related keyword.
fn uuid_near_keywords(body: &str) -> Option<String> {
    let lower = body.to_ascii_lowercase();

    for keyword in CAMPAIGN_KEYWORDS {
        let Some(idx) = lower.find(keyword) else {
            continue;
        };

        let start = idx.saturating_sub(100);
        let end = (idx + 200).min(lower.len());
        let Some(area) = lower.get(start..end) else {
            continue;
        };

        if let Some(m) = RE_UUID.find(area) {
            // Offsets in the lowercased body map 1:1 onto the original.
            if let Some(original) = body.get(start + m.start()..start + m.end()) {
                return Some(original.to_lowercase());
            }
        }
    }

    None
}

/// Extract the bounced recipient address, preferring DSN headers and
/// excluding the scanning mailbox itself at every step.
fn extract_recipient(part: &ParsedMail<'_>, body: &str, bounce_mailbox: &str) -> String {
    let mailbox = bounce_mailbox.to_lowercase();

    for header in ["Final-Recipient", "Original-Recipient"] {
        if let Some(v) = header_value(part, header) {
            let found = RE_RFC822_EMAIL
                .captures(&v)
                .or_else(|| RE_EMAIL.captures(&v))
                .map(|c| c[1].trim().to_lowercase());
            if let Some(email) = found {
                if email != mailbox {
                    return email;
                }
            }
        }
    }

    if let Some(v) = header_value(part, "Delivered-To") {
        let v = v.trim().to_lowercase();
        if !v.is_empty() && v != mailbox {
            return v;
        }
    }

    for re in [
        &*RE_FINAL_RECIPIENT_BODY,
        &*RE_ORIGINAL_RECIPIENT_BODY,
        &*RE_GENERIC_RECIPIENT_BODY,
    ] {
        for cap in re.captures_iter(body) {
            let candidate = cap[1].trim().to_lowercase();
            if candidate != mailbox {
                return candidate;
            }
        }
    }

    String::new()
}
