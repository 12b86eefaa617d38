//! Campaign message rendering and personalization.
//!
//! Templates use `{{placeholder}}` substitution: subscriber fields, opaque
//! attributes, the unsubscribe URL and the `{{track_view}}` tracking pixel.
//! Visual-editor campaigns have no template directives in their HTML, so the
//! pixel is injected after rendering when the body lacks the helper.

use crate::messenger::Message;
use lettermill_common::{Error, Result};
use lettermill_storage::models::{Campaign, ContentType, Subscriber};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Header carrying the campaign UUID on outgoing mail and bounces.
pub const HDR_CAMPAIGN_UUID: &str = "X-Listmonk-Campaign";
/// Header carrying the subscriber UUID on outgoing mail and bounces.
pub const HDR_SUBSCRIBER_UUID: &str = "X-Listmonk-Subscriber";

static RE_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{[^}]+\}\}").unwrap());

/// Renders campaign templates for individual subscribers.
pub struct Renderer {
    root_url: String,
}

impl Renderer {
    pub fn new(root_url: impl Into<String>) -> Self {
        Self {
            root_url: root_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Render a template body for one subscriber.
    pub fn render(&self, template: &str, campaign: &Campaign, subscriber: &Subscriber) -> String {
        let mut result = self.substitute(template, campaign, subscriber);

        // Visual-editor bodies carry no template directives; inject the
        // tracking pixel post-render when the raw body lacks the helper.
        if campaign.content_type() == ContentType::Visual
            && !template.contains("{{track_view}}")
        {
            result = inject_tracking_pixel(&result, &self.track_pixel(campaign, subscriber));
        }

        self.sweep_leftovers(&result)
    }

    /// Render a subject line for one subscriber.
    pub fn render_subject(
        &self,
        subject: &str,
        campaign: &Campaign,
        subscriber: &Subscriber,
    ) -> String {
        self.sweep_leftovers(&self.substitute(subject, campaign, subscriber))
    }

    fn substitute(&self, template: &str, campaign: &Campaign, subscriber: &Subscriber) -> String {
        let mut result = template.to_string();

        result = result.replace("{{email}}", &subscriber.email);
        result = result.replace("{{name}}", &subscriber.name);

        let parts: Vec<&str> = subscriber.name.split_whitespace().collect();
        let first_name = parts.first().copied().unwrap_or("");
        let last_name = if parts.len() > 1 {
            parts[1..].join(" ")
        } else {
            String::new()
        };
        result = result.replace("{{first_name}}", first_name);
        result = result.replace("{{last_name}}", &last_name);

        if let Some(attrs) = subscriber.attribs.as_object() {
            for (key, value) in attrs {
                let placeholder = format!("{{{{attributes.{}}}}}", key);
                let value_str = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => value.to_string(),
                };
                result = result.replace(&placeholder, &value_str);
            }
        }

        result = result.replace(
            "{{unsubscribe_url}}",
            &self.unsubscribe_url(campaign, subscriber),
        );
        result = result.replace("{{track_view}}", &self.track_pixel(campaign, subscriber));

        result
    }

    fn sweep_leftovers(&self, content: &str) -> String {
        RE_PLACEHOLDER.replace_all(content, "").to_string()
    }

    /// Public URL that records an unsubscribe for this (campaign, subscriber).
    pub fn unsubscribe_url(&self, campaign: &Campaign, subscriber: &Subscriber) -> String {
        format!(
            "{}/subscription/{}/{}",
            self.root_url, campaign.uuid, subscriber.uuid
        )
    }

    /// 1x1 pixel markup whose fetch records the open event.
    fn track_pixel(&self, campaign: &Campaign, subscriber: &Subscriber) -> String {
        format!(
            r#"<img src="{}/campaign/{}/{}/px.png" alt="" width="1" height="1" />"#,
            self.root_url, campaign.uuid, subscriber.uuid
        )
    }
}

/// Insert pixel markup just before `</body>`, appending when the document
/// has no body close tag.
fn inject_tracking_pixel(html: &str, pixel: &str) -> String {
    match html.to_ascii_lowercase().rfind("</body>") {
        Some(idx) => {
            let mut out = String::with_capacity(html.len() + pixel.len());
            out.push_str(&html[..idx]);
            out.push_str(pixel);
            out.push_str(&html[idx..]);
            out
        }
        None => {
            let mut out = html.to_string();
            out.push_str(pixel);
            out
        }
    }
}

/// Render the full outgoing message for one subscriber.
///
/// `default_from` is used when the campaign doesn't carry its own From.
pub fn render_message(
    renderer: &Renderer,
    campaign: &Campaign,
    subscriber: &Subscriber,
    default_from: &str,
) -> Result<Message> {
    if !subscriber.email.contains('@') {
        return Err(Error::Template(format!(
            "invalid subscriber email '{}'",
            subscriber.email
        )));
    }

    let subject = renderer.render_subject(&campaign.subject, campaign, subscriber);
    let body = renderer.render(&campaign.body, campaign, subscriber);

    let from = campaign
        .from_email
        .clone()
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| default_from.to_string());

    let headers = vec![
        (HDR_CAMPAIGN_UUID.to_string(), campaign.uuid.to_string()),
        (HDR_SUBSCRIBER_UUID.to_string(), subscriber.uuid.to_string()),
        (
            "List-Unsubscribe".to_string(),
            format!("<{}>", renderer.unsubscribe_url(campaign, subscriber)),
        ),
        (
            "List-Unsubscribe-Post".to_string(),
            "List-Unsubscribe=One-Click".to_string(),
        ),
    ];

    Ok(Message {
        from,
        to: vec![subscriber.email.clone()],
        subject,
        body: body.into_bytes(),
        content_type: campaign.content_type(),
        headers,
    })
}
