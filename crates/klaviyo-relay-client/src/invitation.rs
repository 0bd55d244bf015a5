//! Account invitation handling.
//!
//! An invitation email names the inviting brand in its subject and carries a
//! one-time acceptance link in its body. Accepting means following that link
//! with the relay's logged-in session.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::client::RelayClient;
use crate::error::Result;
use crate::types::ForwardRequest;

static SUBJECT_BRAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bjoin\s+(.+?)(?:'s|’s)?\s+(?:on\s+klaviyo|klaviyo\s+account)")
        .expect("Invalid subject regex")
});

static INVITATION_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)https://(?:[a-z0-9-]+\.)*klaviyo\.com/[^\s"'<>)]*invit[^\s"'<>)]*"#)
        .expect("Invalid invitation link regex")
});

/// A received invitation, ready to accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitationEvent {
    pub from: String,
    pub subject: String,
    /// Inviting brand, when the subject names one.
    pub brand: Option<String>,
    pub link: String,
    /// Mailbox the invitation was addressed to.
    pub target_email: String,
}

impl InvitationEvent {
    /// Extract an invitation from an email. `None` without an invitation link.
    pub fn from_message(from: &str, subject: &str, body: &str, target_email: &str) -> Option<Self> {
        let link = INVITATION_LINK
            .find(body)?
            .as_str()
            .replace("&amp;", "&");

        let brand = SUBJECT_BRAND
            .captures(subject)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|b| !b.is_empty());

        Some(Self {
            from: from.trim().to_string(),
            subject: subject.trim().to_string(),
            brand,
            link,
            target_email: target_email.trim().to_string(),
        })
    }
}

/// Result of following an invitation link.
#[derive(Debug, Clone, Serialize)]
pub struct InvitationOutcome {
    pub brand: Option<String>,
    pub status: u16,
    pub accepted: bool,
}

/// Follow `event`'s link through the relay.
pub async fn accept_invitation(
    client: &RelayClient,
    event: &InvitationEvent,
) -> Result<InvitationOutcome> {
    let response = client.forward(&ForwardRequest::get(&event.link)).await?;
    let accepted = response.is_success();

    if accepted {
        tracing::info!(
            brand = ?event.brand,
            target = %event.target_email,
            status = response.status,
            "Invitation accepted"
        );
    } else {
        tracing::warn!(
            brand = ?event.brand,
            target = %event.target_email,
            status = response.status,
            body = %response.text().chars().take(200).collect::<String>(),
            "Invitation link rejected"
        );
    }

    Ok(InvitationOutcome {
        brand: event.brand.clone(),
        status: response.status,
        accepted,
    })
}
