//! Building the snapshot email for one subscription delivery.

use std::sync::OnceLock;

use askama::Template;
use regex::Regex;

use super::{Attachment, DeliveryError, Document, Email};
use crate::report::Report;
use crate::scheduler::Subscription;

const SUBJECT_PREFIX: &str = "Scheduled Report - ";

#[derive(Template)]
#[template(path = "email/report_snapshot.html")]
struct SnapshotHtml<'a> {
    title: &'a str,
    url: &'a str,
    extra: &'a str,
}

#[derive(Template)]
#[template(path = "email/report_snapshot.txt")]
struct SnapshotText<'a> {
    title: &'a str,
    url: &'a str,
    extra: &'a str,
}

fn strip_tags(html: &str) -> String {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    let re = TAGS.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex"));
    re.replace_all(html, "").into_owned()
}

/// Compose the email carrying `document` for `sub`.
///
/// `email_body_extra` is operator-authored HTML and is included verbatim
/// in the HTML part; the text part gets it with tags removed. Without a
/// configured sender the message is sent from the recipient's address.
pub fn compose_snapshot(
    report: &Report,
    sub: &Subscription,
    base_url: &str,
    sender: Option<&str>,
    document: Document,
) -> Result<Email, DeliveryError> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), report.absolute_path());

    let subject = match sub.email_subject.trim() {
        "" => report.title.as_str(),
        s => s,
    };

    let html_body = SnapshotHtml {
        title: &report.title,
        url: &url,
        extra: &sub.email_body_extra,
    }
    .render()
    .map_err(|e| DeliveryError::Compose(e.to_string()))?;

    let extra_text = strip_tags(&sub.email_body_extra);
    let text_body = SnapshotText {
        title: &report.title,
        url: &url,
        extra: &extra_text,
    }
    .render()
    .map_err(|e| DeliveryError::Compose(e.to_string()))?;

    let recipient = sub.recipient.to_string();
    let sender = sender
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| recipient.clone());

    Ok(Email {
        sender,
        recipient,
        subject: format!("{}{}", SUBJECT_PREFIX, subject),
        html_body,
        text_body,
        attachment: Some(Attachment {
            name: format!("{}.pdf", report.filename()),
            content_type: document.content_type,
            bytes: document.bytes,
        }),
    })
}
