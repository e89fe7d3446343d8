//! HTTP implementations of the delivery collaborators.

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Serialize;
use url::Url;
use zeroize::Zeroizing;

use super::{DeliveryError, Document, Email, Mailer, Renderer};
use crate::config::{EmailConfig, RenderConfig, SettingsSource};
use crate::report::ReportRequest;

const TOKEN_HEADER: &str = "X-Postmark-Server-Token";
const DEFAULT_CONTENT_TYPE: &str = "application/pdf";

/// Parse a base URL so that `join` appends to its path instead of
/// replacing the last segment.
fn base_url(raw: &str) -> anyhow::Result<Url> {
    let mut raw = raw.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).with_context(|| format!("Invalid base URL '{}'", raw))
}

/// Fetches PDFs from the report site's render endpoint.
#[derive(Debug)]
pub struct HttpRenderer {
    client: Client,
    base_url: Option<Url>,
}

impl HttpRenderer {
    pub fn new(config: &RenderConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to build http client")?;
        let base_url = config.base_url.as_deref().map(base_url).transpose()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, request: &ReportRequest) -> Result<Url, DeliveryError> {
        let base = self
            .base_url
            .as_ref()
            .ok_or_else(|| DeliveryError::Render("no render service configured".into()))?;
        let mut url = base
            .join(&format!("reports/{}/pdf", request.report_id))
            .map_err(|e| DeliveryError::Render(e.to_string()))?;

        let query = request.query_string();
        if !query.is_empty() {
            url.set_query(Some(&query));
        }
        Ok(url)
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    fn is_available(&self) -> bool {
        self.base_url.is_some()
    }

    async fn render(&self, request: &ReportRequest) -> Result<Document, DeliveryError> {
        let url = self.endpoint(request)?;
        tracing::debug!(%url, "Requesting report render");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DeliveryError::Render(e.to_string()))?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DeliveryError::Render(e.to_string()))?;

        if bytes.is_empty() {
            return Err(DeliveryError::Render("render service returned an empty document".into()));
        }

        Ok(Document {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// Sends mail through a Postmark-style JSON API.
pub struct HttpMailer {
    client: Client,
    send_url: Url,
    auth_token: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for HttpMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMailer")
            .field("send_url", &self.send_url.as_str())
            .field("auth_token", &self.auth_token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl HttpMailer {
    /// The API token is looked up under `config.auth_token_setting`.
    pub fn new(config: &EmailConfig, settings: &dyn SettingsSource) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to build http client")?;
        let send_url = base_url(&config.api_base_url)?
            .join("email")
            .context("Failed to create send email endpoint URL")?;
        let auth_token = settings
            .lookup(&config.auth_token_setting)
            .filter(|t| !t.is_empty())
            .map(Zeroizing::new);

        Ok(Self {
            client,
            send_url,
            auth_token,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html_body: &'a str,
    text_body: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<AttachmentBody<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AttachmentBody<'a> {
    name: &'a str,
    content: String,
    content_type: &'a str,
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: &Email) -> Result<(), DeliveryError> {
        let body = SendEmailRequest {
            from: &email.sender,
            to: &email.recipient,
            subject: &email.subject,
            html_body: &email.html_body,
            text_body: &email.text_body,
            attachments: email
                .attachment
                .iter()
                .map(|a| AttachmentBody {
                    name: &a.name,
                    content: BASE64.encode(&a.bytes),
                    content_type: &a.content_type,
                })
                .collect(),
        };

        let mut request = self.client.post(self.send_url.clone()).json(&body);
        if let Some(token) = &self.auth_token {
            request = request.header(TOKEN_HEADER, token.as_str());
        }

        request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DeliveryError::Send(e.to_string()))?;
        Ok(())
    }
}
