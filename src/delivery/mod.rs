//! Collaborators that turn a resolved report request into a sent email:
//! a [`Renderer`] producing the document and a [`Mailer`] delivering it.

pub mod compose;
pub mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::report::ReportRequest;

pub use self::compose::compose_snapshot;
pub use self::http::{HttpMailer, HttpRenderer};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("render failed: {0}")]
    Render(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("could not compose email: {0}")]
    Compose(String),
}

/// A rendered report.
#[derive(Debug, Clone)]
pub struct Document {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// A fully composed outgoing message.
#[derive(Debug, Clone)]
pub struct Email {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub attachment: Option<Attachment>,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Whether a render backend is configured at all.
    fn is_available(&self) -> bool;

    async fn render(&self, request: &ReportRequest) -> Result<Document, DeliveryError>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), DeliveryError>;
}
