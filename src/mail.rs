//! Outbound mail seam. The real transport (SMTP relay, provider API) lives
//! outside this crate; the core only needs fire-and-forget delivery with a
//! logged failure path.

use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail transport unavailable: {0}")]
    Transport(String),
    #[error("recipient address rejected: {0}")]
    Recipient(String),
}

pub trait MailTransport: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

/// Production default when no relay is configured: logs the delivery at
/// info level. The envelope sender and reply-to come from configuration.
pub struct LogMailer {
    pub from: String,
    pub reply_to: Option<String>,
}

impl LogMailer {
    pub fn new(from: &str, reply_to: Option<&str>) -> Self {
        Self {
            from: from.to_string(),
            reply_to: reply_to.filter(|r| !r.is_empty()).map(str::to_string),
        }
    }
}

impl MailTransport for LogMailer {
    fn send(&self, to: &str, subject: &str, _body: &str) -> Result<(), MailError> {
        info!(
            "Mail with subject '{}' successfully sent to '{}' (from '{}', reply-to {:?})",
            subject, to, self.from, self.reply_to
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Recording transport for tests. `failing()` builds one whose sends all
/// error, to exercise the fire-and-forget path.
#[derive(Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<MailMessage>>,
    fail: bool,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().clone()
    }
}

impl MailTransport for MemoryMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        if self.fail {
            return Err(MailError::Transport("simulated outage".into()));
        }
        self.sent.lock().push(MailMessage {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}
