//! Mail senders
//!
//! The system sends short notifications (startup, restarts) through a
//! `MailSender`. Only the `log` sender is built in; it writes the mail
//! through tracing instead of a mail transport.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::config::MailConfig;

/// Mails a `LogMailSender` keeps for inspection
pub const KEPT_MAILS: usize = 32;

#[derive(Debug, Clone, thiserror::Error)]
pub enum MailError {
    #[error("Mail sender {0} is disconnected")]
    Disconnected(String),

    #[error("Mail sender {0} has no recipients")]
    NoRecipients(String),
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<(), MailError>;

    async fn disconnect(&self);
}

/// A mail that went through a `LogMailSender`
#[derive(Debug, Clone, PartialEq)]
pub struct SentMail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

pub struct LogMailSender {
    id: String,
    to: Vec<String>,
    state: Mutex<LogState>,
}

#[derive(Default)]
struct LogState {
    disconnected: bool,
    sent: VecDeque<SentMail>,
}

impl LogMailSender {
    pub fn new(id: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            id: id.into(),
            to,
            state: Mutex::new(LogState::default()),
        }
    }

    pub fn from_config(id: &str, config: &MailConfig) -> Self {
        match config {
            MailConfig::Log { to } => Self::new(id, to.clone()),
        }
    }

    /// The most recent mails, oldest first
    pub fn sent(&self) -> Vec<SentMail> {
        self.state.lock().sent.iter().cloned().collect()
    }
}

#[async_trait]
impl MailSender for LogMailSender {
    async fn send(&self, subject: &str, body: &str) -> Result<(), MailError> {
        if self.to.is_empty() {
            return Err(MailError::NoRecipients(self.id.clone()));
        }
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(MailError::Disconnected(self.id.clone()));
        }
        info!(sender = %self.id, to = ?self.to, subject, body, "Mail");
        if state.sent.len() == KEPT_MAILS {
            state.sent.pop_front();
        }
        state.sent.push_back(SentMail {
            to: self.to.clone(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_sender() {
        let config: MailConfig =
            serde_json::from_value(serde_json::json!({ "type": "log", "to": ["ops@example.org"] }))
                .unwrap();
        let sender = LogMailSender::from_config("ops", &config);

        sender.send("Castle started", "all good").await.unwrap();
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(sender.sent()[0].to, vec!["ops@example.org"]);

        sender.disconnect().await;
        assert!(matches!(
            sender.send("again", "").await,
            Err(MailError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_keeps_only_recent_mails() {
        let sender = LogMailSender::new("ops", vec!["ops@example.org".into()]);
        for i in 0..KEPT_MAILS + 3 {
            sender.send(&format!("mail {i}"), "").await.unwrap();
        }
        let sent = sender.sent();
        assert_eq!(sent.len(), KEPT_MAILS);
        assert_eq!(sent[0].subject, "mail 3");
        assert_eq!(sent[KEPT_MAILS - 1].subject, format!("mail {}", KEPT_MAILS + 2));
    }

    #[tokio::test]
    async fn test_no_recipients() {
        let sender = LogMailSender::new("nobody", vec![]);
        assert!(matches!(
            sender.send("x", "y").await,
            Err(MailError::NoRecipients(_))
        ));
    }
}
