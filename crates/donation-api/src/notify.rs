use async_trait::async_trait;
use donation_core::DonationRecord;

use crate::config::NotifyConfig;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// A composed "new donation" message, ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    #[must_use]
    pub fn for_donation(record: &DonationRecord, config: &NotifyConfig) -> Self {
        let body = format!(
            "New donation received:\n\n\
             Name: {}\nEmail: {}\nUSD: ${}\nCrypto: {}\nNetwork: {}\nAddress: {}\nTime: {}\n",
            record.name,
            record.email,
            record.usd_amount,
            record.crypto_amount,
            record.network,
            record.address,
            record.timestamp,
        );

        Self {
            to: config.to.clone(),
            from: config.from.clone(),
            subject: config.subject.clone(),
            body,
        }
    }
}

/// Delivery seam for the post-save notification.
#[async_trait]
pub trait DonationNotifier: Send + Sync {
    /// # Errors
    /// Returns [`NotifyError`] when the notification could not be handed off.
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Hands notifications to the log stream; an external mailer tails it.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl DonationNotifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        tracing::info!(
            target: "donation_notify",
            to = %notification.to,
            from = %notification.from,
            subject = %notification.subject,
            "donation notification"
        );
        // The body carries the donor's e-mail.
        tracing::debug!(target: "donation_notify", body = %notification.body, "donation notification body");
        Ok(())
    }
}
