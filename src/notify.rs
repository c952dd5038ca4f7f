//! Outbound notifications. Delivery never blocks or fails a request:
//! `dispatch` hands the message to a background task and only logs failures.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    EmailVerification,
    PasswordReset,
    ReviewerInvite,
    ApplicationSubmitted,
    ReviewerAssigned,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::EmailVerification => "email-verification",
            NotificationKind::PasswordReset => "password-reset",
            NotificationKind::ReviewerInvite => "reviewer-invite",
            NotificationKind::ApplicationSubmitted => "application-submitted",
            NotificationKind::ReviewerAssigned => "reviewer-assigned",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn send(&self, notification: Notification) -> Result<()>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: Notification) -> Result<()> {
        info!(
            kind = notification.kind.as_str(),
            recipient = %notification.recipient,
            subject = %notification.subject,
            body = %notification.body,
            "notification"
        );
        Ok(())
    }
}

pub fn dispatch(notifier: &Arc<dyn Notifier>, notification: Notification) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        let kind = notification.kind.as_str();
        let recipient = notification.recipient.clone();
        if let Err(err) = notifier.send(notification).await {
            warn!(kind, %recipient, error = %err, "failed to deliver notification");
        }
    });
}

pub fn verification_email(recipient: &str, base_url: &str, token: &str) -> Notification {
    Notification {
        kind: NotificationKind::EmailVerification,
        recipient: recipient.to_string(),
        subject: "Confirm your email address".into(),
        body: format!("Confirm your account: {base_url}/verify-email/{token}"),
    }
}

pub fn password_reset_email(recipient: &str, base_url: &str, token: &str) -> Notification {
    Notification {
        kind: NotificationKind::PasswordReset,
        recipient: recipient.to_string(),
        subject: "Password reset requested".into(),
        body: format!("Choose a new password: {base_url}/reset-password?token={token}"),
    }
}

pub fn reviewer_invite_email(
    recipient: &str,
    base_url: &str,
    call_title: &str,
    token: &str,
) -> Notification {
    Notification {
        kind: NotificationKind::ReviewerInvite,
        recipient: recipient.to_string(),
        subject: format!("Invitation to review \"{call_title}\""),
        body: format!(
            "You have been invited to review applications for \"{call_title}\". \
             Accept with code {token} at {base_url}/reviewer/invites"
        ),
    }
}

pub fn application_submitted_email(recipient: &str, call_title: &str) -> Notification {
    Notification {
        kind: NotificationKind::ApplicationSubmitted,
        recipient: recipient.to_string(),
        subject: "Application received".into(),
        body: format!("Your application to \"{call_title}\" has been submitted."),
    }
}

pub fn reviewer_assigned_email(recipient: &str, base_url: &str, call_title: &str) -> Notification {
    Notification {
        kind: NotificationKind::ReviewerAssigned,
        recipient: recipient.to_string(),
        subject: "New application to review".into(),
        body: format!(
            "An application for \"{call_title}\" was assigned to you: {base_url}/reviewer"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn send(&self, _notification: Notification) -> Result<()> {
            anyhow::bail!("smtp unreachable")
        }
    }

    struct Channel(mpsc::UnboundedSender<Notification>);

    #[async_trait]
    impl Notifier for Channel {
        async fn send(&self, notification: Notification) -> Result<()> {
            self.0.send(notification)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_delivers_in_background() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier: Arc<dyn Notifier> = Arc::new(Channel(tx));

        dispatch(&notifier, verification_email("a@example.org", "http://app", "tok"));

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.kind, NotificationKind::EmailVerification);
        assert!(received.body.ends_with("/verify-email/tok"));
    }

    #[tokio::test]
    async fn dispatch_swallows_delivery_failures() {
        let notifier: Arc<dyn Notifier> = Arc::new(Failing);
        dispatch(&notifier, password_reset_email("a@example.org", "http://app", "tok"));
        tokio::task::yield_now().await;
    }
}
