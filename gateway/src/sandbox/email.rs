use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use preview_api::models::RecordedEmail;
use std::collections::HashMap;
use tracing::debug;
use utils::token::SessionToken;

#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Deliver (or pretend to deliver) one email, returning the
    /// provider's message id. When a session token is given the message
    /// becomes inspectable for that session.
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        token: Option<&SessionToken>,
    ) -> anyhow::Result<String>;

    async fn send_welcome_email(&self, to: &str) -> anyhow::Result<String>;
    async fn send_password_reset_email(&self, to: &str) -> anyhow::Result<String>;
    async fn send_verification_email(&self, to: &str) -> anyhow::Result<String>;
    async fn send_password_changed_email(&self, to: &str) -> anyhow::Result<String>;
}

fn synthetic_id() -> String {
    format!("mock_email_{}", uuid::Uuid::new_v4())
}

/// Records messages per session instead of sending anything.
///
/// Appends take the store lock, so concurrent handlers for the same
/// session never lose entries.
#[derive(Default)]
pub struct MockEmailProvider {
    recorded: Mutex<HashMap<SessionToken, Vec<RecordedEmail>>>,
}

impl MockEmailProvider {
    /// Messages recorded for one session, oldest first.
    pub fn recorded_for(&self, token: &SessionToken) -> Vec<RecordedEmail> {
        self.recorded
            .lock()
            .get(token)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_for(&self, token: &SessionToken) -> usize {
        self.recorded
            .lock()
            .remove(token)
            .map(|msgs| msgs.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EmailProvider for MockEmailProvider {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        token: Option<&SessionToken>,
    ) -> anyhow::Result<String> {
        let id = synthetic_id();
        debug!("mock email {id} to {to}: {subject}");
        if let Some(token) = token {
            let email = RecordedEmail {
                id: id.clone(),
                to: to.to_owned(),
                subject: subject.to_owned(),
                body: body.to_owned(),
                sent_at: Utc::now(),
            };
            self.recorded
                .lock()
                .entry(token.clone())
                .or_default()
                .push(email);
        }
        Ok(id)
    }

    // Template sends return synthetic ids without recording; they fire
    // from auth flows that have no session context to attach to.
    async fn send_welcome_email(&self, to: &str) -> anyhow::Result<String> {
        debug!("mock welcome email to {to}");
        Ok(synthetic_id())
    }

    async fn send_password_reset_email(&self, to: &str) -> anyhow::Result<String> {
        debug!("mock password reset email to {to}");
        Ok(synthetic_id())
    }

    async fn send_verification_email(&self, to: &str) -> anyhow::Result<String> {
        debug!("mock verification email to {to}");
        Ok(synthetic_id())
    }

    async fn send_password_changed_email(&self, to: &str) -> anyhow::Result<String> {
        debug!("mock password changed email to {to}");
        Ok(synthetic_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorded_per_token() {
        let provider = MockEmailProvider::default();
        let token_a = SessionToken::generate();
        let token_b = SessionToken::generate();

        let id = provider
            .send_email("user@example.com", "Hi", "hello", Some(&token_a))
            .await
            .unwrap();
        assert!(id.starts_with("mock_email_"));
        provider
            .send_email("user@example.com", "Yo", "again", Some(&token_a))
            .await
            .unwrap();
        provider
            .send_email("other@example.com", "Hey", "other", Some(&token_b))
            .await
            .unwrap();

        let a = provider.recorded_for(&token_a);
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].subject, "Hi");
        assert_eq!(provider.recorded_for(&token_b).len(), 1);

        assert_eq!(provider.clear_for(&token_a), 2);
        assert!(provider.recorded_for(&token_a).is_empty());
    }

    #[tokio::test]
    async fn tokenless_and_template_sends_are_not_recorded() {
        let provider = MockEmailProvider::default();
        let token = SessionToken::generate();
        provider
            .send_email("user@example.com", "Hi", "hello", None)
            .await
            .unwrap();
        provider.send_welcome_email("user@example.com").await.unwrap();
        assert!(provider.recorded_for(&token).is_empty());
    }

    #[tokio::test]
    async fn concurrent_appends_do_not_lose_entries() {
        let provider = std::sync::Arc::new(MockEmailProvider::default());
        let token = SessionToken::generate();
        let mut handles = Vec::new();
        for i in 0..32 {
            let provider = provider.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                provider
                    .send_email("user@example.com", &format!("msg {i}"), "x", Some(&token))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(provider.recorded_for(&token).len(), 32);
    }
}
