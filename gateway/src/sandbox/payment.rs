use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcome {
    pub id: String,
    pub status: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_checkout_session(
        &self,
        amount_cents: i64,
        currency: &str,
    ) -> anyhow::Result<CheckoutSession>;

    async fn confirm_payment(&self, checkout_id: &str) -> anyhow::Result<PaymentOutcome>;

    async fn refund_payment(&self, payment_id: &str) -> anyhow::Result<PaymentOutcome>;
}

/// Always succeeds with synthetic ids; no outbound network, ever.
pub struct MockPaymentProvider;

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn create_checkout_session(
        &self,
        amount_cents: i64,
        currency: &str,
    ) -> anyhow::Result<CheckoutSession> {
        let id = format!("mock_checkout_{}", uuid::Uuid::new_v4());
        debug!("mock checkout session {id} for {amount_cents} {currency}");
        Ok(CheckoutSession {
            url: format!("https://payments.preview.invalid/checkout/{id}"),
            id,
        })
    }

    async fn confirm_payment(&self, checkout_id: &str) -> anyhow::Result<PaymentOutcome> {
        debug!("mock confirm for {checkout_id}");
        Ok(PaymentOutcome {
            id: format!("mock_payment_{}", uuid::Uuid::new_v4()),
            status: "succeeded".to_owned(),
        })
    }

    async fn refund_payment(&self, payment_id: &str) -> anyhow::Result<PaymentOutcome> {
        debug!("mock refund for {payment_id}");
        Ok(PaymentOutcome {
            id: format!("mock_refund_{}", uuid::Uuid::new_v4()),
            status: "refunded".to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkout_flow_yields_synthetic_ids() {
        let provider = MockPaymentProvider;
        let checkout = provider.create_checkout_session(2450, "USD").await.unwrap();
        assert!(checkout.id.starts_with("mock_checkout_"));
        assert!(checkout.url.contains(&checkout.id));

        let payment = provider.confirm_payment(&checkout.id).await.unwrap();
        assert_eq!(payment.status, "succeeded");

        let refund = provider.refund_payment(&payment.id).await.unwrap();
        assert_eq!(refund.status, "refunded");
        assert!(refund.id.starts_with("mock_refund_"));
    }
}
