use super::{
    parse_event, signature, CheckoutLineItem, CheckoutSession, CreateCheckoutSessionRequest,
    StripeEvent, StripeService, StripeServiceError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use time::OffsetDateTime;

pub struct LiveStripeService {
    client: stripe::Client,
    webhook_secret: String,
    tolerance_secs: i64,
}

impl LiveStripeService {
    pub fn new(
        secret_key: impl Into<String>,
        webhook_secret: impl Into<String>,
        tolerance_secs: i64,
    ) -> Self {
        let client = stripe::Client::new(secret_key);
        Self {
            client,
            webhook_secret: webhook_secret.into(),
            tolerance_secs,
        }
    }

    pub fn from_settings(settings: &crate::config::StripeSettings) -> Self {
        Self::new(
            settings.secret_key.clone(),
            settings.webhook_secret.clone(),
            settings.webhook_tolerance_secs,
        )
    }
}

fn map_line_items(items: &[CheckoutLineItem]) -> Vec<stripe::CreateCheckoutSessionLineItems> {
    items
        .iter()
        .map(|li| stripe::CreateCheckoutSessionLineItems {
            price: Some(li.price.clone()),
            quantity: Some(li.quantity),
            ..Default::default()
        })
        .collect()
}

#[async_trait]
impl StripeService for LiveStripeService {
    async fn create_checkout_session(
        &self,
        req: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, StripeServiceError> {
        let metadata: HashMap<String, String> = req.metadata.clone().into_iter().collect();

        let mut params = stripe::CreateCheckoutSession::new();
        params.mode = Some(stripe::CheckoutSessionMode::Payment);
        params.success_url = Some(&req.success_url);
        params.cancel_url = Some(&req.cancel_url);
        params.client_reference_id = req.client_reference_id.as_deref();
        params.customer_email = req.customer_email.as_deref();
        params.metadata = Some(metadata.clone());
        params.payment_intent_data = Some(stripe::CreateCheckoutSessionPaymentIntentData {
            metadata: Some(metadata),
            ..Default::default()
        });
        if !req.line_items.is_empty() {
            params.line_items = Some(map_line_items(&req.line_items));
        }

        let session = stripe::CheckoutSession::create(&self.client, params).await?;
        Ok(CheckoutSession {
            id: session.id.to_string(),
            url: session.url.clone(),
        })
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<StripeEvent, StripeServiceError> {
        signature::verify_signature(
            payload,
            signature_header,
            &self.webhook_secret,
            self.tolerance_secs,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;
        parse_event(payload)
    }
}
