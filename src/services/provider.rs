use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifiers returned by the provider when it accepts an outbound
/// payment request. `checkout_request_id` is the correlation id later
/// echoed in the asynchronous callback.
#[derive(Debug, Clone)]
pub struct ProviderReference {
    pub checkout_request_id: String,
    pub merchant_request_id: Option<String>,
    pub customer_message: Option<String>,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn send_payment_request(
        &self,
        amount: Decimal,
        currency: &str,
        phone: &str,
        account_reference: &str,
        callback_url: &str,
    ) -> Result<ProviderReference>;
}

/// Acknowledgment body the provider's webhook contract expects. Returned
/// for every structurally valid callback so the provider stops
/// redelivering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StkAcknowledgment {
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl StkAcknowledgment {
    pub fn accepted() -> Self {
        StkAcknowledgment {
            result_code: 0,
            result_desc: "Accepted".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DarajaSettings {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub short_code: String,
    pub passkey: String,
}

impl DarajaSettings {
    /// Reads provider credentials once at startup. Components receive the
    /// resulting settings struct; nothing below this reads process state.
    pub fn from_env() -> Option<Self> {
        Some(DarajaSettings {
            base_url: std::env::var("DARAJA_BASE_URL")
                .unwrap_or_else(|_| "https://sandbox.safaricom.co.ke".to_string()),
            consumer_key: std::env::var("DARAJA_CONSUMER_KEY").ok()?,
            consumer_secret: std::env::var("DARAJA_CONSUMER_SECRET").ok()?,
            short_code: std::env::var("DARAJA_SHORT_CODE").ok()?,
            passkey: std::env::var("DARAJA_PASSKEY").ok()?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID", default)]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID", default)]
    checkout_request_id: Option<String>,
    #[serde(rename = "ResponseCode", default)]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription", default)]
    response_description: Option<String>,
    #[serde(rename = "CustomerMessage", default)]
    customer_message: Option<String>,
}

/// STK-Push client for the Safaricom Daraja API: OAuth client-credentials
/// token, then a push request whose prompt lands on the payer's handset.
pub struct DarajaClient {
    http: reqwest::Client,
    settings: DarajaSettings,
}

impl DarajaClient {
    pub fn new(settings: DarajaSettings) -> Self {
        DarajaClient {
            http: reqwest::Client::new(),
            settings,
        }
    }

    async fn fetch_token(&self) -> Result<String> {
        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.settings.base_url
        );
        let response = self
            .http
            .get(&url)
            .basic_auth(
                &self.settings.consumer_key,
                Some(&self.settings.consumer_secret),
            )
            .send()
            .await?
            .error_for_status()?;
        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    fn password(&self, timestamp: &str) -> String {
        BASE64.encode(format!(
            "{}{}{}",
            self.settings.short_code, self.settings.passkey, timestamp
        ))
    }
}

#[async_trait]
impl PaymentProvider for DarajaClient {
    async fn send_payment_request(
        &self,
        amount: Decimal,
        currency: &str,
        phone: &str,
        account_reference: &str,
        callback_url: &str,
    ) -> Result<ProviderReference> {
        if currency != "KES" {
            return Err(PaymentError::InvalidRequest(format!(
                "provider only settles KES, got {}",
                currency
            )));
        }
        // Daraja takes whole shillings.
        let whole_amount = amount
            .round_dp(0)
            .to_i64()
            .ok_or_else(|| {
                PaymentError::InvalidRequest(format!("amount {} not representable", amount))
            })?;

        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let token = self.fetch_token().await?;
        let body = serde_json::json!({
            "BusinessShortCode": self.settings.short_code,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": whole_amount,
            "PartyA": phone,
            "PartyB": self.settings.short_code,
            "PhoneNumber": phone,
            "CallBackURL": callback_url,
            "AccountReference": account_reference,
            "TransactionDesc": format!("Payment for order {}", account_reference),
        });

        let url = format!(
            "{}/mpesa/stkpush/v1/processrequest",
            self.settings.base_url
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let raw: serde_json::Value = response.json().await?;
        let parsed: StkPushResponse = serde_json::from_value(raw.clone())
            .map_err(|e| PaymentError::ProviderUnavailable(e.to_string()))?;

        match parsed.response_code.as_deref() {
            Some("0") => {}
            other => {
                return Err(PaymentError::ProviderUnavailable(format!(
                    "push rejected: code={:?} desc={:?}",
                    other, parsed.response_description
                )))
            }
        }

        let checkout_request_id = parsed.checkout_request_id.ok_or_else(|| {
            PaymentError::ProviderUnavailable("accepted push missing CheckoutRequestID".to_string())
        })?;

        Ok(ProviderReference {
            checkout_request_id,
            merchant_request_id: parsed.merchant_request_id,
            customer_message: parsed.customer_message,
            raw,
        })
    }
}

/// Deterministic in-process provider for tests and local development:
/// accepts every request and hands out sequential checkout ids.
pub struct StaticProvider {
    counter: AtomicU64,
    failure: Option<String>,
}

impl StaticProvider {
    pub fn new() -> Self {
        StaticProvider {
            counter: AtomicU64::new(0),
            failure: None,
        }
    }

    /// A provider that refuses every request, for exercising the
    /// synchronous-failure path.
    pub fn failing(message: impl Into<String>) -> Self {
        StaticProvider {
            counter: AtomicU64::new(0),
            failure: Some(message.into()),
        }
    }
}

impl Default for StaticProvider {
    fn default() -> Self {
        StaticProvider::new()
    }
}

#[async_trait]
impl PaymentProvider for StaticProvider {
    async fn send_payment_request(
        &self,
        _amount: Decimal,
        _currency: &str,
        _phone: &str,
        account_reference: &str,
        _callback_url: &str,
    ) -> Result<ProviderReference> {
        if let Some(message) = &self.failure {
            return Err(PaymentError::ProviderUnavailable(message.clone()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let checkout_request_id = format!("ws_CO_{:08}", n);
        Ok(ProviderReference {
            checkout_request_id: checkout_request_id.clone(),
            merchant_request_id: Some(format!("mr_{:08}", n)),
            customer_message: Some("Success. Request accepted for processing".to_string()),
            raw: serde_json::json!({
                "MerchantRequestID": format!("mr_{:08}", n),
                "CheckoutRequestID": checkout_request_id,
                "ResponseCode": "0",
                "ResponseDescription": "Success. Request accepted for processing",
                "AccountReference": account_reference,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_settings() -> DarajaSettings {
        DarajaSettings {
            base_url: "https://sandbox.safaricom.co.ke".to_string(),
            consumer_key: "key".to_string(),
            consumer_secret: "secret".to_string(),
            short_code: "174379".to_string(),
            passkey: "passkey".to_string(),
        }
    }

    #[test]
    fn test_password_is_base64_of_shortcode_passkey_timestamp() {
        let client = DarajaClient::new(test_settings());
        let encoded = client.password("20260807120000");
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "174379passkey20260807120000"
        );
    }

    #[tokio::test]
    async fn test_daraja_rejects_foreign_currency() {
        let client = DarajaClient::new(test_settings());
        let result = client
            .send_payment_request(
                dec!(100.0),
                "USD",
                "254700000000",
                "A1",
                "http://localhost/cb",
            )
            .await;
        assert!(matches!(result, Err(PaymentError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_static_provider_hands_out_unique_ids() {
        let provider = StaticProvider::new();
        let a = provider
            .send_payment_request(dec!(10.0), "KES", "254700000000", "A1", "http://cb")
            .await
            .unwrap();
        let b = provider
            .send_payment_request(dec!(10.0), "KES", "254700000000", "A2", "http://cb")
            .await
            .unwrap();
        assert_ne!(a.checkout_request_id, b.checkout_request_id);
        assert!(a.checkout_request_id.starts_with("ws_CO_"));
    }

    #[tokio::test]
    async fn test_failing_provider_surfaces_unavailable() {
        let provider = StaticProvider::failing("gateway down");
        let result = provider
            .send_payment_request(dec!(10.0), "KES", "254700000000", "A1", "http://cb")
            .await;
        match result {
            Err(PaymentError::ProviderUnavailable(msg)) => assert_eq!(msg, "gateway down"),
            other => panic!("expected ProviderUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_acknowledgment_contract_shape() {
        let ack = StkAcknowledgment::accepted();
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["ResultCode"], 0);
        assert_eq!(json["ResultDesc"], "Accepted");
    }
}
