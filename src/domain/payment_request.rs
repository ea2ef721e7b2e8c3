use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};

fn serialize_decimal<S>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{:.2}", value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Confirmed,
    Failed,
    TimedOut,
    Cancelled,
}

impl PaymentState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentState::Pending)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRequest {
    pub correlation_id: String,
    pub order_reference: String,
    #[serde(serialize_with = "serialize_decimal")]
    pub amount: Decimal,
    pub currency: String,
    pub payer_phone: String,
    pub state: PaymentState,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_raw_response: Option<serde_json::Value>,
}

impl PaymentRequest {
    pub fn new(
        correlation_id: String,
        order_reference: String,
        amount: Decimal,
        currency: String,
        payer_phone: String,
    ) -> Self {
        let now = Utc::now();
        PaymentRequest {
            correlation_id,
            order_reference,
            amount,
            currency,
            payer_phone,
            state: PaymentState::Pending,
            created_at: now,
            last_transition_at: now,
            provider_raw_response: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Normalizes a subscriber phone number to the canonical 12-digit MSISDN
/// (`2547XXXXXXXX` / `2541XXXXXXXX`). Accepts the local `07..`/`01..` form
/// and an optional leading `+`.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);

    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let canonical = if digits.len() == 10 && (digits.starts_with("07") || digits.starts_with("01"))
    {
        format!("254{}", &digits[1..])
    } else {
        digits.to_string()
    };

    if canonical.len() == 12
        && (canonical.starts_with("2547") || canonical.starts_with("2541"))
    {
        Some(canonical)
    } else {
        None
    }
}

pub fn valid_currency(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_new_request_starts_pending() {
        let req = PaymentRequest::new(
            "C1".to_string(),
            "A1".to_string(),
            dec!(500.0),
            "KES".to_string(),
            "254700000000".to_string(),
        );
        assert_eq!(req.state, PaymentState::Pending);
        assert!(!req.is_terminal());
        assert_eq!(req.created_at, req.last_transition_at);
        assert!(req.provider_raw_response.is_none());
    }

    #[test]
    fn test_pending_is_only_non_terminal_state() {
        assert!(!PaymentState::Pending.is_terminal());
        assert!(PaymentState::Confirmed.is_terminal());
        assert!(PaymentState::Failed.is_terminal());
        assert!(PaymentState::TimedOut.is_terminal());
        assert!(PaymentState::Cancelled.is_terminal());
    }

    #[test]
    fn test_normalize_canonical_passthrough() {
        assert_eq!(
            normalize_phone("254700000000").as_deref(),
            Some("254700000000")
        );
        assert_eq!(
            normalize_phone("254110000000").as_deref(),
            Some("254110000000")
        );
    }

    #[test]
    fn test_normalize_local_form() {
        assert_eq!(
            normalize_phone("0700000000").as_deref(),
            Some("254700000000")
        );
        assert_eq!(
            normalize_phone("0110000000").as_deref(),
            Some("254110000000")
        );
    }

    #[test]
    fn test_normalize_plus_prefix() {
        assert_eq!(
            normalize_phone("+254700000000").as_deref(),
            Some("254700000000")
        );
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_phone("").is_none());
        assert!(normalize_phone("not-a-phone").is_none());
        assert!(normalize_phone("25470000000").is_none()); // 11 digits
        assert!(normalize_phone("2547000000000").is_none()); // 13 digits
        assert!(normalize_phone("254200000000").is_none()); // landline prefix
        assert!(normalize_phone("0800000000").is_none());
    }

    #[test]
    fn test_currency_validation() {
        assert!(valid_currency("KES"));
        assert!(valid_currency("USD"));
        assert!(!valid_currency("kes"));
        assert!(!valid_currency("KE"));
        assert!(!valid_currency(""));
        assert!(!valid_currency("KESH"));
    }

    #[test]
    fn test_amount_serialized_with_two_decimals() {
        let req = PaymentRequest::new(
            "C1".to_string(),
            "A1".to_string(),
            dec!(500),
            "KES".to_string(),
            "254700000000".to_string(),
        );
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["amount"], "500.00");
        assert_eq!(json["state"], "pending");
    }
}
