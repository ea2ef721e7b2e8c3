use crate::domain::payment_request::PaymentState;
use crate::error::{PaymentError, Result};
use serde::Deserialize;

/// Raw STK-Push callback envelope as delivered by the provider. Only the
/// fields the reconciler needs are declared; everything else in the payload
/// is ignored.
#[derive(Debug, Deserialize)]
pub struct RawCallback {
    #[serde(rename = "Body")]
    pub body: RawCallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct RawCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: RawStkCallback,
}

#[derive(Debug, Deserialize)]
pub struct RawStkCallback {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Success,
    Failure,
}

impl CallbackOutcome {
    pub fn from_result_code(code: i64) -> Self {
        if code == 0 {
            CallbackOutcome::Success
        } else {
            CallbackOutcome::Failure
        }
    }

    pub fn target_state(self) -> PaymentState {
        match self {
            CallbackOutcome::Success => PaymentState::Confirmed,
            CallbackOutcome::Failure => PaymentState::Failed,
        }
    }

    /// Whether a redelivered callback with this outcome agrees with a state
    /// already recorded for the request. A failure report against a request
    /// the sweep timed out (or the payer cancelled) is still agreement: the
    /// payment did not go through either way. A success report against any
    /// non-confirmed terminal state is a conflict.
    pub fn consistent_with(self, recorded: PaymentState) -> bool {
        match self {
            CallbackOutcome::Success => recorded == PaymentState::Confirmed,
            CallbackOutcome::Failure => matches!(
                recorded,
                PaymentState::Failed | PaymentState::TimedOut | PaymentState::Cancelled
            ),
        }
    }

    pub fn is_success(self) -> bool {
        self == CallbackOutcome::Success
    }
}

#[derive(Debug, Clone)]
pub struct CallbackEvent {
    pub correlation_id: String,
    pub merchant_request_id: Option<String>,
    pub outcome: CallbackOutcome,
    pub result_code: i64,
    pub result_desc: Option<String>,
    pub raw: serde_json::Value,
}

impl CallbackEvent {
    pub fn parse(raw: &serde_json::Value) -> Result<Self> {
        let envelope: RawCallback = serde_json::from_value(raw.clone())
            .map_err(|e| PaymentError::MalformedCallback(e.to_string()))?;

        let stk = envelope.body.stk_callback;
        if stk.checkout_request_id.trim().is_empty() {
            return Err(PaymentError::MalformedCallback(
                "empty CheckoutRequestID".to_string(),
            ));
        }

        Ok(CallbackEvent {
            correlation_id: stk.checkout_request_id,
            merchant_request_id: stk.merchant_request_id,
            outcome: CallbackOutcome::from_result_code(stk.result_code),
            result_code: stk.result_code,
            result_desc: stk.result_desc,
            raw: raw.clone(),
        })
    }
}
