use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use payments_reconciler::config::ReconcilerConfig;
use payments_reconciler::error::PaymentError;
use payments_reconciler::services::order::{LoggingOrderUpdater, OrderUpdater};
use payments_reconciler::services::provider::{
    DarajaClient, DarajaSettings, PaymentProvider, StaticProvider, StkAcknowledgment,
};
use payments_reconciler::services::reconciler::ReconcilerEngine;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), PaymentError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let bind_addr = if args.len() > 1 {
        args[1].as_str()
    } else {
        "0.0.0.0:8080"
    };

    // Environment is read exactly once, here; components only ever see the
    // resulting config values.
    let callback_url = std::env::var("CALLBACK_URL")
        .unwrap_or_else(|_| format!("http://{}/mpesa/callback", bind_addr));
    let config = ReconcilerConfig::production(callback_url);

    let provider: Arc<dyn PaymentProvider> = match DarajaSettings::from_env() {
        Some(settings) => Arc::new(DarajaClient::new(settings)),
        None => {
            log::warn!("Daraja credentials not set; using the static sandbox provider");
            Arc::new(StaticProvider::new())
        }
    };
    let orders: Arc<dyn OrderUpdater> = Arc::new(LoggingOrderUpdater);

    let engine = Arc::new(ReconcilerEngine::new(provider, orders, config)?);

    let sweep_engine = engine.clone();
    tokio::spawn(async move {
        let interval = sweep_engine.config().sweep_interval;
        let max_age = sweep_engine.config().pending_max_age;
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = sweep_engine.sweep_timeouts(max_age).await {
                log::error!("Timeout sweep failed: {}", e);
            }
        }
    });

    let app = Router::new()
        .route("/payments", post(initiate_payment))
        .route("/payments/{id}", get(get_payment))
        .route("/payments/{id}/cancel", post(cancel_payment))
        .route("/orders/{order}/payments", get(list_order_payments))
        .route("/mpesa/callback", post(mpesa_callback))
        .with_state(engine);

    let listener = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind to {}: {}", bind_addr, e);
            return Err(e.into());
        }
    };
    log::info!("Payment reconciler listening on {}", bind_addr);
    log::info!("Provider callbacks expected on POST /mpesa/callback");

    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct InitiatePaymentBody {
    order_reference: String,
    amount: Decimal,
    currency: String,
    phone_number: String,
}

async fn initiate_payment(
    State(engine): State<Arc<ReconcilerEngine>>,
    Json(body): Json<InitiatePaymentBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    match engine
        .initiate(
            &body.order_reference,
            body.amount,
            &body.currency,
            &body.phone_number,
        )
        .await
    {
        Ok(request) => match serde_json::to_value(&request) {
            Ok(json) => (StatusCode::CREATED, Json(json)),
            Err(e) => internal_error(&e.into()),
        },
        Err(e) => error_response(&e),
    }
}

async fn get_payment(
    State(engine): State<Arc<ReconcilerEngine>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match engine.get_by_correlation_id(&id) {
        Some(request) => match serde_json::to_value(&request) {
            Ok(json) => (StatusCode::OK, Json(json)),
            Err(e) => internal_error(&e.into()),
        },
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no payment request {}", id) })),
        ),
    }
}

async fn cancel_payment(
    State(engine): State<Arc<ReconcilerEngine>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match engine.cancel(&id).await {
        Ok(request) => match serde_json::to_value(&request) {
            Ok(json) => (StatusCode::OK, Json(json)),
            Err(e) => internal_error(&e.into()),
        },
        Err(e) => error_response(&e),
    }
}

async fn list_order_payments(
    State(engine): State<Arc<ReconcilerEngine>>,
    Path(order): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let attempts = engine.get_by_order_reference(&order);
    match serde_json::to_value(&attempts) {
        Ok(json) => (StatusCode::OK, Json(json)),
        Err(e) => internal_error(&e.into()),
    }
}

/// The provider redelivers until it sees the acknowledgment body, so every
/// structurally valid callback gets one back, including those the engine
/// could not match or refused as conflicting. Those are already recorded
/// in the audit log for manual reconciliation.
async fn mpesa_callback(
    State(engine): State<Arc<ReconcilerEngine>>,
    Json(payload): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    let ack = match serde_json::to_value(StkAcknowledgment::accepted()) {
        Ok(ack) => ack,
        Err(e) => return internal_error(&e.into()),
    };
    match engine.handle_callback(&payload).await {
        Ok(_) => (StatusCode::OK, Json(ack)),
        Err(PaymentError::MalformedCallback(msg)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "ResultCode": 1, "ResultDesc": msg })),
        ),
        Err(PaymentError::UnknownCorrelation(_)) | Err(PaymentError::ConflictingCallback { .. }) => {
            (StatusCode::OK, Json(ack))
        }
        Err(e) => internal_error(&e),
    }
}

fn error_response(err: &PaymentError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        PaymentError::InvalidRequest(_) | PaymentError::MalformedCallback(_) => {
            StatusCode::BAD_REQUEST
        }
        PaymentError::DuplicatePendingRequest { .. }
        | PaymentError::AlreadyTerminal { .. }
        | PaymentError::ConflictingCallback { .. } => StatusCode::CONFLICT,
        PaymentError::UnknownCorrelation(_) => StatusCode::NOT_FOUND,
        PaymentError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
        PaymentError::IoError(_) | PaymentError::JsonError(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
}

fn internal_error(err: &PaymentError) -> (StatusCode, Json<serde_json::Value>) {
    log::error!("Internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "internal error" })),
    )
}
