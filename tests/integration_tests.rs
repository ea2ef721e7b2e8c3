use payments_reconciler::config::ReconcilerConfig;
use payments_reconciler::domain::audit::AuditLog;
use payments_reconciler::domain::payment_request::PaymentState;
use payments_reconciler::error::PaymentError;
use payments_reconciler::services::order::RecordingOrderUpdater;
use payments_reconciler::services::provider::StaticProvider;
use payments_reconciler::services::reconciler::{ReconcilerEngine, ReconciliationResult};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn engine_with(config: ReconcilerConfig) -> (Arc<ReconcilerEngine>, Arc<RecordingOrderUpdater>) {
    let orders = Arc::new(RecordingOrderUpdater::new());
    let engine =
        ReconcilerEngine::new(Arc::new(StaticProvider::new()), orders.clone(), config).unwrap();
    (Arc::new(engine), orders)
}

fn callback(correlation_id: &str, result_code: i64) -> serde_json::Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": correlation_id,
                "ResultCode": result_code,
                "ResultDesc": if result_code == 0 {
                    "The service request is processed successfully."
                } else {
                    "Request cancelled by user"
                }
            }
        }
    })
}

/// The confirm / replay / conflict scenario: one initiation for order A1,
/// a success callback settles it, replaying the callback changes nothing,
/// and a contradicting callback is refused.
#[tokio::test]
async fn test_confirmation_scenario() {
    let (engine, orders) = engine_with(ReconcilerConfig::default());

    let request = engine
        .initiate("A1", dec!(500), "KES", "254700000000")
        .await
        .unwrap();
    assert_eq!(request.state, PaymentState::Pending);

    let settled = engine
        .handle_callback(&callback(&request.correlation_id, 0))
        .await
        .unwrap();
    assert!(matches!(
        settled,
        ReconciliationResult::Applied {
            state: PaymentState::Confirmed,
            ..
        }
    ));
    assert_eq!(orders.updates_for("A1").await.len(), 1);

    // identical redelivery: no second transition, no second order update
    let replay = engine
        .handle_callback(&callback(&request.correlation_id, 0))
        .await
        .unwrap();
    assert!(matches!(replay, ReconciliationResult::Duplicate { .. }));
    assert_eq!(orders.updates_for("A1").await.len(), 1);

    // contradicting redelivery: refused, state untouched
    let conflict = engine
        .handle_callback(&callback(&request.correlation_id, 1032))
        .await;
    assert!(matches!(
        conflict,
        Err(PaymentError::ConflictingCallback { .. })
    ));
    assert_eq!(
        engine
            .get_by_correlation_id(&request.correlation_id)
            .unwrap()
            .state,
        PaymentState::Confirmed
    );
}

/// The timeout scenario: no callback arrives, the sweep moves the request
/// to TIMED_OUT, and late callbacks can no longer transition it.
#[tokio::test]
async fn test_timeout_scenario() {
    let (engine, orders) = engine_with(ReconcilerConfig::default());

    let request = engine
        .initiate("A2", dec!(750), "KES", "254711111111")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let swept = engine
        .sweep_timeouts(Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(swept, 1);

    let record = engine
        .get_by_correlation_id(&request.correlation_id)
        .unwrap();
    assert_eq!(record.state, PaymentState::TimedOut);
    assert_eq!(
        orders.updates_for("A2").await[0].state,
        PaymentState::TimedOut
    );

    // the late failure report agrees with the timeout; no fresh transition
    let late = engine
        .handle_callback(&callback(&request.correlation_id, 1))
        .await
        .unwrap();
    assert!(matches!(late, ReconciliationResult::Duplicate { .. }));
    assert_eq!(
        engine
            .get_by_correlation_id(&request.correlation_id)
            .unwrap()
            .state,
        PaymentState::TimedOut
    );
    assert_eq!(orders.updates_for("A2").await.len(), 1);
}

/// Several orders settle through different paths; the persisted audit log
/// alone is enough to rebuild every record's state.
#[tokio::test]
async fn test_rebuild_from_persisted_audit_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");

    let (engine, _) = engine_with(
        ReconcilerConfig::default().with_audit_log_path(Some(path.clone())),
    );

    let confirmed = engine
        .initiate("A1", dec!(500), "KES", "254700000000")
        .await
        .unwrap();
    let failed = engine
        .initiate("A2", dec!(300), "KES", "254722222222")
        .await
        .unwrap();
    let cancelled = engine
        .initiate("A3", dec!(100), "KES", "254733333333")
        .await
        .unwrap();
    let pending = engine
        .initiate("A4", dec!(900), "KES", "254744444444")
        .await
        .unwrap();

    engine
        .handle_callback(&callback(&confirmed.correlation_id, 0))
        .await
        .unwrap();
    engine
        .handle_callback(&callback(&failed.correlation_id, 2001))
        .await
        .unwrap();
    engine.cancel(&cancelled.correlation_id).await.unwrap();

    let entries = AuditLog::load(&path).unwrap();
    let rebuilt = payments_reconciler::domain::audit::replay(&entries);

    assert_eq!(
        rebuilt.get(&confirmed.correlation_id),
        Some(&PaymentState::Confirmed)
    );
    assert_eq!(
        rebuilt.get(&failed.correlation_id),
        Some(&PaymentState::Failed)
    );
    assert_eq!(
        rebuilt.get(&cancelled.correlation_id),
        Some(&PaymentState::Cancelled)
    );
    assert_eq!(
        rebuilt.get(&pending.correlation_id),
        Some(&PaymentState::Pending)
    );
    assert_eq!(rebuilt.len(), 4);
}

/// A burst of checkouts and deliveries across many orders: every record
/// ends terminal or pending, every order gets at most one status update,
/// and the audit log stays consistent with live state.
#[tokio::test]
async fn test_mixed_load_stays_consistent() {
    let (engine, orders) = engine_with(ReconcilerConfig::default());

    let mut handles = vec![];
    for i in 0..30 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let order = format!("ORD-{}", i);
            let request = engine
                .initiate(&order, dec!(250), "KES", "254700000000")
                .await
                .unwrap();
            let code = if i % 3 == 0 { 0 } else { 1032 };
            // redeliver a few times like a flaky provider would
            for _ in 0..3 {
                let _ = engine
                    .handle_callback(&callback(&request.correlation_id, code))
                    .await;
            }
            request.correlation_id
        }));
    }

    let mut ids = vec![];
    for handle in handles {
        ids.push(handle.await.unwrap());
    }

    let replayed = engine.replay_states().await;
    for id in &ids {
        let live = engine.get_by_correlation_id(id).unwrap();
        assert!(live.state.is_terminal());
        assert_eq!(replayed.get(id), Some(&live.state));
    }
    for i in 0..30 {
        assert_eq!(orders.updates_for(&format!("ORD-{}", i)).await.len(), 1);
    }
}

/// Provider outage: the attempt fails synchronously, the record is kept
/// for audit in FAILED, and a retry for the same order is permitted.
#[tokio::test]
async fn test_provider_outage_and_retry() {
    let orders = Arc::new(RecordingOrderUpdater::new());
    let engine = Arc::new(
        ReconcilerEngine::new(
            Arc::new(StaticProvider::failing("connection refused")),
            orders.clone(),
            ReconcilerConfig::default(),
        )
        .unwrap(),
    );

    let first = engine
        .initiate("A1", dec!(500), "KES", "254700000000")
        .await;
    assert!(matches!(first, Err(PaymentError::ProviderUnavailable(_))));

    let attempts = engine.get_by_order_reference("A1");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].state, PaymentState::Failed);

    let second = engine
        .initiate("A1", dec!(500), "KES", "254700000000")
        .await;
    assert!(matches!(second, Err(PaymentError::ProviderUnavailable(_))));
    assert_eq!(engine.get_by_order_reference("A1").len(), 2);
}
