use crate::config::ReconcilerConfig;
use crate::domain::audit::{AuditEntry, AuditEvent, AuditLog, TransitionSource};
use crate::domain::callback::CallbackEvent;
use crate::domain::payment_request::{
    normalize_phone, valid_currency, PaymentRequest, PaymentState,
};
use crate::error::{PaymentError, Result};
use crate::services::order::OrderUpdater;
use crate::services::provider::PaymentProvider;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationResult {
    /// The callback won the transition; the record moved out of PENDING.
    Applied {
        correlation_id: String,
        state: PaymentState,
    },
    /// Redelivery of an already-settled outcome; nothing changed.
    Duplicate {
        correlation_id: String,
        state: PaymentState,
    },
}

/// Tracks payment requests and reconciles asynchronous provider callbacks
/// against them.
///
/// All mutation goes through the audit mutex: a state change and its audit
/// append happen while holding it, with the append as the commit point, so
/// transitions on a record are linearized and none is applied twice.
pub struct ReconcilerEngine {
    requests: DashMap<String, PaymentRequest>,
    pending_by_order: DashMap<String, String>,
    audit: Mutex<AuditLog>,
    provider: Arc<dyn PaymentProvider>,
    orders: Arc<dyn OrderUpdater>,
    config: ReconcilerConfig,
}

impl ReconcilerEngine {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        orders: Arc<dyn OrderUpdater>,
        config: ReconcilerConfig,
    ) -> Result<Self> {
        let audit = match &config.audit_log_path {
            Some(path) => AuditLog::with_sink(path)?,
            None => AuditLog::new(),
        };
        Ok(ReconcilerEngine {
            requests: DashMap::new(),
            pending_by_order: DashMap::new(),
            audit: Mutex::new(audit),
            provider,
            orders,
            config,
        })
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Creates a PENDING request for the order and pushes the payment
    /// prompt to the payer through the provider. The record is persisted
    /// before the outbound call; a synchronous provider failure moves it
    /// straight to FAILED and surfaces the error to the caller.
    pub async fn initiate(
        &self,
        order_reference: &str,
        amount: Decimal,
        currency: &str,
        payer_phone: &str,
    ) -> Result<PaymentRequest> {
        if order_reference.trim().is_empty() {
            return Err(PaymentError::InvalidRequest(
                "empty order reference".to_string(),
            ));
        }
        if amount <= Decimal::ZERO {
            return Err(PaymentError::InvalidRequest(format!(
                "amount must be positive, got {}",
                amount
            )));
        }
        if !valid_currency(currency) {
            return Err(PaymentError::InvalidRequest(format!(
                "invalid currency code {:?}",
                currency
            )));
        }
        let phone = normalize_phone(payer_phone).ok_or_else(|| {
            PaymentError::InvalidRequest(format!("invalid payer phone number {:?}", payer_phone))
        })?;

        let local_id = Uuid::new_v4().to_string();

        {
            let mut audit = self.audit.lock().await;

            if let Some(existing) = self.active_pending_for(order_reference) {
                if self.config.log_warnings {
                    log::warn!(
                        "Initiate rejected: order={}, pending correlation_id={} (at most one pending request per order)",
                        order_reference,
                        existing
                    );
                }
                return Err(PaymentError::DuplicatePendingRequest {
                    order_reference: order_reference.to_string(),
                    correlation_id: existing,
                });
            }

            audit.append(AuditEntry::now(
                &local_id,
                AuditEvent::Created {
                    order_reference: order_reference.to_string(),
                },
            ))?;
            self.requests.insert(
                local_id.clone(),
                PaymentRequest::new(
                    local_id.clone(),
                    order_reference.to_string(),
                    amount,
                    currency.to_string(),
                    phone.clone(),
                ),
            );
            self.pending_by_order
                .insert(order_reference.to_string(), local_id.clone());
        }

        let outcome = tokio::time::timeout(
            self.config.provider_timeout,
            self.provider.send_payment_request(
                amount,
                currency,
                &phone,
                order_reference,
                &self.config.callback_url,
            ),
        )
        .await;

        match outcome {
            Ok(Ok(reference)) => {
                let request = self.adopt_provider_reference(&local_id, reference).await?;
                log::info!(
                    "Payment request initiated: order={}, correlation_id={}, amount={}",
                    order_reference,
                    request.correlation_id,
                    amount
                );
                Ok(request)
            }
            Ok(Err(err)) => {
                self.fail_after_provider_error(&local_id, &err).await;
                Err(err)
            }
            Err(_) => {
                let err = PaymentError::ProviderUnavailable(format!(
                    "no response within {:?}",
                    self.config.provider_timeout
                ));
                self.fail_after_provider_error(&local_id, &err).await;
                Err(err)
            }
        }
    }

    /// Validates a provider callback, matches it to its request, and
    /// settles the record exactly once. Duplicate deliveries of a settled
    /// outcome succeed idempotently; a delivery disagreeing with the
    /// recorded outcome is surfaced as ConflictingCallback and never
    /// overwrites state.
    pub async fn handle_callback(
        &self,
        payload: &serde_json::Value,
    ) -> Result<ReconciliationResult> {
        let event = CallbackEvent::parse(payload)?;

        let updated = {
            let mut audit = self.audit.lock().await;
            let current = self.requests.get(&event.correlation_id).map(|r| r.state);

            match current {
                None => {
                    audit.append(AuditEntry::now(
                        &event.correlation_id,
                        AuditEvent::Unmatched {
                            payload: event.raw.clone(),
                        },
                    ))?;
                    if self.config.log_warnings {
                        log::warn!(
                            "Callback rejected: correlation_id={} (no matching request, held for manual reconciliation)",
                            event.correlation_id
                        );
                    }
                    return Err(PaymentError::UnknownCorrelation(event.correlation_id));
                }
                Some(state) if state.is_terminal() => {
                    if event.outcome.consistent_with(state) {
                        audit.append(AuditEntry::now(
                            &event.correlation_id,
                            AuditEvent::Duplicate { state },
                        ))?;
                        log::info!(
                            "Duplicate callback delivery: correlation_id={}, state={:?}",
                            event.correlation_id,
                            state
                        );
                        return Ok(ReconciliationResult::Duplicate {
                            correlation_id: event.correlation_id,
                            state,
                        });
                    }
                    audit.append(AuditEntry::now(
                        &event.correlation_id,
                        AuditEvent::Conflict {
                            recorded: state,
                            reported_success: event.outcome.is_success(),
                        },
                    ))?;
                    log::error!(
                        "Conflicting callback: correlation_id={}, recorded={:?}, provider now reports result_code={}",
                        event.correlation_id,
                        state,
                        event.result_code
                    );
                    return Err(PaymentError::ConflictingCallback {
                        correlation_id: event.correlation_id,
                        recorded: state,
                        reported_success: event.outcome.is_success(),
                    });
                }
                Some(_) => self.transition_locked(
                    &mut audit,
                    &event.correlation_id,
                    event.outcome.target_state(),
                    TransitionSource::Callback,
                    Some(event.raw.clone()),
                )?,
            }
        };

        self.notify_order(
            &updated.order_reference,
            updated.state,
            updated.last_transition_at,
        )
        .await;

        Ok(ReconciliationResult::Applied {
            correlation_id: updated.correlation_id,
            state: updated.state,
        })
    }

    /// Explicit cancellation, e.g. the payer abandoned checkout. Valid only
    /// while PENDING; a terminal record gives AlreadyTerminal and stays
    /// untouched.
    pub async fn cancel(&self, correlation_id: &str) -> Result<PaymentRequest> {
        let updated = {
            let mut audit = self.audit.lock().await;
            self.transition_locked(
                &mut audit,
                correlation_id,
                PaymentState::Cancelled,
                TransitionSource::Cancellation,
                None,
            )
            .map_err(|e| {
                if self.config.log_warnings {
                    log::warn!("Cancel rejected: correlation_id={}: {}", correlation_id, e);
                }
                e
            })?
        };

        self.notify_order(
            &updated.order_reference,
            updated.state,
            updated.last_transition_at,
        )
        .await;
        Ok(updated)
    }

    /// Moves every PENDING request older than `max_age` to TIMED_OUT and
    /// propagates the terminal state to the order collaborator. Returns the
    /// number of requests swept.
    pub async fn sweep_timeouts(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| PaymentError::InvalidRequest(format!("max_age out of range: {}", e)))?;
        let cutoff = Utc::now() - max_age;

        let candidates: Vec<String> = self
            .requests
            .iter()
            .filter(|r| r.state == PaymentState::Pending && r.created_at < cutoff)
            .map(|r| r.key().clone())
            .collect();

        let mut swept = Vec::new();
        {
            let mut audit = self.audit.lock().await;
            for id in candidates {
                // Revalidate under the lock: a callback may have won the race.
                let still_expired = self
                    .requests
                    .get(&id)
                    .map(|r| r.state == PaymentState::Pending && r.created_at < cutoff)
                    .unwrap_or(false);
                if !still_expired {
                    continue;
                }
                match self.transition_locked(
                    &mut audit,
                    &id,
                    PaymentState::TimedOut,
                    TransitionSource::Sweep,
                    None,
                ) {
                    Ok(updated) => swept.push(updated),
                    Err(e) => {
                        // keep sweeping; the record is retried next pass
                        log::error!("Sweep failed for {}: {}", id, e);
                    }
                }
            }
        }

        if !swept.is_empty() {
            log::info!("Timeout sweep transitioned {} pending request(s)", swept.len());
        }
        let count = swept.len();
        for request in swept {
            self.notify_order(
                &request.order_reference,
                request.state,
                request.last_transition_at,
            )
            .await;
        }
        Ok(count)
    }

    pub fn get_by_correlation_id(&self, correlation_id: &str) -> Option<PaymentRequest> {
        self.requests.get(correlation_id).map(|r| r.clone())
    }

    /// Every attempt recorded for the order, oldest first.
    pub fn get_by_order_reference(&self, order_reference: &str) -> Vec<PaymentRequest> {
        let mut attempts: Vec<PaymentRequest> = self
            .requests
            .iter()
            .filter(|r| r.order_reference == order_reference)
            .map(|r| r.clone())
            .collect();
        attempts.sort_by_key(|r| r.created_at);
        attempts
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().await.entries().to_vec()
    }

    pub async fn replay_states(&self) -> IndexMap<String, PaymentState> {
        self.audit.lock().await.replay_states()
    }

    fn active_pending_for(&self, order_reference: &str) -> Option<String> {
        let correlation_id = self
            .pending_by_order
            .get(order_reference)
            .map(|e| e.value().clone())?;
        let still_pending = self
            .requests
            .get(&correlation_id)
            .map(|r| r.state == PaymentState::Pending)
            .unwrap_or(false);
        if still_pending {
            Some(correlation_id)
        } else {
            // stale mapping left by a failed cleanup
            self.pending_by_order
                .remove_if(order_reference, |_, v| v == &correlation_id);
            None
        }
    }

    /// Re-keys the record from its locally generated id to the identifier
    /// the provider assigned, so the eventual callback matches.
    async fn adopt_provider_reference(
        &self,
        local_id: &str,
        reference: crate::services::provider::ProviderReference,
    ) -> Result<PaymentRequest> {
        let mut audit = self.audit.lock().await;
        audit.append(AuditEntry::now(
            &reference.checkout_request_id,
            AuditEvent::Reassigned {
                previous: local_id.to_string(),
            },
        ))?;

        let Some((_, mut request)) = self.requests.remove(local_id) else {
            return Err(PaymentError::UnknownCorrelation(local_id.to_string()));
        };
        request.correlation_id = reference.checkout_request_id.clone();
        request.provider_raw_response = Some(reference.raw);
        let updated = request.clone();
        self.requests
            .insert(reference.checkout_request_id.clone(), request);
        // The record may already have been swept while the provider call was
        // in flight; only a still-pending request keeps its order slot.
        if updated.state == PaymentState::Pending {
            self.pending_by_order.insert(
                updated.order_reference.clone(),
                reference.checkout_request_id,
            );
        }
        Ok(updated)
    }

    async fn fail_after_provider_error(&self, local_id: &str, err: &PaymentError) {
        let mut audit = self.audit.lock().await;
        let result = self.transition_locked(
            &mut audit,
            local_id,
            PaymentState::Failed,
            TransitionSource::ProviderError,
            Some(serde_json::json!({ "error": err.to_string() })),
        );
        match result {
            Ok(_) | Err(PaymentError::AlreadyTerminal { .. }) => {}
            Err(e) => log::error!(
                "Failed to record provider error for {}: {}",
                local_id,
                e
            ),
        }
    }

    /// The single mutation path: verifies the record is still PENDING,
    /// appends the audit entry (the commit point), then applies the state
    /// change and releases the order's pending slot. Callers hold the audit
    /// lock.
    fn transition_locked(
        &self,
        audit: &mut AuditLog,
        correlation_id: &str,
        to: PaymentState,
        source: TransitionSource,
        raw: Option<serde_json::Value>,
    ) -> Result<PaymentRequest> {
        let current = match self.requests.get(correlation_id) {
            Some(r) => r.state,
            None => return Err(PaymentError::UnknownCorrelation(correlation_id.to_string())),
        };
        if current.is_terminal() {
            return Err(PaymentError::AlreadyTerminal {
                correlation_id: correlation_id.to_string(),
                state: current,
            });
        }

        audit.append(AuditEntry::now(
            correlation_id,
            AuditEvent::Transition {
                from: current,
                to,
                source,
            },
        ))?;

        let Some(mut record) = self.requests.get_mut(correlation_id) else {
            return Err(PaymentError::UnknownCorrelation(correlation_id.to_string()));
        };
        record.state = to;
        record.last_transition_at = Utc::now();
        if let Some(raw) = raw {
            record.provider_raw_response = Some(raw);
        }
        let updated = record.clone();
        drop(record);

        self.pending_by_order
            .remove_if(&updated.order_reference, |_, v| v == correlation_id);
        Ok(updated)
    }

    async fn notify_order(
        &self,
        order_reference: &str,
        state: PaymentState,
        occurred_at: DateTime<Utc>,
    ) {
        if let Err(e) = self
            .orders
            .update_payment_status(order_reference, state, occurred_at)
            .await
        {
            log::error!(
                "Failed to propagate payment status to order {}: {}",
                order_reference,
                e
            );
        }
    }
}
