use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Publicly reachable URL the provider posts callbacks to. Passed in
    /// explicitly at construction; components never read it from process
    /// state.
    pub callback_url: String,
    /// Network-level timeout on the outbound provider call. Distinct from
    /// `pending_max_age`: hitting it is a ProviderUnavailable error, not a
    /// state transition.
    pub provider_timeout: Duration,
    /// Business timeout after which a PENDING request is swept to TIMED_OUT.
    pub pending_max_age: Duration,
    /// How often the server binary runs the timeout sweep.
    pub sweep_interval: Duration,
    /// Append-only JSONL sink for the audit log, if persistence is wanted.
    pub audit_log_path: Option<PathBuf>,
    pub log_warnings: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            callback_url: "http://localhost:8080/mpesa/callback".to_string(),
            provider_timeout: Duration::from_secs(10),
            pending_max_age: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            audit_log_path: None,
            log_warnings: true,
        }
    }
}

impl ReconcilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn production(callback_url: String) -> Self {
        ReconcilerConfig {
            callback_url,
            provider_timeout: Duration::from_secs(30),
            pending_max_age: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
            audit_log_path: Some(PathBuf::from("audit.jsonl")),
            log_warnings: true,
        }
    }

    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = url.into();
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn with_pending_max_age(mut self, max_age: Duration) -> Self {
        self.pending_max_age = max_age;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_audit_log_path(mut self, path: Option<PathBuf>) -> Self {
        self.audit_log_path = path;
        self
    }

    pub fn with_log_warnings(mut self, log: bool) -> Self {
        self.log_warnings = log;
        self
    }
}
