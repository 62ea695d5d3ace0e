//! Per-request context

use meridian_common::config::CoordinatorConfig;
use std::time::Duration;
use uuid::Uuid;

/// Identity and deadlines of one submitted request
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Correlates log lines of one request
    pub request_id: String,
    /// Overall deadline, lock wait included
    pub timeout: Duration,
    /// Longest wait for region locks
    pub lock_timeout: Duration,
    /// Who sent the request, for logging only
    pub origin: Option<String>,
}

impl RequestContext {
    /// New context with a fresh request id and the configured deadlines
    #[must_use]
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            timeout: Duration::from_millis(config.request_timeout_ms),
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            origin: None,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}
