//! One upstream request with retry, backoff, deadline, and rate budgeting.
//!
//! Every attempt acquires one token from the endpoint's bucket before the
//! request goes out, so retries pay the same budget as first tries. Only
//! transient categories (transport, 5xx, throttling, deadline) are retried;
//! schema and auth failures surface immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EtlError, Result};
use crate::limiter::RateBuckets;
use crate::registry::ApiDescriptor;
use crate::vendor::{DataPage, Params, Vendor, VendorError};

/// Retry knobs, derived from `batch.*` configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retry_times: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-attempt deadline.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_batch(batch: &crate::config::BatchConfig) -> Self {
        Self {
            retry_times: batch.retry_times,
            base_delay: Duration::from_secs(batch.retry_delay_sec),
            max_delay: Duration::from_secs(batch.retry_delay_cap_sec),
            attempt_timeout: Duration::from_secs(batch.timeout_sec),
        }
    }

    /// Exponential backoff: base * 2^(attempt-1), capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Issues rate-limited, retried requests against the vendor.
pub struct Fetcher {
    vendor: Arc<dyn Vendor>,
    buckets: Arc<RateBuckets>,
    policy: RetryPolicy,
}

/// Outcome of a successful fetch, including how many requests it cost.
#[derive(Debug)]
pub struct FetchResult {
    pub page: DataPage,
    pub attempts: u32,
}

impl Fetcher {
    pub fn new(vendor: Arc<dyn Vendor>, buckets: Arc<RateBuckets>, policy: RetryPolicy) -> Self {
        Self {
            vendor,
            buckets,
            policy,
        }
    }

    /// Fetch one page for `api` with `params`. `request_id` ties log lines
    /// from all attempts of this logical request together.
    pub async fn fetch(
        &self,
        api: &ApiDescriptor,
        params: Params,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchResult> {
        let max_attempts = self.policy.retry_times + 1;
        let mut last_cause = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(EtlError::Cancelled);
            }

            self.buckets.acquire(api.bucket, 1).await;

            let call = self.vendor.call(api.name, &params);
            let outcome = match tokio::time::timeout(self.policy.attempt_timeout, call).await {
                Ok(r) => r,
                Err(_) => Err(VendorError::Transport(format!(
                    "attempt deadline of {:?} exceeded",
                    self.policy.attempt_timeout
                ))),
            };

            match outcome {
                Ok(page) => {
                    page.validate_schema(api.name, api.columns, api.tolerate_extra_columns)?;
                    debug!(
                        request_id,
                        api = api.name,
                        attempt,
                        rows = page.n_rows(),
                        "fetch succeeded"
                    );
                    return Ok(FetchResult { page, attempts: attempt });
                }
                Err(err) if err.is_transient() => {
                    last_cause = err.to_string();
                    warn!(
                        request_id,
                        api = api.name,
                        attempt,
                        max_attempts,
                        error = %err,
                        "transient fetch failure"
                    );
                    if attempt < max_attempts {
                        let delay = self.policy.backoff_delay(attempt);
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(EtlError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Err(VendorError::Auth(msg)) => {
                    return Err(EtlError::UpstreamSchema {
                        api: api.name.to_string(),
                        detail: format!("authentication rejected: {msg}"),
                    });
                }
                Err(err) => {
                    // Non-transient api/decode errors are treated as schema
                    // contract breaks: no retry, operator triage required.
                    return Err(EtlError::UpstreamSchema {
                        api: api.name.to_string(),
                        detail: err.to_string(),
                    });
                }
            }
        }

        Err(EtlError::FetchExhausted {
            api: api.name.to_string(),
            attempts: max_attempts,
            last_cause,
        })
    }
}
