//! The runtime context threaded through every stage call.
//!
//! All process-wide shared state lives here: the store handle (with its
//! connection pool), the vendor client, the rate buckets, the calendar
//! cache, the event bus, and the cancellation token. There are no
//! module-level singletons anywhere in the engine.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::calendar::{Clock, TradeCalendar};
use crate::config::Config;
use crate::error::Result;
use crate::events::EventBus;
use crate::fetch::{Fetcher, RetryPolicy};
use crate::limiter::RateBuckets;
use crate::store::Store;
use crate::vendor::Vendor;

#[derive(Clone)]
pub struct EtlContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub vendor: Arc<dyn Vendor>,
    pub buckets: Arc<RateBuckets>,
    pub calendar: Arc<TradeCalendar>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<EventBus>,
    pub cancel: CancellationToken,
}

impl EtlContext {
    /// A fetcher wired to this context's vendor, buckets, and retry policy.
    pub fn fetcher(&self) -> Fetcher {
        Fetcher::new(
            self.vendor.clone(),
            self.buckets.clone(),
            RetryPolicy::from_batch(&self.config.batch),
        )
    }

    /// Today cap per the cached calendar and this context's clock.
    pub fn today_cap(&self) -> Result<u32> {
        self.calendar.today_cap(self.clock.now())
    }

    /// Load (or reload) the calendar cache from the store.
    pub async fn reload_calendar(&self) -> Result<()> {
        let days = self
            .store
            .load_calendar(&self.config.etl.exchange, self.config.etl.start_date)
            .await?;
        info!(rows = days.len(), "trade calendar (re)loaded");
        self.calendar.replace(&days);
        Ok(())
    }

    /// Refresh the calendar when a lookup needs dates beyond the cached
    /// horizon; no-op otherwise.
    pub async fn ensure_calendar_covers(&self, date: u32) -> Result<()> {
        if self.calendar.needs_refresh(date) {
            self.reload_calendar().await?;
        }
        Ok(())
    }
}
