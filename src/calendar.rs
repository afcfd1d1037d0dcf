//! Trading-day arithmetic over the exchange calendar.
//!
//! The calendar is loaded once per process from `dim_trade_cal` and cached
//! behind a copy-on-refresh lock; a refresh is triggered when a lookup asks
//! for a date beyond the cached horizon. Dates are plain `YYYYMMDD` integers
//! and all comparisons are integer comparisons.

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::{EtlError, Result};
use crate::store::models::CalendarDay;

/// Hour (market time) after which the upstream publishes today's daily bars;
/// before this, "today" cannot be claimed by the cap.
pub const DATA_CUTOFF_HOUR: u32 = 16;

/// Exchange close (market time), the reference point for readiness lags.
pub const MARKET_CLOSE_HOUR: u32 = 15;

/// Wall-clock source, injectable so tests can pin "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Real wall clock in the market's time zone (UTC+8).
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        let offset = FixedOffset::east_opt(8 * 3600).expect("fixed UTC+8 offset");
        Utc::now().with_timezone(&offset)
    }
}

struct CalendarSnapshot {
    /// Open trading days, ascending.
    open_days: Vec<u32>,
    /// Greatest calendar date loaded, open or not.
    horizon: u32,
}

/// Cached trade calendar. Cheap to clone handles via `Arc`; readers never
/// block a refresh because refresh swaps a new snapshot in.
pub struct TradeCalendar {
    inner: RwLock<Arc<CalendarSnapshot>>,
}

impl TradeCalendar {
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(Arc::new(CalendarSnapshot {
                open_days: Vec::new(),
                horizon: 0,
            })),
        }
    }

    pub fn from_days(days: &[CalendarDay]) -> Self {
        let cal = Self::empty();
        cal.replace(days);
        cal
    }

    /// Swap in a freshly loaded calendar (copy-on-refresh).
    pub fn replace(&self, days: &[CalendarDay]) {
        let mut open: Vec<u32> = days.iter().filter(|d| d.is_open).map(|d| d.cal_date).collect();
        open.sort_unstable();
        open.dedup();
        let horizon = days.iter().map(|d| d.cal_date).max().unwrap_or(0);
        *self.inner.write() = Arc::new(CalendarSnapshot {
            open_days: open,
            horizon,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().open_days.is_empty()
    }

    /// Greatest calendar date loaded; lookups beyond it require a refresh.
    pub fn horizon(&self) -> u32 {
        self.inner.read().horizon
    }

    pub fn needs_refresh(&self, date: u32) -> bool {
        date > self.horizon()
    }

    /// The greatest trading day the pipeline may claim at `now`: today when
    /// the upstream has published (past the data cutoff), otherwise the most
    /// recent prior trading day. Hard error on an empty calendar; a stage
    /// must never proceed with a speculative date.
    pub fn today_cap(&self, now: DateTime<FixedOffset>) -> Result<u32> {
        let snap = self.inner.read().clone();
        if snap.open_days.is_empty() {
            return Err(EtlError::EmptyCalendar);
        }
        let today = date_int(&now);
        let include_today = now.hour() >= DATA_CUTOFF_HOUR;
        let cap = snap
            .open_days
            .iter()
            .rev()
            .find(|&&d| if include_today { d <= today } else { d < today })
            .copied();
        cap.ok_or(EtlError::EmptyCalendar)
    }

    /// Smallest trading day strictly greater than `date`.
    pub fn next_trading_day(&self, date: u32) -> Option<u32> {
        let snap = self.inner.read().clone();
        let idx = snap.open_days.partition_point(|&d| d <= date);
        snap.open_days.get(idx).copied()
    }

    /// Greatest trading day strictly less than `date`.
    pub fn previous_trading_day(&self, date: u32) -> Option<u32> {
        let snap = self.inner.read().clone();
        let idx = snap.open_days.partition_point(|&d| d < date);
        idx.checked_sub(1).and_then(|i| snap.open_days.get(i)).copied()
    }

    /// Ordered trading days in `[a, b]`, inclusive on both ends.
    pub fn trading_days_between(&self, a: u32, b: u32) -> Vec<u32> {
        if a > b {
            return Vec::new();
        }
        let snap = self.inner.read().clone();
        let lo = snap.open_days.partition_point(|&d| d < a);
        let hi = snap.open_days.partition_point(|&d| d <= b);
        snap.open_days[lo..hi].to_vec()
    }
}

/// `now` rendered as a YYYYMMDD integer.
pub fn date_int(now: &DateTime<FixedOffset>) -> u32 {
    now.format("%Y%m%d")
        .to_string()
        .parse()
        .expect("formatted date is numeric")
}

/// Hours elapsed since the most recent market close at `now`. Negative
/// values (before close on a trading morning) clamp to zero.
pub fn hours_since_close(now: &DateTime<FixedOffset>) -> u32 {
    if now.hour() >= MARKET_CLOSE_HOUR {
        now.hour() - MARKET_CLOSE_HOUR
    } else {
        // Previous day's close: hours overnight plus today's elapsed hours.
        24 - MARKET_CLOSE_HOUR + now.hour()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(cal_date: u32, is_open: bool) -> CalendarDay {
        CalendarDay {
            exchange: "SSE".into(),
            cal_date,
            is_open,
            pretrade_date: None,
        }
    }

    fn fixture() -> TradeCalendar {
        TradeCalendar::from_days(&[
            day(20240110, true),
            day(20240111, true),
            day(20240112, false),
            day(20240113, false),
            day(20240114, false),
            day(20240115, true),
        ])
    }

    fn at(date: &str, hour: u32) -> DateTime<FixedOffset> {
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        offset
            .with_ymd_and_hms(
                date[..4].parse().unwrap(),
                date[4..6].parse().unwrap(),
                date[6..8].parse().unwrap(),
                hour,
                0,
                0,
            )
            .unwrap()
    }

    #[test]
    fn today_cap_skips_closed_days() {
        let cal = fixture();
        // 20240112 is closed, so the cap falls back to the 11th.
        assert_eq!(cal.today_cap(at("20240112", 18)).unwrap(), 20240111);
    }

    #[test]
    fn today_cap_excludes_today_before_cutoff() {
        let cal = fixture();
        assert_eq!(cal.today_cap(at("20240111", 9)).unwrap(), 20240110);
        assert_eq!(cal.today_cap(at("20240111", 17)).unwrap(), 20240111);
    }

    #[test]
    fn empty_calendar_is_a_hard_error() {
        let cal = TradeCalendar::empty();
        assert!(matches!(
            cal.today_cap(at("20240111", 17)),
            Err(EtlError::EmptyCalendar)
        ));
    }

    #[test]
    fn next_and_previous() {
        let cal = fixture();
        assert_eq!(cal.next_trading_day(20240111), Some(20240115));
        assert_eq!(cal.next_trading_day(20240110), Some(20240111));
        assert_eq!(cal.previous_trading_day(20240115), Some(20240111));
        assert_eq!(cal.previous_trading_day(20240110), None);
    }

    #[test]
    fn between_is_inclusive_and_ordered() {
        let cal = fixture();
        assert_eq!(
            cal.trading_days_between(20240110, 20240115),
            vec![20240110, 20240111, 20240115]
        );
        assert_eq!(cal.trading_days_between(20240112, 20240114), Vec::<u32>::new());
        assert!(cal.trading_days_between(20240115, 20240110).is_empty());
    }

    #[test]
    fn refresh_extends_horizon() {
        let cal = fixture();
        assert_eq!(cal.horizon(), 20240115);
        assert!(cal.needs_refresh(20240116));
        cal.replace(&[day(20240110, true), day(20240116, true)]);
        assert_eq!(cal.horizon(), 20240116);
        assert!(!cal.needs_refresh(20240116));
    }

    #[test]
    fn close_lag_arithmetic() {
        assert_eq!(hours_since_close(&at("20240111", 17)), 2);
        assert_eq!(hours_since_close(&at("20240112", 8)), 17);
    }
}
