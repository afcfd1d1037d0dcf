//! The relational store behind the warehouse.
//!
//! The engine talks to storage through the `Store` trait: fact upserts,
//! watermarks, the run log, the retry guard, and the quality log. Production
//! uses `MySqlStore`; the scenario suite substitutes an in-memory
//! implementation. Keeping the seam here means stage and pipeline logic
//! never sees SQL.

pub mod models;
pub mod mysql;
pub mod pool;
pub mod writer;

use async_trait::async_trait;

use crate::error::Result;
use crate::vendor::DataPage;
use models::{CalendarDay, GuardRow, QualityRow, RunLogRow, RunStatus, TableStats, WatermarkRow};

pub use mysql::MySqlStore;

#[async_trait]
pub trait Store: Send + Sync {
    // ── Calendar ─────────────────────────────────────────────────────

    /// All calendar rows for the exchange from `start` onward.
    async fn load_calendar(&self, exchange: &str, start: u32) -> Result<Vec<CalendarDay>>;

    // ── Watermarks ───────────────────────────────────────────────────

    async fn watermark(&self, api: &str) -> Result<Option<WatermarkRow>>;

    /// Create the watermark row if absent; existing rows are untouched.
    async fn init_watermark(&self, api: &str, value: u32) -> Result<()>;

    /// Advance to `value`. Refuses values beyond `cap` (no future
    /// watermarks) and values that do not exceed the current mark.
    async fn advance_watermark(&self, api: &str, value: u32, cap: u32) -> Result<()>;

    async fn mark_watermark_running(&self, api: &str) -> Result<()>;

    /// Record a failure; the watermark value itself is left unchanged.
    async fn mark_watermark_failed(&self, api: &str, err: &str) -> Result<()>;

    async fn watermarks(&self) -> Result<Vec<WatermarkRow>>;

    // ── Run log ──────────────────────────────────────────────────────

    /// Insert a RUNNING row and return its id.
    async fn open_run(&self, api: &str, run_type: &str) -> Result<i64>;

    async fn close_run(
        &self,
        run_id: i64,
        status: RunStatus,
        request_count: u32,
        fail_count: u32,
        err: Option<&str>,
    ) -> Result<()>;

    /// Flip RUNNING rows older than the threshold to FAILED; returns how
    /// many were reclaimed.
    async fn reclaim_zombie_runs(&self, api: &str, older_than_min: u32) -> Result<u64>;

    /// The most recent still-RUNNING row for `api`, if any.
    async fn live_run(&self, api: &str) -> Result<Option<RunLogRow>>;

    async fn recent_runs(&self, since_hours: u32) -> Result<Vec<RunLogRow>>;

    // ── Retry guard ──────────────────────────────────────────────────

    async fn guard(&self, task: &str, key: &str) -> Result<Option<GuardRow>>;

    /// Guard rows only suppress duplicate invocations; the watermark stays
    /// authoritative for data progress. A crash after a guard row reaches
    /// SUCCESS but before a watermark advance leaves the gap to the next
    /// invocation's incremental range. Rows are never deleted here.
    async fn upsert_guard(
        &self,
        task: &str,
        key: &str,
        status: RunStatus,
        attempt: u32,
        timeout_sec: u32,
        err: Option<&str>,
    ) -> Result<()>;

    // ── Quality log ──────────────────────────────────────────────────

    async fn log_quality(
        &self,
        check_date: u32,
        check_name: &str,
        status: &str,
        detail: &str,
    ) -> Result<()>;

    async fn recent_quality(&self, since_hours: u32) -> Result<Vec<QualityRow>>;

    // ── Fact tables ──────────────────────────────────────────────────

    /// Idempotent insert-or-replace of a whole page in one transaction.
    /// Returns the number of distinct primary keys written.
    async fn upsert(&self, table: &str, page: &DataPage, primary_key: &[&str]) -> Result<u64>;

    async fn table_stats(&self, table: &str, date_column: &str) -> Result<TableStats>;

    async fn row_count_for_date(&self, table: &str, date_column: &str, date: u32) -> Result<u64>;

    /// Fraction of nulls in `column` among rows on `date`.
    async fn null_ratio(
        &self,
        table: &str,
        column: &str,
        date_column: &str,
        date: u32,
    ) -> Result<f64>;

    /// Fraction of `against_table` rows on `date` whose (date, entity) key
    /// also exists in `table`. 1.0 when `against_table` has no rows.
    async fn join_coverage(&self, table: &str, against_table: &str, date: u32) -> Result<f64>;

    /// Execute one transform statement with `(start, end)` bound; returns
    /// affected rows. The statement body is collaborator territory.
    async fn run_sql_transform(&self, sql: &str, start: u32, end: u32) -> Result<u64>;
}
