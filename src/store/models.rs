//! Row types for the metadata tables and shared store-side structs.

use chrono::NaiveDateTime;
use serde::Serialize;

/// Terminal and in-flight statuses shared by run log, watermark, and guard
/// rows. Stored as VARCHAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "RUNNING" => Some(RunStatus::Running),
            "SUCCESS" => Some(RunStatus::Success),
            "FAILED" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `dim_trade_cal` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CalendarDay {
    pub exchange: String,
    pub cal_date: u32,
    pub is_open: bool,
    pub pretrade_date: Option<u32>,
}

/// One `meta_etl_watermark` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WatermarkRow {
    pub api_name: String,
    pub water_mark: u32,
    pub status: String,
    pub last_run_at: Option<NaiveDateTime>,
    pub last_err: Option<String>,
}

/// One `meta_etl_run_log` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunLogRow {
    pub id: i64,
    pub api_name: String,
    pub run_type: String,
    pub start_at: NaiveDateTime,
    pub end_at: Option<NaiveDateTime>,
    pub request_count: u32,
    pub fail_count: u32,
    pub status: String,
    pub err_msg: Option<String>,
}

/// One `meta_retry_guard` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GuardRow {
    pub task_name: String,
    pub idempotency_key: String,
    pub status: String,
    pub attempt: u32,
    pub timeout_sec: u32,
    pub err_msg: Option<String>,
}

/// One `meta_quality_check_log` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QualityRow {
    pub id: i64,
    pub check_date: u32,
    pub check_name: String,
    pub status: String,
    pub detail: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Aggregate shape for freshness checks on a fact table.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableStats {
    pub max_date: Option<u32>,
    pub row_count: u64,
}
