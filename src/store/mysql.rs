//! `Store` implementation over the MySQL warehouse.
//!
//! All metadata operations are single-row transactions; fact upserts are one
//! transaction per page. Nothing here ever opens a transaction spanning both
//! ingestion and watermark advancement, so a partial ingest failure can
//! never roll back already-written fact rows.

use async_trait::async_trait;
use sqlx::MySqlPool;
use tracing::{debug, warn};

use crate::error::{EtlError, Result};
use crate::vendor::DataPage;

use super::models::{
    CalendarDay, GuardRow, QualityRow, RunLogRow, RunStatus, TableStats, WatermarkRow,
};
use super::writer::{write_batch, UPSERT_BATCH_SIZE};
use super::Store;

pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl Store for MySqlStore {
    async fn load_calendar(&self, exchange: &str, start: u32) -> Result<Vec<CalendarDay>> {
        let rows = sqlx::query_as::<_, CalendarDay>(
            "SELECT exchange, cal_date, is_open, pretrade_date FROM dim_trade_cal \
             WHERE exchange = ? AND cal_date >= ? ORDER BY cal_date",
        )
        .bind(exchange)
        .bind(start)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn watermark(&self, api: &str) -> Result<Option<WatermarkRow>> {
        let row = sqlx::query_as::<_, WatermarkRow>(
            "SELECT api_name, water_mark, status, last_run_at, last_err \
             FROM meta_etl_watermark WHERE api_name = ?",
        )
        .bind(api)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn init_watermark(&self, api: &str, value: u32) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta_etl_watermark (api_name, water_mark, status, last_run_at) \
             VALUES (?, ?, 'SUCCESS', NOW()) \
             ON DUPLICATE KEY UPDATE api_name = api_name",
        )
        .bind(api)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn advance_watermark(&self, api: &str, value: u32, cap: u32) -> Result<()> {
        if value > cap {
            return Err(EtlError::FutureWatermark {
                api: api.to_string(),
                value,
                cap,
            });
        }
        let result = sqlx::query(
            "UPDATE meta_etl_watermark \
             SET water_mark = ?, status = 'SUCCESS', last_run_at = NOW(), last_err = NULL \
             WHERE api_name = ? AND water_mark < ?",
        )
        .bind(value)
        .bind(api)
        .bind(value)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let current = self
                .watermark(api)
                .await?
                .map(|w| w.water_mark)
                .ok_or_else(|| {
                    EtlError::StoreWrite(format!("watermark row for {api} does not exist"))
                })?;
            return Err(EtlError::StaleWatermark {
                api: api.to_string(),
                value,
                current,
            });
        }
        debug!(api, water_mark = value, "watermark advanced");
        Ok(())
    }

    async fn mark_watermark_running(&self, api: &str) -> Result<()> {
        sqlx::query(
            "UPDATE meta_etl_watermark SET status = 'RUNNING', last_run_at = NOW() \
             WHERE api_name = ?",
        )
        .bind(api)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_watermark_failed(&self, api: &str, err: &str) -> Result<()> {
        sqlx::query(
            "UPDATE meta_etl_watermark \
             SET status = 'FAILED', last_run_at = NOW(), last_err = ? \
             WHERE api_name = ?",
        )
        .bind(err)
        .bind(api)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn watermarks(&self) -> Result<Vec<WatermarkRow>> {
        let rows = sqlx::query_as::<_, WatermarkRow>(
            "SELECT api_name, water_mark, status, last_run_at, last_err \
             FROM meta_etl_watermark ORDER BY api_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn open_run(&self, api: &str, run_type: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO meta_etl_run_log (api_name, run_type, start_at, status) \
             VALUES (?, ?, NOW(), 'RUNNING')",
        )
        .bind(api)
        .bind(run_type)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_id() as i64)
    }

    async fn close_run(
        &self,
        run_id: i64,
        status: RunStatus,
        request_count: u32,
        fail_count: u32,
        err: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE meta_etl_run_log \
             SET end_at = NOW(), status = ?, err_msg = ?, request_count = ?, fail_count = ? \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(err)
        .bind(request_count)
        .bind(fail_count)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reclaim_zombie_runs(&self, api: &str, older_than_min: u32) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE meta_etl_run_log \
             SET status = 'FAILED', end_at = NOW(), err_msg = 'zombie-reclaimed' \
             WHERE api_name = ? AND status = 'RUNNING' \
               AND start_at < NOW() - INTERVAL ? MINUTE",
        )
        .bind(api)
        .bind(older_than_min)
        .execute(&self.pool)
        .await?;
        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            warn!(api, reclaimed, "reclaimed zombie RUNNING rows");
        }
        Ok(reclaimed)
    }

    async fn live_run(&self, api: &str) -> Result<Option<RunLogRow>> {
        let row = sqlx::query_as::<_, RunLogRow>(
            "SELECT id, api_name, run_type, start_at, end_at, request_count, fail_count, \
                    status, err_msg \
             FROM meta_etl_run_log \
             WHERE api_name = ? AND status = 'RUNNING' \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(api)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn recent_runs(&self, since_hours: u32) -> Result<Vec<RunLogRow>> {
        let rows = sqlx::query_as::<_, RunLogRow>(
            "SELECT id, api_name, run_type, start_at, end_at, request_count, fail_count, \
                    status, err_msg \
             FROM meta_etl_run_log \
             WHERE start_at >= NOW() - INTERVAL ? HOUR \
             ORDER BY id DESC",
        )
        .bind(since_hours)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn guard(&self, task: &str, key: &str) -> Result<Option<GuardRow>> {
        let row = sqlx::query_as::<_, GuardRow>(
            "SELECT task_name, idempotency_key, status, attempt, timeout_sec, err_msg \
             FROM meta_retry_guard WHERE task_name = ? AND idempotency_key = ?",
        )
        .bind(task)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_guard(
        &self,
        task: &str,
        key: &str,
        status: RunStatus,
        attempt: u32,
        timeout_sec: u32,
        err: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta_retry_guard \
               (task_name, idempotency_key, status, attempt, started_at, finished_at, \
                timeout_sec, err_msg) \
             VALUES (?, ?, ?, ?, NOW(), NULL, ?, ?) \
             ON DUPLICATE KEY UPDATE \
               status = VALUES(status), \
               attempt = VALUES(attempt), \
               timeout_sec = VALUES(timeout_sec), \
               err_msg = VALUES(err_msg), \
               started_at = IF(VALUES(status) = 'RUNNING', NOW(), started_at), \
               finished_at = IF(VALUES(status) IN ('SUCCESS', 'FAILED'), NOW(), finished_at)",
        )
        .bind(task)
        .bind(key)
        .bind(status.as_str())
        .bind(attempt)
        .bind(timeout_sec)
        .bind(err)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_quality(
        &self,
        check_date: u32,
        check_name: &str,
        status: &str,
        detail: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta_quality_check_log (check_date, check_name, status, detail) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(check_date)
        .bind(check_name)
        .bind(status)
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_quality(&self, since_hours: u32) -> Result<Vec<QualityRow>> {
        let rows = sqlx::query_as::<_, QualityRow>(
            "SELECT id, check_date, check_name, status, detail, created_at \
             FROM meta_quality_check_log \
             WHERE created_at >= NOW() - INTERVAL ? HOUR \
             ORDER BY id DESC",
        )
        .bind(since_hours)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn upsert(&self, table: &str, page: &DataPage, primary_key: &[&str]) -> Result<u64> {
        if page.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut from = 0;
        while from < page.n_rows() {
            let to = (from + UPSERT_BATCH_SIZE).min(page.n_rows());
            write_batch(&mut tx, table, page, from, to).await?;
            from = to;
        }
        tx.commit().await?;
        Ok(page.distinct_keys(primary_key) as u64)
    }

    async fn table_stats(&self, table: &str, date_column: &str) -> Result<TableStats> {
        let (max_date, row_count): (Option<u32>, i64) = sqlx::query_as(&format!(
            "SELECT MAX(`{date_column}`), COUNT(*) FROM `{table}`"
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(TableStats {
            max_date,
            row_count: row_count as u64,
        })
    }

    async fn row_count_for_date(&self, table: &str, date_column: &str, date: u32) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM `{table}` WHERE `{date_column}` = ?"
        ))
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn null_ratio(
        &self,
        table: &str,
        column: &str,
        date_column: &str,
        date: u32,
    ) -> Result<f64> {
        let ratio: Option<f64> = sqlx::query_scalar(&format!(
            "SELECT CAST(AVG(`{column}` IS NULL) AS DOUBLE) \
             FROM `{table}` WHERE `{date_column}` = ?"
        ))
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(ratio.unwrap_or(0.0))
    }

    async fn join_coverage(&self, table: &str, against_table: &str, date: u32) -> Result<f64> {
        let ratio: Option<f64> = sqlx::query_scalar(&format!(
            "SELECT CAST(AVG(t.ts_code IS NOT NULL) AS DOUBLE) \
             FROM `{against_table}` a \
             LEFT JOIN `{table}` t \
               ON t.trade_date = a.trade_date AND t.ts_code = a.ts_code \
             WHERE a.trade_date = ?"
        ))
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(ratio.unwrap_or(1.0))
    }

    async fn run_sql_transform(&self, sql: &str, start: u32, end: u32) -> Result<u64> {
        let result = sqlx::query(sql)
            .bind(start)
            .bind(end)
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) => EtlError::StoreWrite(db.message().to_string()),
                _ => EtlError::Database(e),
            })?;
        Ok(result.rows_affected())
    }
}
