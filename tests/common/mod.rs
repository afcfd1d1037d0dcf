//! Shared fixtures for the scenario suite: an in-memory `Store`, a
//! scripted `Vendor`, a pinned clock, and a context builder.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, TimeZone, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use ashare_etl::calendar::{Clock, TradeCalendar};
use ashare_etl::config::{
    BatchConfig, Config, EtlConfig, LoggingConfig, StoreConfig, UpstreamConfig,
};
use ashare_etl::context::EtlContext;
use ashare_etl::error::{EtlError, Result};
use ashare_etl::events::EventBus;
use ashare_etl::limiter::RateBuckets;
use ashare_etl::registry::{bucket_rates, descriptor};
use ashare_etl::store::models::{
    CalendarDay, GuardRow, QualityRow, RunLogRow, RunStatus, TableStats, WatermarkRow,
};
use ashare_etl::store::Store;
use ashare_etl::vendor::{DataPage, Params, Value, Vendor, VendorError};

// ── Pinned clock ───────────────────────────────────────────────────

pub struct FixedClock {
    now: DateTime<FixedOffset>,
}

impl FixedClock {
    /// `date` as YYYYMMDD, `hour`/`minute` in market time (UTC+8).
    pub fn at(date: u32, hour: u32, minute: u32) -> Self {
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let now = offset
            .with_ymd_and_hms(
                (date / 10000) as i32,
                date / 100 % 100,
                date % 100,
                hour,
                minute,
                0,
            )
            .unwrap();
        Self { now }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.now
    }
}

// ── In-memory store ────────────────────────────────────────────────

type Row = HashMap<String, Value>;

#[derive(Default)]
struct MemState {
    watermarks: HashMap<String, WatermarkRow>,
    runs: Vec<RunLogRow>,
    next_run_id: i64,
    guards: HashMap<(String, String), GuardRow>,
    quality: Vec<QualityRow>,
    calendar: Vec<CalendarDay>,
    tables: HashMap<String, BTreeMap<String, Row>>,
    transforms: Vec<(String, u32, u32)>,
}

#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // Seeding helpers.

    pub fn seed_calendar(&self, days: &[CalendarDay]) {
        self.state.lock().calendar = days.to_vec();
    }

    pub fn seed_watermark(&self, api: &str, value: u32) {
        self.state.lock().watermarks.insert(
            api.to_string(),
            WatermarkRow {
                api_name: api.to_string(),
                water_mark: value,
                status: RunStatus::Success.as_str().to_string(),
                last_run_at: Some(Utc::now().naive_utc()),
                last_err: None,
            },
        );
    }

    /// Insert a run-log row whose start time is `age_minutes` in the past.
    pub fn seed_running_run(&self, api: &str, age_minutes: i64) -> i64 {
        let mut state = self.state.lock();
        state.next_run_id += 1;
        let id = state.next_run_id;
        state.runs.push(RunLogRow {
            id,
            api_name: api.to_string(),
            run_type: "seeded".to_string(),
            start_at: (Utc::now() - ChronoDuration::minutes(age_minutes)).naive_utc(),
            end_at: None,
            request_count: 0,
            fail_count: 0,
            status: RunStatus::Running.as_str().to_string(),
            err_msg: None,
        });
        id
    }

    // Inspection helpers.

    pub fn watermark_of(&self, api: &str) -> Option<u32> {
        self.state.lock().watermarks.get(api).map(|w| w.water_mark)
    }

    pub fn runs(&self) -> Vec<RunLogRow> {
        self.state.lock().runs.clone()
    }

    pub fn guard_row(&self, task: &str, key: &str) -> Option<GuardRow> {
        self.state
            .lock()
            .guards
            .get(&(task.to_string(), key.to_string()))
            .cloned()
    }

    pub fn quality_rows(&self) -> Vec<QualityRow> {
        self.state.lock().quality.clone()
    }

    pub fn table_rows(&self, table: &str) -> BTreeMap<String, Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn transform_calls(&self) -> Vec<(String, u32, u32)> {
        self.state.lock().transforms.clone()
    }

    fn date_of(row: &Row, date_column: &str) -> Option<u32> {
        match row.get(date_column) {
            Some(Value::Int(i)) => Some(*i as u32),
            Some(Value::Text(s)) => s.parse().ok(),
            _ => None,
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn load_calendar(&self, _exchange: &str, start: u32) -> Result<Vec<CalendarDay>> {
        Ok(self
            .state
            .lock()
            .calendar
            .iter()
            .filter(|d| d.cal_date >= start)
            .cloned()
            .collect())
    }

    async fn watermark(&self, api: &str) -> Result<Option<WatermarkRow>> {
        Ok(self.state.lock().watermarks.get(api).cloned())
    }

    async fn init_watermark(&self, api: &str, value: u32) -> Result<()> {
        let mut state = self.state.lock();
        state
            .watermarks
            .entry(api.to_string())
            .or_insert_with(|| WatermarkRow {
                api_name: api.to_string(),
                water_mark: value,
                status: RunStatus::Success.as_str().to_string(),
                last_run_at: Some(Utc::now().naive_utc()),
                last_err: None,
            });
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
        let mut state = self.state.lock();
        let row = state.watermarks.get_mut(api).ok_or_else(|| {
            EtlError::StoreWrite(format!("watermark row for {api} does not exist"))
        })?;
        if value <= row.water_mark {
            return Err(EtlError::StaleWatermark {
                api: api.to_string(),
                value,
                current: row.water_mark,
            });
        }
        row.water_mark = value;
        row.status = RunStatus::Success.as_str().to_string();
        row.last_run_at = Some(Utc::now().naive_utc());
        row.last_err = None;
        Ok(())
    }

    async fn mark_watermark_running(&self, api: &str) -> Result<()> {
        if let Some(row) = self.state.lock().watermarks.get_mut(api) {
            row.status = RunStatus::Running.as_str().to_string();
        }
        Ok(())
    }

    async fn mark_watermark_failed(&self, api: &str, err: &str) -> Result<()> {
        if let Some(row) = self.state.lock().watermarks.get_mut(api) {
            row.status = RunStatus::Failed.as_str().to_string();
            row.last_err = Some(err.to_string());
        }
        Ok(())
    }

    async fn watermarks(&self) -> Result<Vec<WatermarkRow>> {
        Ok(self.state.lock().watermarks.values().cloned().collect())
    }

    async fn open_run(&self, api: &str, run_type: &str) -> Result<i64> {
        let mut state = self.state.lock();
        state.next_run_id += 1;
        let id = state.next_run_id;
        state.runs.push(RunLogRow {
            id,
            api_name: api.to_string(),
            run_type: run_type.to_string(),
            start_at: Utc::now().naive_utc(),
            end_at: None,
            request_count: 0,
            fail_count: 0,
            status: RunStatus::Running.as_str().to_string(),
            err_msg: None,
        });
        Ok(id)
    }

    async fn close_run(
        &self,
        run_id: i64,
        status: RunStatus,
        request_count: u32,
        fail_count: u32,
        err: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(run) = state.runs.iter_mut().find(|r| r.id == run_id) {
            run.end_at = Some(Utc::now().naive_utc());
            run.status = status.as_str().to_string();
            run.request_count = request_count;
            run.fail_count = fail_count;
            run.err_msg = err.map(|s| s.to_string());
        }
        Ok(())
    }

    async fn reclaim_zombie_runs(&self, api: &str, older_than_min: u32) -> Result<u64> {
        let cutoff = (Utc::now() - ChronoDuration::minutes(older_than_min as i64)).naive_utc();
        let mut reclaimed = 0;
        for run in self.state.lock().runs.iter_mut() {
            if run.api_name == api
                && run.status == RunStatus::Running.as_str()
                && run.start_at < cutoff
            {
                run.status = RunStatus::Failed.as_str().to_string();
                run.end_at = Some(Utc::now().naive_utc());
                run.err_msg = Some("zombie-reclaimed".to_string());
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn live_run(&self, api: &str) -> Result<Option<RunLogRow>> {
        Ok(self
            .state
            .lock()
            .runs
            .iter()
            .rev()
            .find(|r| r.api_name == api && r.status == RunStatus::Running.as_str())
            .cloned())
    }

    async fn recent_runs(&self, since_hours: u32) -> Result<Vec<RunLogRow>> {
        let cutoff = (Utc::now() - ChronoDuration::hours(since_hours as i64)).naive_utc();
        Ok(self
            .state
            .lock()
            .runs
            .iter()
            .filter(|r| r.start_at >= cutoff)
            .cloned()
            .collect())
    }

    async fn guard(&self, task: &str, key: &str) -> Result<Option<GuardRow>> {
        Ok(self
            .state
            .lock()
            .guards
            .get(&(task.to_string(), key.to_string()))
            .cloned())
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
        self.state.lock().guards.insert(
            (task.to_string(), key.to_string()),
            GuardRow {
                task_name: task.to_string(),
                idempotency_key: key.to_string(),
                status: status.as_str().to_string(),
                attempt,
                timeout_sec,
                err_msg: err.map(|s| s.to_string()),
            },
        );
        Ok(())
    }

    async fn log_quality(
        &self,
        check_date: u32,
        check_name: &str,
        status: &str,
        detail: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let id = state.quality.len() as i64 + 1;
        state.quality.push(QualityRow {
            id,
            check_date,
            check_name: check_name.to_string(),
            status: status.to_string(),
            detail: Some(detail.to_string()),
            created_at: Utc::now().naive_utc(),
        });
        Ok(())
    }

    async fn recent_quality(&self, _since_hours: u32) -> Result<Vec<QualityRow>> {
        Ok(self.state.lock().quality.clone())
    }

    async fn upsert(&self, table: &str, page: &DataPage, primary_key: &[&str]) -> Result<u64> {
        if page.is_empty() {
            return Ok(0);
        }
        let columns: Vec<String> = page.column_names().map(|s| s.to_string()).collect();
        let mut state = self.state.lock();
        let rows = state.tables.entry(table.to_string()).or_default();
        for i in 0..page.n_rows() {
            let cells = page.row(i);
            let row: Row = columns
                .iter()
                .cloned()
                .zip(cells.iter().map(|v| (*v).clone()))
                .collect();
            let key = primary_key
                .iter()
                .map(|pk| row.get(*pk).map(|v| v.key_repr()).unwrap_or_default())
                .collect::<Vec<_>>()
                .join("|");
            rows.insert(key, row);
        }
        Ok(page.distinct_keys(primary_key) as u64)
    }

    async fn table_stats(&self, table: &str, date_column: &str) -> Result<TableStats> {
        let state = self.state.lock();
        let rows = match state.tables.get(table) {
            Some(r) => r,
            None => return Ok(TableStats::default()),
        };
        let max_date = rows
            .values()
            .filter_map(|r| Self::date_of(r, date_column))
            .max();
        Ok(TableStats {
            max_date,
            row_count: rows.len() as u64,
        })
    }

    async fn row_count_for_date(&self, table: &str, date_column: &str, date: u32) -> Result<u64> {
        let state = self.state.lock();
        Ok(state
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|r| Self::date_of(r, date_column) == Some(date))
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn null_ratio(
        &self,
        table: &str,
        column: &str,
        date_column: &str,
        date: u32,
    ) -> Result<f64> {
        let state = self.state.lock();
        let rows: Vec<&Row> = match state.tables.get(table) {
            Some(rows) => rows
                .values()
                .filter(|r| Self::date_of(r, date_column) == Some(date))
                .collect(),
            None => return Ok(0.0),
        };
        if rows.is_empty() {
            return Ok(0.0);
        }
        let nulls = rows
            .iter()
            .filter(|r| matches!(r.get(column), None | Some(Value::Null)))
            .count();
        Ok(nulls as f64 / rows.len() as f64)
    }

    async fn join_coverage(&self, table: &str, against_table: &str, date: u32) -> Result<f64> {
        let state = self.state.lock();
        let against: Vec<&Row> = match state.tables.get(against_table) {
            Some(rows) => rows
                .values()
                .filter(|r| Self::date_of(r, "trade_date") == Some(date))
                .collect(),
            None => return Ok(1.0),
        };
        if against.is_empty() {
            return Ok(1.0);
        }
        let target = state.tables.get(table);
        let covered = against
            .iter()
            .filter(|r| {
                let code = match r.get("ts_code") {
                    Some(v) => v.key_repr(),
                    None => return false,
                };
                target
                    .map(|rows| {
                        rows.values().any(|t| {
                            Self::date_of(t, "trade_date") == Some(date)
                                && t.get("ts_code").map(|v| v.key_repr()) == Some(code.clone())
                        })
                    })
                    .unwrap_or(false)
            })
            .count();
        Ok(covered as f64 / against.len() as f64)
    }

    async fn run_sql_transform(&self, sql: &str, start: u32, end: u32) -> Result<u64> {
        self.state
            .lock()
            .transforms
            .push((sql.to_string(), start, end));
        Ok(0)
    }
}

// ── Scripted vendor ────────────────────────────────────────────────

pub enum Reply {
    /// HTTP-level failure with this status.
    Status(u16),
    Throttled,
    /// A page with zero rows.
    Empty,
    /// A well-formed page with this many rows.
    Rows(usize),
}

#[derive(Default)]
pub struct ScriptedVendor {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
    pub default_rows: usize,
}

impl ScriptedVendor {
    pub fn new(default_rows: usize) -> Arc<Self> {
        Arc::new(Self {
            default_rows,
            ..Default::default()
        })
    }

    /// Queue replies for a request key: `"daily:20240113"` for trade-date
    /// calls, or the bare api name for the rest.
    pub fn script(&self, key: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .entry(key.to_string())
            .or_default()
            .extend(replies);
    }

    /// All request keys, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn request_key(api_name: &str, params: &Params) -> String {
        if let Some(d) = params.get("trade_date").and_then(|v| v.as_str()) {
            return format!("{api_name}:{d}");
        }
        if let Some(d) = params.get("start_date").and_then(|v| v.as_str()) {
            return format!("{api_name}:{d}");
        }
        api_name.to_string()
    }

    fn page_with(api_name: &str, params: &Params, rows: usize) -> DataPage {
        let api = descriptor(api_name).expect("scripted api in catalog");
        let date: i64 = params
            .get("trade_date")
            .or_else(|| params.get("end_date"))
            .or_else(|| params.get("start_date"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(20240101);
        let mut columns: IndexMap<String, Vec<Value>> = IndexMap::new();
        for col in api.columns {
            let values = (0..rows)
                .map(|i| match *col {
                    "trade_date" | "cal_date" | "ann_date" | "end_date" | "list_date"
                    | "record_date" | "ex_date" | "pay_date" | "pretrade_date" => Value::Int(date),
                    "ts_code" => Value::Text(format!("{:06}.SZ", i + 1)),
                    "exchange" => Value::Text("SSE".to_string()),
                    "is_open" => Value::Int(1),
                    "symbol" | "name" | "area" | "industry" | "market" | "is_hs"
                    | "div_proc" | "delist_date" => Value::Text(format!("t{i}")),
                    _ => Value::Float(1.0 + i as f64),
                })
                .collect();
            columns.insert(col.to_string(), values);
        }
        DataPage::from_columns(columns).expect("well-formed default page")
    }
}

#[async_trait]
impl Vendor for ScriptedVendor {
    async fn call(&self, api_name: &str, params: &Params) -> std::result::Result<DataPage, VendorError> {
        let key = Self::request_key(api_name, params);
        self.calls.lock().push(key.clone());
        let scripted = self.scripts.lock().get_mut(&key).and_then(|q| q.pop_front());
        match scripted {
            Some(Reply::Status(code)) => Err(VendorError::Status(code)),
            Some(Reply::Throttled) => Err(VendorError::Throttled),
            Some(Reply::Empty) => Ok(DataPage::empty()),
            Some(Reply::Rows(n)) => Ok(Self::page_with(api_name, params, n)),
            None => Ok(Self::page_with(api_name, params, self.default_rows)),
        }
    }
}

// ── Context builder ────────────────────────────────────────────────

pub fn open_day(cal_date: u32) -> CalendarDay {
    CalendarDay {
        exchange: "SSE".into(),
        cal_date,
        is_open: true,
        pretrade_date: None,
    }
}

pub fn closed_day(cal_date: u32) -> CalendarDay {
    CalendarDay {
        exchange: "SSE".into(),
        cal_date,
        is_open: false,
        pretrade_date: None,
    }
}

pub fn test_config() -> Config {
    Config {
        store: StoreConfig::default(),
        upstream: UpstreamConfig::default(),
        rate_limit: HashMap::new(),
        batch: BatchConfig {
            retry_times: 1,
            retry_delay_sec: 1,
            ..BatchConfig::default()
        },
        pipeline: HashMap::new(),
        etl: EtlConfig {
            start_date: 20240101,
            exchange: "SSE".into(),
        },
        logging: LoggingConfig::default(),
    }
}

pub fn test_context(
    store: Arc<MemStore>,
    vendor: Arc<ScriptedVendor>,
    days: &[CalendarDay],
    clock: FixedClock,
) -> EtlContext {
    store.seed_calendar(days);
    let config = Arc::new(test_config());
    EtlContext {
        config: config.clone(),
        store,
        vendor,
        buckets: Arc::new(RateBuckets::new(bucket_rates(&config.rate_limit))),
        calendar: Arc::new(TradeCalendar::from_days(days)),
        clock: Arc::new(clock),
        events: Arc::new(EventBus::new(256)),
        cancel: CancellationToken::new(),
    }
}
