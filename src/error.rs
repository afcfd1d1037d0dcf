//! Unified error types for the ETL engine.
//!
//! Each variant corresponds to one failure category the coordinator must
//! distinguish: transient upstream trouble is retried inside the Fetcher,
//! schema drift and auth failures are fatal, store-side failures freeze the
//! watermark, and guard rejections abort the invoker without touching the
//! run log.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transient upstream error: {0}")]
    TransientIo(String),

    #[error("upstream schema mismatch for {api}: {detail}")]
    UpstreamSchema { api: String, detail: String },

    #[error("fetch for {api} exhausted after {attempts} attempts: {last_cause}")]
    FetchExhausted {
        api: String,
        attempts: u32,
        last_cause: String,
    },

    #[error("store write error: {0}")]
    StoreWrite(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("concurrent run rejected for {api}: run {run_id} is still RUNNING")]
    ConcurrentRun { api: String, run_id: i64 },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("quality assertion failed: {0}")]
    QualityAssertion(String),

    #[error("watermark advance for {api} refused: {value} is beyond today cap {cap}")]
    FutureWatermark { api: String, value: u32, cap: u32 },

    #[error("watermark advance for {api} refused: {value} does not exceed current {current}")]
    StaleWatermark {
        api: String,
        value: u32,
        current: u32,
    },

    #[error("trade calendar is empty; cannot resolve today cap")]
    EmptyCalendar,

    #[error("stage {stage} exceeded its soft timeout of {minutes} minutes")]
    StageTimeout { stage: String, minutes: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EtlError {
    /// True for categories that may resolve on their own and are worth a
    /// retry at the fetch layer. Everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(self, EtlError::TransientIo(_))
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;

/// Truncate an error message so run-log rows stay bounded.
pub fn truncate_err(msg: &str, max: usize) -> String {
    if msg.len() <= max {
        return msg.to_string();
    }
    let mut cut = max;
    while cut > 0 && !msg.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &msg[..cut])
}
