//! Static catalog of upstream endpoints.
//!
//! Every ingestable endpoint is described once: how its cursor moves, which
//! rate bucket it draws from, where its rows land, and how late its data
//! becomes available after the close. Stage definitions reference
//! descriptors by name; there is no per-endpoint subclassing anywhere.

/// How the incremental cursor for an endpoint is keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    /// One request per trading day, `trade_date` parameter.
    TradeDate,
    /// One windowed request per run, `start_date`/`end_date` announcement
    /// window; used by financial endpoints keyed on disclosure date.
    AnnDate,
    /// Full refresh of a dimension table; no date parameter.
    Snapshot,
    /// The trade calendar itself; bootstraps with a plain `start_date` so it
    /// never depends on an already-loaded calendar.
    Calendar,
}

/// Static definition of one upstream endpoint.
#[derive(Debug, Clone)]
pub struct ApiDescriptor {
    pub name: &'static str,
    pub cursor: CursorKind,
    pub bucket: &'static str,
    pub page_size: u32,
    pub table: &'static str,
    pub primary_key: &'static [&'static str],
    pub columns: &'static [&'static str],
    /// Hours after market close before this endpoint's data is published.
    pub readiness_lag_hours: u32,
    /// Core endpoints are hard requirements; feature endpoints may be
    /// downgraded under a lenient policy.
    pub core: bool,
    pub tolerate_extra_columns: bool,
}

/// Default tokens/minute per bucket; `rate_limit.<bucket>` overrides.
pub const DEFAULT_BUCKET_RATES: &[(&str, u32)] = &[
    ("basic", 500),
    ("feature", 400),
    ("chips", 180),
    ("factor", 200),
    ("dividend", 480),
];

pub const CATALOG: &[ApiDescriptor] = &[
    ApiDescriptor {
        name: "trade_cal",
        cursor: CursorKind::Calendar,
        bucket: "basic",
        page_size: 5000,
        table: "dim_trade_cal",
        primary_key: &["exchange", "cal_date"],
        columns: &["exchange", "cal_date", "is_open", "pretrade_date"],
        readiness_lag_hours: 0,
        core: true,
        tolerate_extra_columns: false,
    },
    ApiDescriptor {
        name: "stock_basic",
        cursor: CursorKind::Snapshot,
        bucket: "basic",
        page_size: 8000,
        table: "dim_stock",
        primary_key: &["ts_code"],
        columns: &[
            "ts_code", "symbol", "name", "area", "industry", "market", "list_date",
            "delist_date", "is_hs",
        ],
        readiness_lag_hours: 0,
        core: true,
        tolerate_extra_columns: false,
    },
    ApiDescriptor {
        name: "daily",
        cursor: CursorKind::TradeDate,
        bucket: "basic",
        page_size: 6000,
        table: "ods_daily",
        primary_key: &["trade_date", "ts_code"],
        columns: &[
            "trade_date", "ts_code", "open", "high", "low", "close", "pre_close",
            "change", "pct_chg", "vol", "amount",
        ],
        readiness_lag_hours: 1,
        core: true,
        tolerate_extra_columns: false,
    },
    ApiDescriptor {
        name: "daily_basic",
        cursor: CursorKind::TradeDate,
        bucket: "basic",
        page_size: 6000,
        table: "ods_daily_basic",
        primary_key: &["trade_date", "ts_code"],
        columns: &[
            "trade_date", "ts_code", "close", "turnover_rate", "turnover_rate_f",
            "volume_ratio", "pe", "pe_ttm", "pb", "ps", "ps_ttm", "dv_ratio", "dv_ttm",
            "total_share", "float_share", "free_share", "total_mv", "circ_mv",
        ],
        readiness_lag_hours: 1,
        core: true,
        tolerate_extra_columns: false,
    },
    ApiDescriptor {
        name: "adj_factor",
        cursor: CursorKind::TradeDate,
        bucket: "basic",
        page_size: 6000,
        table: "ods_adj_factor",
        primary_key: &["trade_date", "ts_code"],
        columns: &["trade_date", "ts_code", "adj_factor"],
        readiness_lag_hours: 1,
        core: true,
        tolerate_extra_columns: false,
    },
    ApiDescriptor {
        name: "moneyflow",
        cursor: CursorKind::TradeDate,
        bucket: "feature",
        page_size: 6000,
        table: "ods_moneyflow",
        primary_key: &["trade_date", "ts_code"],
        columns: &[
            "trade_date", "ts_code", "buy_sm_amount", "sell_sm_amount", "buy_md_amount",
            "sell_md_amount", "buy_lg_amount", "sell_lg_amount", "buy_elg_amount",
            "sell_elg_amount", "net_mf_amount",
        ],
        readiness_lag_hours: 2,
        core: false,
        tolerate_extra_columns: true,
    },
    ApiDescriptor {
        name: "cyq_perf",
        cursor: CursorKind::TradeDate,
        bucket: "chips",
        page_size: 5000,
        table: "ods_cyq_perf",
        primary_key: &["trade_date", "ts_code"],
        columns: &[
            "trade_date", "ts_code", "his_low", "his_high", "cost_5pct", "cost_15pct",
            "cost_50pct", "cost_85pct", "cost_95pct", "weight_avg", "winner_rate",
        ],
        readiness_lag_hours: 4,
        core: false,
        tolerate_extra_columns: true,
    },
    ApiDescriptor {
        name: "stk_factor",
        cursor: CursorKind::TradeDate,
        bucket: "factor",
        page_size: 6000,
        table: "ods_stk_factor",
        primary_key: &["trade_date", "ts_code"],
        columns: &[
            "trade_date", "ts_code", "macd_dif", "macd_dea", "macd", "kdj_k", "kdj_d",
            "kdj_j", "rsi_6", "rsi_12", "rsi_24",
        ],
        readiness_lag_hours: 2,
        core: false,
        tolerate_extra_columns: true,
    },
    ApiDescriptor {
        name: "margin_detail",
        cursor: CursorKind::TradeDate,
        bucket: "feature",
        page_size: 6000,
        table: "ods_margin_detail",
        primary_key: &["trade_date", "ts_code"],
        columns: &[
            "trade_date", "ts_code", "rzye", "rzmre", "rzche", "rqye", "rqmcl", "rzrqye",
        ],
        // Published the next morning; today's rows never exist same-day.
        readiness_lag_hours: 16,
        core: false,
        tolerate_extra_columns: true,
    },
    ApiDescriptor {
        name: "dividend",
        cursor: CursorKind::AnnDate,
        bucket: "dividend",
        page_size: 5000,
        table: "ods_dividend",
        primary_key: &["ts_code", "end_date", "ann_date"],
        columns: &[
            "ts_code", "end_date", "ann_date", "div_proc", "stk_div", "cash_div",
            "cash_div_tax", "record_date", "ex_date", "pay_date",
        ],
        readiness_lag_hours: 5,
        core: false,
        tolerate_extra_columns: true,
    },
    ApiDescriptor {
        name: "fina_indicator",
        cursor: CursorKind::AnnDate,
        bucket: "feature",
        page_size: 5000,
        table: "ods_fina_indicator",
        primary_key: &["ts_code", "end_date", "ann_date"],
        columns: &[
            "ts_code", "ann_date", "end_date", "roe", "grossprofit_margin",
            "debt_to_assets", "netprofit_margin", "op_income", "total_assets",
            "total_hldr_eqy",
        ],
        readiness_lag_hours: 5,
        core: false,
        tolerate_extra_columns: true,
    },
];

pub fn descriptor(name: &str) -> Option<&'static ApiDescriptor> {
    CATALOG.iter().find(|d| d.name == name)
}

/// Bucket rates merged from catalog defaults and configuration overrides.
pub fn bucket_rates(
    overrides: &std::collections::HashMap<String, u32>,
) -> Vec<(String, u32)> {
    DEFAULT_BUCKET_RATES
        .iter()
        .map(|(name, rate)| {
            let rate = overrides.get(*name).copied().unwrap_or(*rate);
            (name.to_string(), rate)
        })
        .collect()
}
