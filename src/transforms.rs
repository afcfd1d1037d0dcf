//! Built-in layer transforms.
//!
//! Each transform is one idempotent `INSERT ... SELECT ... ON DUPLICATE KEY
//! UPDATE` between warehouse layers, bound to a `(start, end)` date window.
//! The statements here are deliberately thin plumbing; the scoring formulas
//! and indicator math proper are collaborator territory and plug in through
//! the same `StageExec` seam.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::EtlContext;
use crate::error::Result;
use crate::stage::StageExec;

/// A transform whose body is a single parameterized SQL statement.
pub struct SqlTransform {
    name: &'static str,
    sql: &'static str,
}

impl SqlTransform {
    pub fn new(name: &'static str, sql: &'static str) -> Arc<dyn StageExec> {
        Arc::new(Self { name, sql })
    }
}

#[async_trait]
impl StageExec for SqlTransform {
    async fn run(&self, ctx: &EtlContext, start: u32, end: u32) -> Result<u64> {
        tracing::debug!(transform = self.name, start, end, "running sql transform");
        ctx.store.run_sql_transform(self.sql, start, end).await
    }
}

/// ODS daily bars standardized with adjustment factor and valuation fields.
pub const DWD_STANDARDIZE_SQL: &str = "\
INSERT INTO dwd_daily_std \
  (trade_date, ts_code, open, high, low, close, pct_chg, vol, amount, \
   adj_factor, turnover_rate, pe_ttm, pb, total_mv) \
SELECT d.trade_date, d.ts_code, d.open, d.high, d.low, d.close, d.pct_chg, \
       d.vol, d.amount, a.adj_factor, b.turnover_rate, b.pe_ttm, b.pb, b.total_mv \
FROM ods_daily d \
LEFT JOIN ods_adj_factor a \
  ON a.trade_date = d.trade_date AND a.ts_code = d.ts_code \
LEFT JOIN ods_daily_basic b \
  ON b.trade_date = d.trade_date AND b.ts_code = d.ts_code \
WHERE d.trade_date BETWEEN ? AND ? \
ON DUPLICATE KEY UPDATE \
  open=VALUES(open), high=VALUES(high), low=VALUES(low), close=VALUES(close), \
  pct_chg=VALUES(pct_chg), vol=VALUES(vol), amount=VALUES(amount), \
  adj_factor=VALUES(adj_factor), turnover_rate=VALUES(turnover_rate), \
  pe_ttm=VALUES(pe_ttm), pb=VALUES(pb), total_mv=VALUES(total_mv)";

/// Financial indicators snapshotted by announcement window.
pub const DWD_FINA_SNAPSHOT_SQL: &str = "\
INSERT INTO dwd_fina_snapshot \
  (ts_code, ann_date, end_date, roe, grossprofit_margin, debt_to_assets, \
   netprofit_margin) \
SELECT f.ts_code, f.ann_date, f.end_date, f.roe, f.grossprofit_margin, \
       f.debt_to_assets, f.netprofit_margin \
FROM ods_fina_indicator f \
WHERE f.ann_date BETWEEN ? AND ? \
ON DUPLICATE KEY UPDATE \
  roe=VALUES(roe), grossprofit_margin=VALUES(grossprofit_margin), \
  debt_to_assets=VALUES(debt_to_assets), netprofit_margin=VALUES(netprofit_margin)";

/// Daily feature vector: capital flow, chip distribution, and technicals
/// joined onto the standardized bar.
pub const DWS_FEATURES_SQL: &str = "\
INSERT INTO dws_stock_features \
  (trade_date, ts_code, pct_chg, turnover_rate, net_mf_amount, winner_rate, \
   cost_50pct, macd, rsi_12) \
SELECT s.trade_date, s.ts_code, s.pct_chg, s.turnover_rate, m.net_mf_amount, \
       c.winner_rate, c.cost_50pct, k.macd, k.rsi_12 \
FROM dwd_daily_std s \
LEFT JOIN ods_moneyflow m \
  ON m.trade_date = s.trade_date AND m.ts_code = s.ts_code \
LEFT JOIN ods_cyq_perf c \
  ON c.trade_date = s.trade_date AND c.ts_code = s.ts_code \
LEFT JOIN ods_stk_factor k \
  ON k.trade_date = s.trade_date AND k.ts_code = s.ts_code \
WHERE s.trade_date BETWEEN ? AND ? \
ON DUPLICATE KEY UPDATE \
  pct_chg=VALUES(pct_chg), turnover_rate=VALUES(turnover_rate), \
  net_mf_amount=VALUES(net_mf_amount), winner_rate=VALUES(winner_rate), \
  cost_50pct=VALUES(cost_50pct), macd=VALUES(macd), rsi_12=VALUES(rsi_12)";

/// Point-in-time financial join: only announcements at or before the trade
/// date are visible, preventing look-ahead.
pub const DWS_PIT_REFRESH_SQL: &str = "\
INSERT INTO dws_pit_fina (trade_date, ts_code, roe, debt_to_assets, ann_date) \
SELECT s.trade_date, s.ts_code, f.roe, f.debt_to_assets, f.ann_date \
FROM dwd_daily_std s \
JOIN dwd_fina_snapshot f ON f.ts_code = s.ts_code \
  AND f.ann_date = ( \
    SELECT MAX(f2.ann_date) FROM dwd_fina_snapshot f2 \
    WHERE f2.ts_code = s.ts_code AND f2.ann_date <= s.trade_date) \
WHERE s.trade_date BETWEEN ? AND ? \
ON DUPLICATE KEY UPDATE \
  roe=VALUES(roe), debt_to_assets=VALUES(debt_to_assets), ann_date=VALUES(ann_date)";

/// Margin balance sentiment from the T+1 margin detail feed.
pub const DWS_LEVERAGE_SQL: &str = "\
INSERT INTO dws_leverage (trade_date, ts_code, rzye, rqye, rzrqye, net_margin_buy) \
SELECT m.trade_date, m.ts_code, m.rzye, m.rqye, m.rzrqye, m.rzmre - m.rzche \
FROM ods_margin_detail m \
WHERE m.trade_date BETWEEN ? AND ? \
ON DUPLICATE KEY UPDATE \
  rzye=VALUES(rzye), rqye=VALUES(rqye), rzrqye=VALUES(rzrqye), \
  net_margin_buy=VALUES(net_margin_buy)";

/// Composite daily score over the feature vector. The weighting here is a
/// placeholder ranking; strategy-grade scoring replaces this exec.
pub const ADS_SCORES_SQL: &str = "\
INSERT INTO ads_stock_score (trade_date, ts_code, momentum, capital, total_score) \
SELECT f.trade_date, f.ts_code, \
       COALESCE(f.rsi_12, 50) / 100, \
       COALESCE(f.winner_rate, 50) / 100, \
       0.6 * COALESCE(f.rsi_12, 50) / 100 + 0.4 * COALESCE(f.winner_rate, 50) / 100 \
FROM dws_stock_features f \
WHERE f.trade_date BETWEEN ? AND ? \
ON DUPLICATE KEY UPDATE \
  momentum=VALUES(momentum), capital=VALUES(capital), total_score=VALUES(total_score)";

pub fn dwd_standardize() -> Arc<dyn StageExec> {
    SqlTransform::new("dwd_standardize", DWD_STANDARDIZE_SQL)
}

pub fn dwd_fina_snapshot() -> Arc<dyn StageExec> {
    SqlTransform::new("dwd_fina_snapshot", DWD_FINA_SNAPSHOT_SQL)
}

pub fn dws_features() -> Arc<dyn StageExec> {
    SqlTransform::new("dws_features", DWS_FEATURES_SQL)
}

pub fn dws_pit_refresh() -> Arc<dyn StageExec> {
    SqlTransform::new("dws_pit_refresh", DWS_PIT_REFRESH_SQL)
}

pub fn dws_leverage() -> Arc<dyn StageExec> {
    SqlTransform::new("dws_leverage", DWS_LEVERAGE_SQL)
}

pub fn ads_scores() -> Arc<dyn StageExec> {
    SqlTransform::new("ads_scores", ADS_SCORES_SQL)
}
