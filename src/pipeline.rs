//! The pipeline coordinator.
//!
//! A pipeline is an ordered stage list with a per-stage failure policy.
//! Stages run sequentially; between stages the coordinator verifies that
//! every declared input watermark has caught up to the next stage's target
//! range, and under a lenient policy it downgrades failures instead of
//! aborting. The coordinator is the only place where lenient vs strict is
//! decided.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::context::EtlContext;
use crate::error::{EtlError, Result};
use crate::events::EtlEvent;
use crate::quality::{has_high_failure, QualityCheck, Severity};
use crate::registry::descriptor;
use crate::stage::{run_stage, RangeArgs, StageDef, StageKind, StageOutcome};
use crate::transforms;

#[derive(Clone)]
pub struct PipelineDef {
    pub name: String,
    pub stages: Vec<StageDef>,
    /// Built-in default; config and the CLI flag can override.
    pub lenient_default: bool,
}

impl PipelineDef {
    /// Reject dependency cycles among stages at definition time. Edges run
    /// from the stage producing a name to every stage depending on it.
    pub fn validate(&self) -> Result<()> {
        let mut producer: HashMap<String, usize> = HashMap::new();
        for (idx, stage) in self.stages.iter().enumerate() {
            for name in stage.produces() {
                producer.entry(name).or_insert(idx);
            }
        }
        let edges: Vec<Vec<usize>> = self
            .stages
            .iter()
            .map(|stage| {
                stage
                    .depends_on
                    .iter()
                    .filter_map(|dep| producer.get(dep).copied())
                    .collect()
            })
            .collect();

        // DFS cycle detection over the dependency graph.
        fn visit(
            node: usize,
            edges: &[Vec<usize>],
            state: &mut [u8], // 0 unvisited, 1 in-stack, 2 done
        ) -> bool {
            state[node] = 1;
            for &dep in &edges[node] {
                if dep == node {
                    continue; // a refresh stage may re-read its own output
                }
                let dep_state = state[dep];
                match dep_state {
                    1 => return false,
                    0 => {
                        if !visit(dep, edges, state) {
                            return false;
                        }
                    }
                    _ => {}
                }
            }
            state[node] = 2;
            true
        }

        let mut state = vec![0u8; self.stages.len()];
        for node in 0..self.stages.len() {
            if state[node] == 0 && !visit(node, &edges, &mut state) {
                return Err(EtlError::Config(format!(
                    "pipeline {} has a dependency cycle involving stage {}",
                    self.name, self.stages[node].name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Succeeded,
    /// Ran and failed; under lenient policy the pipeline continued anyway.
    Failed,
    /// Never ran: precondition unmet or policy decided to pass over it.
    Skipped,
    /// Nothing to do; the resolved range was empty.
    NoOp,
}

#[derive(Debug, Clone)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    pub duration_ms: u64,
    pub rows_written: u64,
    pub error: Option<String>,
    pub warning_count: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub pipeline: String,
    pub ok: bool,
    pub stages: Vec<StageResult>,
    pub duration_ms: u64,
}

impl PipelineOutcome {
    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }

    /// The single structured summary line promised to operators.
    pub fn summary_line(&self) -> String {
        format!(
            "pipeline={} ok={} succeeded={} failed={} skipped={} noop={} duration_ms={}",
            self.pipeline,
            self.ok,
            self.count(StageStatus::Succeeded),
            self.count(StageStatus::Failed),
            self.count(StageStatus::Skipped),
            self.count(StageStatus::NoOp),
            self.duration_ms
        )
    }
}

/// Run a pipeline to completion. Stage failures are folded into the
/// outcome per policy; `ConcurrentRun` and cancellation abort the whole
/// invocation and propagate as errors.
pub async fn run_pipeline(
    ctx: &EtlContext,
    def: &PipelineDef,
    args: &RangeArgs,
    lenient: bool,
) -> Result<PipelineOutcome> {
    def.validate()?;
    let started = Instant::now();
    let mut results: Vec<StageResult> = Vec::with_capacity(def.stages.len());
    let mut ok = true;

    for stage in &def.stages {
        if ctx.cancel.is_cancelled() {
            return Err(EtlError::Cancelled);
        }
        let effective_lenient = lenient || stage.lenient;

        // Readiness: every declared input watermark must cover the stage's
        // target range start; its end is clamped to what the inputs have.
        let mut stage_args = *args;
        if !stage.depends_on.is_empty() {
            match check_readiness(ctx, stage, &mut stage_args).await {
                Ok(true) => {}
                Ok(false) => {
                    let reason = format!(
                        "inputs not ready: {} behind target range",
                        stage.depends_on.join(",")
                    );
                    if effective_lenient {
                        warn!(stage = %stage.name, reason, "stage skipped");
                        ctx.events.publish(EtlEvent::StageSkipped {
                            pipeline: def.name.clone(),
                            stage: stage.name.clone(),
                            reason: reason.clone(),
                        });
                        results.push(StageResult {
                            name: stage.name.clone(),
                            status: StageStatus::Skipped,
                            duration_ms: 0,
                            rows_written: 0,
                            error: Some(reason),
                            warning_count: 0,
                        });
                        continue;
                    }
                    error!(stage = %stage.name, reason, "pipeline aborted");
                    results.push(StageResult {
                        name: stage.name.clone(),
                        status: StageStatus::Failed,
                        duration_ms: 0,
                        rows_written: 0,
                        error: Some(reason),
                        warning_count: 0,
                    });
                    ok = false;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let stage_started = Instant::now();
        ctx.events.publish(EtlEvent::StageStarted {
            pipeline: def.name.clone(),
            stage: stage.name.clone(),
            start_date: stage_args.start.unwrap_or(0),
            end_date: stage_args.end.unwrap_or(0),
        });

        match run_stage(ctx, &def.name, stage, &stage_args, effective_lenient).await {
            Ok(StageOutcome::NoOp) => {
                results.push(StageResult {
                    name: stage.name.clone(),
                    status: StageStatus::NoOp,
                    duration_ms: stage_started.elapsed().as_millis() as u64,
                    rows_written: 0,
                    error: None,
                    warning_count: 0,
                });
            }
            Ok(StageOutcome::Completed(report)) => {
                let duration_ms = stage_started.elapsed().as_millis() as u64;
                // HIGH-severity quality failures convert to a stage failure
                // under strict policy; the check stage itself stays read-only.
                let high = matches!(stage.kind, StageKind::Check { .. })
                    && has_high_failure(&report.findings);
                if high && !effective_lenient {
                    let detail = report
                        .findings
                        .iter()
                        .filter(|f| !f.passed && f.severity == Severity::High)
                        .map(|f| f.detail.clone())
                        .collect::<Vec<_>>()
                        .join("; ");
                    let gate = EtlError::QualityAssertion(detail);
                    error!(stage = %stage.name, error = %gate, "quality gate failed");
                    ctx.events.publish(EtlEvent::StageFailed {
                        pipeline: def.name.clone(),
                        stage: stage.name.clone(),
                        error: gate.to_string(),
                        downgraded: false,
                    });
                    results.push(StageResult {
                        name: stage.name.clone(),
                        status: StageStatus::Failed,
                        duration_ms,
                        rows_written: 0,
                        error: Some(gate.to_string()),
                        warning_count: report.warnings.len(),
                    });
                    ok = false;
                    break;
                }
                info!(
                    stage = %stage.name,
                    duration_ms,
                    rows = report.rows_written,
                    requests = report.request_count,
                    warnings = report.warnings.len(),
                    "stage completed"
                );
                ctx.events.publish(EtlEvent::StageCompleted {
                    pipeline: def.name.clone(),
                    stage: stage.name.clone(),
                    duration_ms,
                    rows_written: report.rows_written,
                    request_count: report.request_count,
                });
                results.push(StageResult {
                    name: stage.name.clone(),
                    status: StageStatus::Succeeded,
                    duration_ms,
                    rows_written: report.rows_written,
                    error: None,
                    warning_count: report.warnings.len(),
                });
            }
            Err(e @ EtlError::ConcurrentRun { .. }) | Err(e @ EtlError::Cancelled) => {
                // Single-flight rejection and cancellation abort the whole
                // invocation regardless of policy.
                return Err(e);
            }
            Err(e) => {
                let duration_ms = stage_started.elapsed().as_millis() as u64;
                let downgraded = effective_lenient;
                ctx.events.publish(EtlEvent::StageFailed {
                    pipeline: def.name.clone(),
                    stage: stage.name.clone(),
                    error: e.to_string(),
                    downgraded,
                });
                results.push(StageResult {
                    name: stage.name.clone(),
                    status: StageStatus::Failed,
                    duration_ms,
                    rows_written: 0,
                    error: Some(e.to_string()),
                    warning_count: 0,
                });
                if downgraded {
                    warn!(stage = %stage.name, error = %e, "stage failed; continuing (lenient)");
                    continue;
                }
                error!(stage = %stage.name, error = %e, "stage failed; aborting (strict)");
                ok = false;
                break;
            }
        }
    }

    let outcome = PipelineOutcome {
        pipeline: def.name.clone(),
        ok,
        duration_ms: started.elapsed().as_millis() as u64,
        stages: results,
    };
    ctx.events.publish(EtlEvent::PipelineSummary {
        pipeline: outcome.pipeline.clone(),
        ok: outcome.ok,
        succeeded: outcome.count(StageStatus::Succeeded),
        failed: outcome.count(StageStatus::Failed),
        skipped: outcome.count(StageStatus::Skipped),
        duration_ms: outcome.duration_ms,
    });
    info!("{}", outcome.summary_line());
    Ok(outcome)
}

/// True when every input watermark covers the stage's target start. Also
/// clamps the stage's end date to the slowest input so a transform never
/// reads rows its sources have not durably committed.
async fn check_readiness(
    ctx: &EtlContext,
    stage: &StageDef,
    stage_args: &mut RangeArgs,
) -> Result<bool> {
    let cap = ctx.today_cap()?;
    let target_start = match stage_args.start {
        Some(s) => s,
        None => {
            if stage.refresh {
                cap
            } else {
                let current = ctx
                    .store
                    .watermark(&stage.name)
                    .await?
                    .map(|w| w.water_mark);
                match current {
                    Some(wm) => ctx.calendar.next_trading_day(wm).unwrap_or(cap),
                    None => ctx
                        .calendar
                        .next_trading_day(crate::stage::initial_watermark(ctx))
                        .unwrap_or(cap),
                }
            }
        }
    };
    if target_start > cap {
        // Nothing to do; the stage itself will resolve to a no-op.
        return Ok(true);
    }

    let mut slowest_input = cap;
    for dep in &stage.depends_on {
        let wm = ctx.store.watermark(dep).await?.map(|w| w.water_mark);
        match wm {
            Some(wm) if wm >= target_start => slowest_input = slowest_input.min(wm),
            _ => return Ok(false),
        }
    }
    stage_args.end = Some(
        stage_args
            .end
            .map(|e| e.min(slowest_input))
            .unwrap_or(slowest_input),
    );
    Ok(true)
}

/// The three operated pipelines. Collaborators can assemble arbitrary
/// stage lists through the same types; these are the ones on the cron.
pub fn named_pipeline(name: &str) -> Option<PipelineDef> {
    let api = |n: &str| descriptor(n).expect("catalog api");
    match name {
        // 17:00 after the vendor publishes the day's bars: base dimensions,
        // core bars, features, then the full transform chain.
        "afternoon_core" => Some(PipelineDef {
            name: "afternoon_core".into(),
            lenient_default: false,
            stages: vec![
                StageDef::ingest("ingest_base", vec![api("trade_cal"), api("stock_basic")], false),
                StageDef::ingest(
                    "ingest_ods_core",
                    vec![api("daily"), api("daily_basic"), api("adj_factor")],
                    false,
                ),
                StageDef::check("check_ods_core", ods_core_checks(), false),
                StageDef::ingest(
                    "ingest_ods_features",
                    vec![api("moneyflow"), api("cyq_perf"), api("stk_factor")],
                    true,
                ),
                StageDef::check("check_ods_features", ods_feature_checks(), true),
                StageDef::transform(
                    "dwd_standardize",
                    transforms::dwd_standardize(),
                    &["daily", "daily_basic", "adj_factor"],
                    false,
                ),
                StageDef::check("check_dwd", dwd_checks(), false),
                StageDef::transform(
                    "dws_features",
                    transforms::dws_features(),
                    &["dwd_standardize"],
                    false,
                ),
                StageDef::check("check_dws", dws_checks(), false),
                StageDef::transform(
                    "ads_scores",
                    transforms::ads_scores(),
                    &["dws_features"],
                    false,
                ),
                StageDef::check("check_ads", ads_checks(), false),
            ],
        }),
        // 20:00 enhancement: announcement-window financial sources plus the
        // transforms that consume them. Everything is lenient; disclosure
        // timing is not under our control.
        "evening_enhance" => Some(PipelineDef {
            name: "evening_enhance".into(),
            lenient_default: true,
            stages: vec![
                StageDef::ingest(
                    "ingest_enhance",
                    vec![api("dividend"), api("fina_indicator")],
                    true,
                ),
                StageDef::transform(
                    "dwd_fina_snapshot",
                    transforms::dwd_fina_snapshot(),
                    &["fina_indicator"],
                    true,
                ),
                StageDef::transform(
                    "dws_pit_refresh",
                    transforms::dws_pit_refresh(),
                    &["dwd_fina_snapshot", "dwd_standardize"],
                    true,
                ),
                StageDef::check("check_financial", financial_checks(), true),
            ],
        }),
        // 08:30 T+1 repair: margin lands overnight; re-derive leverage and
        // re-score yesterday's cap date.
        "morning_t1" => Some(PipelineDef {
            name: "morning_t1".into(),
            lenient_default: false,
            stages: vec![
                StageDef::ingest("ingest_margin", vec![api("margin_detail")], false),
                StageDef::transform(
                    "dws_leverage",
                    transforms::dws_leverage(),
                    &["margin_detail"],
                    false,
                ),
                StageDef::transform_refresh(
                    "ads_scores",
                    transforms::ads_scores(),
                    &["dws_features", "dws_leverage"],
                    false,
                ),
                StageDef::check("check_margin", margin_checks(), false),
            ],
        }),
        _ => None,
    }
}

fn ods_core_checks() -> Vec<QualityCheck> {
    vec![
        QualityCheck::max_date_at_least("ods_daily_fresh", "ods_daily", Severity::High),
        QualityCheck::row_count_floor("ods_daily_floor", "ods_daily", 1000, Severity::High),
        QualityCheck::row_count_floor(
            "ods_daily_basic_floor",
            "ods_daily_basic",
            1000,
            Severity::High,
        ),
        QualityCheck::row_count_floor("ods_adj_factor_floor", "ods_adj_factor", 1000, Severity::High),
        QualityCheck::null_ratio_ceiling("ods_daily_close_nulls", "ods_daily", "close", 0.01, Severity::Low),
    ]
}

fn ods_feature_checks() -> Vec<QualityCheck> {
    vec![
        QualityCheck::row_count_floor("ods_moneyflow_floor", "ods_moneyflow", 500, Severity::Low),
        QualityCheck::row_count_floor("ods_cyq_perf_floor", "ods_cyq_perf", 500, Severity::Low),
        QualityCheck::row_count_floor("ods_stk_factor_floor", "ods_stk_factor", 500, Severity::Low),
    ]
}

fn dwd_checks() -> Vec<QualityCheck> {
    vec![
        QualityCheck::max_date_at_least("dwd_std_fresh", "dwd_daily_std", Severity::High),
        QualityCheck::join_coverage("dwd_std_coverage", "dwd_daily_std", "ods_daily", 0.99, Severity::High),
    ]
}

fn dws_checks() -> Vec<QualityCheck> {
    vec![
        QualityCheck::max_date_at_least("dws_features_fresh", "dws_stock_features", Severity::High),
        QualityCheck::row_count_floor("dws_features_floor", "dws_stock_features", 500, Severity::High),
    ]
}

fn ads_checks() -> Vec<QualityCheck> {
    vec![
        QualityCheck::max_date_at_least("ads_score_fresh", "ads_stock_score", Severity::High),
        QualityCheck::row_count_floor("ads_score_floor", "ads_stock_score", 500, Severity::High),
    ]
}

fn financial_checks() -> Vec<QualityCheck> {
    vec![
        // Snapshot freshness is keyed by disclosure date, not trade date.
        QualityCheck::max_date_at_least("fina_snapshot_fresh", "dwd_fina_snapshot", Severity::Low)
            .with_date_column("ann_date"),
        QualityCheck::max_date_at_least("pit_fina_fresh", "dws_pit_fina", Severity::Low),
    ]
}

fn margin_checks() -> Vec<QualityCheck> {
    vec![
        QualityCheck::max_date_at_least("margin_fresh", "ods_margin_detail", Severity::High),
        QualityCheck::join_coverage(
            "leverage_coverage",
            "dws_leverage",
            "ods_margin_detail",
            0.99,
            Severity::High,
        ),
    ]
}
