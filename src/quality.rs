//! Post-stage data quality assertions.
//!
//! Each assertion evaluates against the store for one date and writes one
//! row to the quality log. The checker itself never fails a pipeline; it
//! returns findings with severities and the coordinator decides what a HIGH
//! severity means under the active policy.

use serde::Serialize;
use tracing::{info, warn};

use crate::context::EtlContext;
use crate::error::Result;
use crate::events::EtlEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Low,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::High => "HIGH",
        }
    }
}

/// One assertion over a (table, date).
#[derive(Debug, Clone)]
pub struct QualityCheck {
    pub name: String,
    pub table: String,
    pub date_column: String,
    pub rule: QualityRule,
    /// Severity assigned when the assertion fails.
    pub severity: Severity,
}

#[derive(Debug, Clone)]
pub enum QualityRule {
    /// At least `floor` rows must exist for the date.
    RowCountFloor { floor: u64 },
    /// At most `ceiling` fraction of `column` may be null for the date.
    NullRatioCeiling { column: String, ceiling: f64 },
    /// The table's max date must be at least the expected date.
    MaxDateAtLeast,
    /// At least `threshold` of `against_table` rows for the date must join.
    JoinCoverage { against_table: String, threshold: f64 },
}

#[derive(Debug, Clone)]
pub struct QualityFinding {
    pub check: String,
    pub date: u32,
    pub severity: Severity,
    pub passed: bool,
    pub detail: String,
}

impl QualityCheck {
    pub fn row_count_floor(name: &str, table: &str, floor: u64, severity: Severity) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            date_column: "trade_date".to_string(),
            rule: QualityRule::RowCountFloor { floor },
            severity,
        }
    }

    pub fn null_ratio_ceiling(
        name: &str,
        table: &str,
        column: &str,
        ceiling: f64,
        severity: Severity,
    ) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            date_column: "trade_date".to_string(),
            rule: QualityRule::NullRatioCeiling {
                column: column.to_string(),
                ceiling,
            },
            severity,
        }
    }

    pub fn max_date_at_least(name: &str, table: &str, severity: Severity) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            date_column: "trade_date".to_string(),
            rule: QualityRule::MaxDateAtLeast,
            severity,
        }
    }

    pub fn join_coverage(
        name: &str,
        table: &str,
        against_table: &str,
        threshold: f64,
        severity: Severity,
    ) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            date_column: "trade_date".to_string(),
            rule: QualityRule::JoinCoverage {
                against_table: against_table.to_string(),
                threshold,
            },
            severity,
        }
    }

    /// Evaluate against a different date column; announcement-keyed tables
    /// have `ann_date` where fact tables have `trade_date`.
    pub fn with_date_column(mut self, column: &str) -> Self {
        self.date_column = column.to_string();
        self
    }

    async fn evaluate(&self, ctx: &EtlContext, date: u32) -> Result<QualityFinding> {
        let (passed, detail) = match &self.rule {
            QualityRule::RowCountFloor { floor } => {
                let count = ctx
                    .store
                    .row_count_for_date(&self.table, &self.date_column, date)
                    .await?;
                (
                    count >= *floor,
                    format!("{}: {count} rows for {date}, floor {floor}", self.table),
                )
            }
            QualityRule::NullRatioCeiling { column, ceiling } => {
                let ratio = ctx
                    .store
                    .null_ratio(&self.table, column, &self.date_column, date)
                    .await?;
                (
                    ratio <= *ceiling,
                    format!(
                        "{}.{column}: null ratio {ratio:.4} for {date}, ceiling {ceiling}",
                        self.table
                    ),
                )
            }
            QualityRule::MaxDateAtLeast => {
                let stats = ctx.store.table_stats(&self.table, &self.date_column).await?;
                let max = stats.max_date.unwrap_or(0);
                (
                    max >= date,
                    format!("{}: max {max}, expected at least {date}", self.table),
                )
            }
            QualityRule::JoinCoverage {
                against_table,
                threshold,
            } => {
                let coverage = ctx
                    .store
                    .join_coverage(&self.table, against_table, date)
                    .await?;
                (
                    coverage >= *threshold,
                    format!(
                        "{} vs {against_table}: coverage {coverage:.4} for {date}, threshold {threshold}",
                        self.table
                    ),
                )
            }
        };
        Ok(QualityFinding {
            check: self.name.clone(),
            date,
            severity: self.severity,
            passed,
            detail,
        })
    }
}

/// Run every check for `date`, logging each result to the quality log.
/// Returns all findings; failures are decided by the caller.
pub async fn run_checks(
    ctx: &EtlContext,
    checks: &[QualityCheck],
    date: u32,
) -> Result<Vec<QualityFinding>> {
    let mut findings = Vec::with_capacity(checks.len());
    for check in checks {
        let finding = check.evaluate(ctx, date).await?;
        let status = if finding.passed { "PASS" } else { "FAIL" };
        ctx.store
            .log_quality(date, &check.name, status, &finding.detail)
            .await?;
        if finding.passed {
            info!(check = %check.name, date, "quality check passed");
        } else {
            warn!(
                check = %check.name,
                date,
                severity = finding.severity.as_str(),
                detail = %finding.detail,
                "quality check failed"
            );
            ctx.events.publish(EtlEvent::QualityFinding {
                check: check.name.clone(),
                date,
                severity: finding.severity.as_str().to_string(),
                detail: finding.detail.clone(),
            });
        }
        findings.push(finding);
    }
    Ok(findings)
}

/// True when any failed finding carries HIGH severity.
pub fn has_high_failure(findings: &[QualityFinding]) -> bool {
    findings
        .iter()
        .any(|f| !f.passed && f.severity == Severity::High)
}
