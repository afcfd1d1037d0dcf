//! SLO window checks over the run log and quality log.
//!
//! The `check` subcommand audits the last N hours: terminal failures on
//! core stages, still-RUNNING rows old enough to be zombies, watermarks in
//! a FAILED state, and failed HIGH-severity quality rows all count as
//! breaches.

use chrono::Utc;

use crate::error::Result;
use crate::store::models::RunStatus;
use crate::store::Store;

/// Stage names whose failures breach the SLO outright. Feature-layer
/// stages report but do not breach.
const CORE_STAGES: &[&str] = &[
    "ingest_base",
    "ingest_ods_core",
    "dwd_standardize",
    "dws_features",
    "ads_scores",
];

#[derive(Debug, Default)]
pub struct SloReport {
    pub window_hours: u32,
    pub total_runs: usize,
    pub failed_core_runs: Vec<String>,
    pub zombie_runs: Vec<String>,
    pub failed_watermarks: Vec<String>,
    pub high_quality_failures: Vec<String>,
}

impl SloReport {
    pub fn breached(&self) -> bool {
        !self.failed_core_runs.is_empty()
            || !self.zombie_runs.is_empty()
            || !self.failed_watermarks.is_empty()
            || !self.high_quality_failures.is_empty()
    }

    pub fn render(&self) -> String {
        let mut lines = vec![format!(
            "slo window={}h runs={} breached={}",
            self.window_hours,
            self.total_runs,
            self.breached()
        )];
        for (label, items) in [
            ("failed_core_run", &self.failed_core_runs),
            ("zombie_run", &self.zombie_runs),
            ("failed_watermark", &self.failed_watermarks),
            ("high_quality_failure", &self.high_quality_failures),
        ] {
            for item in items {
                lines.push(format!("  {label}: {item}"));
            }
        }
        lines.join("\n")
    }
}

/// Audit the last `hours` of metadata. Read-only.
pub async fn check_slo(store: &dyn Store, hours: u32, zombie_threshold_min: u32) -> Result<SloReport> {
    let mut report = SloReport {
        window_hours: hours,
        ..Default::default()
    };

    let runs = store.recent_runs(hours).await?;
    report.total_runs = runs.len();
    let now = Utc::now().naive_utc();
    for run in &runs {
        match RunStatus::parse(&run.status) {
            Some(RunStatus::Failed) if CORE_STAGES.contains(&run.api_name.as_str()) => {
                report.failed_core_runs.push(format!(
                    "{} run {} at {}: {}",
                    run.api_name,
                    run.id,
                    run.start_at,
                    run.err_msg.as_deref().unwrap_or("no error text")
                ));
            }
            Some(RunStatus::Running) => {
                let age_min = (now - run.start_at).num_minutes();
                if age_min >= zombie_threshold_min as i64 {
                    report
                        .zombie_runs
                        .push(format!("{} run {} RUNNING for {age_min}m", run.api_name, run.id));
                }
            }
            _ => {}
        }
    }

    for wm in store.watermarks().await? {
        if wm.status == RunStatus::Failed.as_str() {
            report.failed_watermarks.push(format!(
                "{} stuck at {}: {}",
                wm.api_name,
                wm.water_mark,
                wm.last_err.as_deref().unwrap_or("no error text")
            ));
        }
    }

    for q in store.recent_quality(hours).await? {
        if q.status == "FAIL" {
            // The quality log keeps severity inside the detail text; HIGH
            // gates are the only ones the SLO cares about.
            let detail = q.detail.as_deref().unwrap_or("");
            if CORE_QUALITY_PREFIXES.iter().any(|p| q.check_name.starts_with(p)) {
                report
                    .high_quality_failures
                    .push(format!("{} on {}: {detail}", q.check_name, q.check_date));
            }
        }
    }

    Ok(report)
}

/// Check-name prefixes that correspond to HIGH-severity gates.
const CORE_QUALITY_PREFIXES: &[&str] = &["ods_daily", "dwd_", "dws_", "ads_", "margin_"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_is_healthy() {
        let report = SloReport {
            window_hours: 24,
            ..Default::default()
        };
        assert!(!report.breached());
        assert!(report.render().contains("breached=false"));
    }

    #[test]
    fn any_bucket_breaches() {
        let mut report = SloReport::default();
        report.zombie_runs.push("daily run 7 RUNNING for 300m".into());
        assert!(report.breached());
    }
}
