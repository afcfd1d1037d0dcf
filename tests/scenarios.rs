//! End-to-end scheduler scenarios over the in-memory store and a scripted
//! vendor: clean increments, mid-range failure with resume, zombie
//! reclamation, lenient feature gaps, idempotency guard hits, and the
//! future-date clamp.

mod common;

use std::time::Duration;

use common::*;

use ashare_etl::error::EtlError;
use ashare_etl::pipeline::{run_pipeline, PipelineDef, StageStatus};
use ashare_etl::registry::descriptor;
use ashare_etl::stage::{run_stage, RangeArgs, StageDef, StageOutcome};
use ashare_etl::store::models::RunStatus;
use ashare_etl::store::Store;
use ashare_etl::transforms;
use ashare_etl::wrapper::{run_guarded, GuardArgs};

fn daily_stage() -> StageDef {
    StageDef::ingest("ingest_daily", vec![descriptor("daily").unwrap()], false)
}

#[tokio::test(start_paused = true)]
async fn scenario_a_clean_incremental() {
    let store = MemStore::new();
    let vendor = ScriptedVendor::new(5);
    let days = vec![
        open_day(20240110),
        open_day(20240111),
        closed_day(20240112),
    ];
    let ctx = test_context(
        store.clone(),
        vendor.clone(),
        &days,
        FixedClock::at(20240112, 18, 0),
    );
    store.seed_watermark("daily", 20240110);

    let outcome = run_stage(&ctx, "afternoon_core", &daily_stage(), &RangeArgs::default(), false)
        .await
        .unwrap();

    match outcome {
        StageOutcome::Completed(report) => {
            assert_eq!(report.rows_written, 5);
            assert_eq!(report.first_date, Some(20240111));
            assert_eq!(report.last_date, Some(20240111));
        }
        StageOutcome::NoOp => panic!("expected work for 20240111"),
    }

    // Only the one owed trading day was fetched.
    assert_eq!(vendor.calls(), vec!["daily:20240111".to_string()]);
    assert_eq!(store.watermark_of("daily"), Some(20240111));

    let runs = store.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "SUCCESS");
    assert_eq!(runs[0].api_name, "ingest_daily");
    assert_eq!(runs[0].request_count, 1);

    assert_eq!(
        store
            .row_count_for_date("ods_daily", "trade_date", 20240111)
            .await
            .unwrap(),
        5
    );
}

#[tokio::test(start_paused = true)]
async fn scenario_b_mid_range_failure_then_resume() {
    let store = MemStore::new();
    let vendor = ScriptedVendor::new(4);
    let days: Vec<_> = (20240110..=20240115).map(open_day).collect();
    let ctx = test_context(
        store.clone(),
        vendor.clone(),
        &days,
        FixedClock::at(20240115, 19, 0),
    );
    store.seed_watermark("daily", 20240110);

    // Two transient failures exhaust retry_times = 1.
    vendor.script(
        "daily:20240113",
        vec![Reply::Status(503), Reply::Status(503)],
    );

    let err = run_stage(&ctx, "afternoon_core", &daily_stage(), &RangeArgs::default(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, EtlError::FetchExhausted { .. }));

    // Rows before the failure are durable; the watermark froze at D-1.
    for date in [20240111, 20240112] {
        assert_eq!(
            store
                .row_count_for_date("ods_daily", "trade_date", date)
                .await
                .unwrap(),
            4,
            "rows for {date} must be persisted"
        );
    }
    assert_eq!(
        store
            .row_count_for_date("ods_daily", "trade_date", 20240113)
            .await
            .unwrap(),
        0
    );
    assert_eq!(store.watermark_of("daily"), Some(20240112));
    assert_eq!(store.runs().last().unwrap().status, "FAILED");

    // The next invocation resumes at exactly the failed date.
    let calls_before = vendor.calls().len();
    let outcome = run_stage(&ctx, "afternoon_core", &daily_stage(), &RangeArgs::default(), false)
        .await
        .unwrap();
    assert!(matches!(outcome, StageOutcome::Completed(_)));

    let resumed: Vec<_> = vendor.calls()[calls_before..].to_vec();
    assert_eq!(
        resumed,
        vec![
            "daily:20240113".to_string(),
            "daily:20240114".to_string(),
            "daily:20240115".to_string(),
        ]
    );
    assert_eq!(store.watermark_of("daily"), Some(20240115));
    assert_eq!(store.runs().last().unwrap().status, "SUCCESS");
}

#[tokio::test(start_paused = true)]
async fn scenario_c_zombie_reclaim() {
    let store = MemStore::new();
    let vendor = ScriptedVendor::new(3);
    let days = vec![open_day(20240110), open_day(20240111)];
    let ctx = test_context(
        store.clone(),
        vendor.clone(),
        &days,
        FixedClock::at(20240111, 18, 0),
    );
    store.seed_watermark("daily", 20240110);
    let zombie_id = store.seed_running_run("ingest_daily", 180);

    let outcome = run_stage(&ctx, "afternoon_core", &daily_stage(), &RangeArgs::default(), false)
        .await
        .unwrap();
    assert!(matches!(outcome, StageOutcome::Completed(_)));

    let runs = store.runs();
    let zombie = runs.iter().find(|r| r.id == zombie_id).unwrap();
    assert_eq!(zombie.status, "FAILED");
    assert_eq!(zombie.err_msg.as_deref(), Some("zombie-reclaimed"));

    let fresh = runs.iter().find(|r| r.id != zombie_id).unwrap();
    assert_eq!(fresh.status, "SUCCESS");
}

#[tokio::test(start_paused = true)]
async fn young_running_row_refuses_concurrent_run() {
    let store = MemStore::new();
    let vendor = ScriptedVendor::new(3);
    let days = vec![open_day(20240110), open_day(20240111)];
    let ctx = test_context(
        store.clone(),
        vendor.clone(),
        &days,
        FixedClock::at(20240111, 18, 0),
    );
    store.seed_watermark("daily", 20240110);
    store.seed_running_run("ingest_daily", 10);

    let err = run_stage(&ctx, "afternoon_core", &daily_stage(), &RangeArgs::default(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, EtlError::ConcurrentRun { .. }));
    // The invoker was rejected without fetching or logging anything new.
    assert!(vendor.calls().is_empty());
    assert_eq!(store.runs().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_lenient_feature_gap() {
    let store = MemStore::new();
    let vendor = ScriptedVendor::new(3);
    let days = vec![open_day(20240110), open_day(20240111)];
    // 17:05, two hours after close; margin readiness lag is 16h.
    let ctx = test_context(
        store.clone(),
        vendor.clone(),
        &days,
        FixedClock::at(20240111, 17, 5),
    );
    store.seed_watermark("margin_detail", 20240110);
    store.seed_watermark("dws_leverage", 20240110);
    vendor.script("margin_detail:20240111", vec![Reply::Empty]);

    let def = PipelineDef {
        name: "margin_repair".into(),
        lenient_default: false,
        stages: vec![
            StageDef::ingest(
                "ingest_margin",
                vec![descriptor("margin_detail").unwrap()],
                false,
            ),
            StageDef::transform(
                "dws_leverage",
                transforms::dws_leverage(),
                &["margin_detail"],
                false,
            ),
        ],
    };

    let outcome = run_pipeline(&ctx, &def, &RangeArgs::default(), true)
        .await
        .unwrap();

    // Missing "today" rows downgrade to a warning, the dependent transform
    // is skipped, and the invocation still counts as a success.
    assert!(outcome.ok);
    assert_eq!(outcome.stages[0].status, StageStatus::Succeeded);
    assert_eq!(outcome.stages[0].warning_count, 1);
    assert_eq!(outcome.stages[1].status, StageStatus::Skipped);
    assert_eq!(store.watermark_of("margin_detail"), Some(20240110));
    assert!(store.transform_calls().is_empty());
}

#[tokio::test]
async fn scenario_e_idempotency_guard_hit() {
    let store = MemStore::new();
    store
        .upsert_guard(
            "daily_pipeline",
            "daily_pipeline:20240111",
            RunStatus::Success,
            0,
            3600,
            None,
        )
        .await
        .unwrap();

    let args = GuardArgs {
        task_name: "daily_pipeline".into(),
        idempotency_key: "daily_pipeline:20240111".into(),
        retries: 0,
        retry_delay: Duration::from_secs(0),
        timeout: Duration::from_secs(30),
        // Would fail loudly if the guard let it run.
        command: vec!["sh".into(), "-c".into(), "exit 7".into()],
    };
    let code = run_guarded(store.as_ref(), &args).await.unwrap();

    assert_eq!(code, 0);
    assert!(store.runs().is_empty());
    let row = store
        .guard_row("daily_pipeline", "daily_pipeline:20240111")
        .unwrap();
    assert_eq!(row.status, "SUCCESS");
    assert_eq!(row.attempt, 0);
}

#[tokio::test]
async fn guard_runs_and_records_success() {
    let store = MemStore::new();
    let args = GuardArgs {
        task_name: "ods_incremental".into(),
        idempotency_key: "ods_incremental:20240111".into(),
        retries: 0,
        retry_delay: Duration::from_secs(0),
        timeout: Duration::from_secs(30),
        command: vec!["sh".into(), "-c".into(), "exit 0".into()],
    };
    let code = run_guarded(store.as_ref(), &args).await.unwrap();
    assert_eq!(code, 0);
    let row = store
        .guard_row("ods_incremental", "ods_incremental:20240111")
        .unwrap();
    assert_eq!(row.status, "SUCCESS");
}

#[tokio::test]
async fn guard_forwards_exit_code_after_retries() {
    let store = MemStore::new();
    let args = GuardArgs {
        task_name: "ods_incremental".into(),
        idempotency_key: "ods_incremental:20240112".into(),
        retries: 1,
        retry_delay: Duration::from_secs(0),
        timeout: Duration::from_secs(30),
        command: vec!["sh".into(), "-c".into(), "exit 7".into()],
    };
    let code = run_guarded(store.as_ref(), &args).await.unwrap();
    assert_eq!(code, 7);
    let row = store
        .guard_row("ods_incremental", "ods_incremental:20240112")
        .unwrap();
    assert_eq!(row.status, "FAILED");
    assert_eq!(row.attempt, 1);
    assert_eq!(row.err_msg.as_deref(), Some("exit_code=7"));
}

#[tokio::test(start_paused = true)]
async fn scenario_f_future_end_date_is_clamped() {
    let store = MemStore::new();
    let vendor = ScriptedVendor::new(3);
    let mut days = vec![open_day(20240112), open_day(20240115)];
    days.push(open_day(20251231));
    let ctx = test_context(
        store.clone(),
        vendor.clone(),
        &days,
        FixedClock::at(20240115, 18, 0),
    );
    store.seed_watermark("daily", 20240112);

    let args = RangeArgs {
        start: None,
        end: Some(20251231),
    };
    let outcome = run_stage(&ctx, "afternoon_core", &daily_stage(), &args, false)
        .await
        .unwrap();
    assert!(matches!(outcome, StageOutcome::Completed(_)));

    // Only the cap date was touched; nothing in the future was fetched,
    // written, or claimed by the watermark.
    assert_eq!(vendor.calls(), vec!["daily:20240115".to_string()]);
    assert_eq!(store.watermark_of("daily"), Some(20240115));
    assert_eq!(
        store
            .row_count_for_date("ods_daily", "trade_date", 20251231)
            .await
            .unwrap(),
        0
    );

    // And the store-level clamp refuses a direct future advance.
    let err = store
        .advance_watermark("daily", 20251231, 20240115)
        .await
        .unwrap_err();
    assert!(matches!(err, EtlError::FutureWatermark { .. }));
}

#[tokio::test(start_paused = true)]
async fn lenient_failure_does_not_block_independent_stages() {
    let store = MemStore::new();
    let vendor = ScriptedVendor::new(3);
    let days = vec![open_day(20240110), open_day(20240111)];
    let ctx = test_context(
        store.clone(),
        vendor.clone(),
        &days,
        FixedClock::at(20240111, 18, 0),
    );
    store.seed_watermark("daily", 20240110);
    store.seed_watermark("moneyflow", 20240110);
    // A 404 is non-transient and fails the stage on the first attempt.
    vendor.script("daily:20240111", vec![Reply::Status(404)]);

    let def = PipelineDef {
        name: "two_ingests".into(),
        lenient_default: false,
        stages: vec![
            StageDef::ingest("ingest_daily", vec![descriptor("daily").unwrap()], false),
            StageDef::ingest(
                "ingest_moneyflow",
                vec![descriptor("moneyflow").unwrap()],
                false,
            ),
        ],
    };

    // Lenient: the failure is downgraded and the later stage still runs.
    let outcome = run_pipeline(&ctx, &def, &RangeArgs::default(), true)
        .await
        .unwrap();
    assert!(outcome.ok);
    assert_eq!(outcome.stages[0].status, StageStatus::Failed);
    assert_eq!(outcome.stages[1].status, StageStatus::Succeeded);
    assert_eq!(store.watermark_of("moneyflow"), Some(20240111));
}

#[tokio::test(start_paused = true)]
async fn strict_failure_aborts_remaining_stages() {
    let store = MemStore::new();
    let vendor = ScriptedVendor::new(3);
    let days = vec![open_day(20240110), open_day(20240111)];
    let ctx = test_context(
        store.clone(),
        vendor.clone(),
        &days,
        FixedClock::at(20240111, 18, 0),
    );
    store.seed_watermark("daily", 20240110);
    store.seed_watermark("moneyflow", 20240110);
    vendor.script("daily:20240111", vec![Reply::Status(404)]);

    let def = PipelineDef {
        name: "two_ingests".into(),
        lenient_default: false,
        stages: vec![
            StageDef::ingest("ingest_daily", vec![descriptor("daily").unwrap()], false),
            StageDef::ingest(
                "ingest_moneyflow",
                vec![descriptor("moneyflow").unwrap()],
                false,
            ),
        ],
    };

    let outcome = run_pipeline(&ctx, &def, &RangeArgs::default(), false)
        .await
        .unwrap();
    assert!(!outcome.ok);
    assert_eq!(outcome.stages.len(), 1);
    assert_eq!(outcome.stages[0].status, StageStatus::Failed);
    assert_eq!(store.watermark_of("moneyflow"), Some(20240110));
}

#[tokio::test(start_paused = true)]
async fn replaying_a_covered_range_is_idempotent() {
    let store = MemStore::new();
    let vendor = ScriptedVendor::new(4);
    let days = vec![open_day(20240110), open_day(20240111)];
    let ctx = test_context(
        store.clone(),
        vendor.clone(),
        &days,
        FixedClock::at(20240111, 18, 0),
    );
    store.seed_watermark("daily", 20240110);

    run_stage(&ctx, "afternoon_core", &daily_stage(), &RangeArgs::default(), false)
        .await
        .unwrap();
    let first_pass = store.table_rows("ods_daily");
    assert_eq!(store.watermark_of("daily"), Some(20240111));

    // Explicit backfill over the already-covered range.
    let args = RangeArgs {
        start: Some(20240111),
        end: Some(20240111),
    };
    let outcome = run_stage(&ctx, "afternoon_core", &daily_stage(), &args, false)
        .await
        .unwrap();
    assert!(matches!(outcome, StageOutcome::Completed(_)));

    assert_eq!(store.table_rows("ods_daily"), first_pass);
    assert_eq!(store.watermark_of("daily"), Some(20240111));
}

#[tokio::test(start_paused = true)]
async fn caught_up_watermark_is_a_noop_without_run_log() {
    let store = MemStore::new();
    let vendor = ScriptedVendor::new(3);
    let days = vec![open_day(20240110), open_day(20240111)];
    let ctx = test_context(
        store.clone(),
        vendor.clone(),
        &days,
        FixedClock::at(20240111, 18, 0),
    );
    store.seed_watermark("daily", 20240111);

    let outcome = run_stage(&ctx, "afternoon_core", &daily_stage(), &RangeArgs::default(), false)
        .await
        .unwrap();
    assert!(matches!(outcome, StageOutcome::NoOp));
    assert!(store.runs().is_empty());
    assert!(vendor.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_calendar_is_a_hard_stage_error() {
    let store = MemStore::new();
    let vendor = ScriptedVendor::new(3);
    let ctx = test_context(
        store.clone(),
        vendor.clone(),
        &[],
        FixedClock::at(20240111, 18, 0),
    );
    store.seed_watermark("daily", 20240110);

    let err = run_stage(&ctx, "afternoon_core", &daily_stage(), &RangeArgs::default(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, EtlError::EmptyCalendar));
    assert!(store.runs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn high_severity_quality_failure_aborts_strict_pipeline() {
    use ashare_etl::quality::{QualityCheck, Severity};

    let store = MemStore::new();
    let vendor = ScriptedVendor::new(3);
    let days = vec![open_day(20240110), open_day(20240111)];
    let ctx = test_context(
        store.clone(),
        vendor.clone(),
        &days,
        FixedClock::at(20240111, 18, 0),
    );

    let def = PipelineDef {
        name: "gated".into(),
        lenient_default: false,
        stages: vec![
            StageDef::check(
                "check_ods_core",
                vec![QualityCheck::row_count_floor(
                    "ods_daily_floor",
                    "ods_daily",
                    1000,
                    Severity::High,
                )],
                false,
            ),
            StageDef::ingest("ingest_daily", vec![descriptor("daily").unwrap()], false),
        ],
    };

    let outcome = run_pipeline(&ctx, &def, &RangeArgs::default(), false)
        .await
        .unwrap();
    assert!(!outcome.ok);
    assert_eq!(outcome.stages[0].status, StageStatus::Failed);
    assert_eq!(outcome.stages.len(), 1);

    let quality = store.quality_rows();
    assert_eq!(quality.len(), 1);
    assert_eq!(quality[0].status, "FAIL");

    // The check run itself stays a read-only SUCCESS in the run log.
    assert_eq!(store.runs().last().unwrap().status, "SUCCESS");
}
