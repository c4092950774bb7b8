//! Staging under injected storage and queue failures.

use chrono::{Duration, TimeZone, Utc};

use escrow_core::StorageBackend;
use escrow_staging::action::{StagingAction, StagingOutcome};
use escrow_staging::config::StagingSettings;
use escrow_staging::cursor::CURSOR_PREFIX;
use escrow_staging::deposit::DepositKey;
use escrow_staging::job::{DepositOutcome, StagingJob};
use escrow_staging::mode::{CursorType, DepositMode};
use escrow_staging::pending::PendingDeposit;
use escrow_staging::shuffle::SHUFFLE_PREFIX;
use escrow_test_utils::{RegistryFixture, init_test_logging, jan};

fn full_pending() -> PendingDeposit {
    PendingDeposit {
        tld: "example".into(),
        mode: DepositMode::Full,
        watermark: jan(1),
        interval: Duration::days(1),
        size_hint: None,
    }
}

async fn fixture() -> RegistryFixture {
    init_test_logging();
    let settings = StagingSettings {
        transaction_cooldown: Duration::hours(1),
        max_task_attempts: 3,
        ..StagingSettings::default()
    };
    let fixture = RegistryFixture::new(Utc.with_ymd_and_hms(2024, 1, 2, 0, 30, 0).unwrap())
        .with_settings(settings);
    fixture.tld("example").registrar("TheRegistrar", "The Registrar");
    fixture.domain("foo.example", "TheRegistrar", jan(1) - Duration::days(3));
    fixture.cursor_at("example", CursorType::RdeStaging, jan(1)).await;
    fixture.cursor_at("example", CursorType::Brda, jan(9)).await;
    fixture
}

async fn rde_position(fixture: &RegistryFixture) -> chrono::DateTime<Utc> {
    fixture
        .cursors()
        .get("example", CursorType::RdeStaging)
        .await
        .unwrap()
}

#[tokio::test]
async fn transient_shuffle_failures_are_retried() {
    let fixture = fixture().await;
    fixture.storage.fail_times(SHUFFLE_PREFIX, 2);

    let report = StagingJob::new(&fixture.config(), vec![full_pending()])
        .run()
        .await;

    assert!(report.is_success(), "{report:?}");
    assert_eq!(rde_position(&fixture).await, jan(2));
}

#[tokio::test]
async fn persistent_map_failure_stages_nothing() {
    let fixture = fixture().await;
    fixture.storage.inject_failure(SHUFFLE_PREFIX);

    let report = StagingJob::new(&fixture.config(), vec![full_pending()])
        .run()
        .await;

    let key = DepositKey::new("example", DepositMode::Full, jan(1));
    match report.outcome(&key) {
        Some(DepositOutcome::Failed(reason)) => assert!(reason.contains("map phase"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
    fixture.storage.clear_failures();
    assert_eq!(rde_position(&fixture).await, jan(1));
    assert!(fixture.storage.applied_puts("rde/").is_empty());
}

#[tokio::test]
async fn cursor_outage_leaves_deposit_for_next_run() {
    let fixture = fixture().await;
    fixture.storage.inject_write_failure(CURSOR_PREFIX);

    let config = fixture.config();
    let key = DepositKey::new("example", DepositMode::Full, jan(1));
    let paths = key.paths(&fixture.settings.staging_prefix);
    let first = StagingJob::new(&config, vec![full_pending()]).run().await;
    assert!(matches!(first.outcome(&key), Some(DepositOutcome::Failed(_))));

    fixture.storage.clear_failures();
    assert_eq!(rde_position(&fixture).await, jan(1));
    assert!(fixture.queue.is_empty().unwrap());

    // Artifacts were written before the cursor write failed.
    let stored = fixture.storage.inner();
    let document = stored.get(&paths.document).await.unwrap();
    let length = stored.get(&paths.length).await.unwrap();

    let second = StagingJob::new(&config, vec![full_pending()]).run().await;
    assert!(matches!(
        second.outcome(&key),
        Some(DepositOutcome::Completed(_))
    ));
    assert_eq!(rde_position(&fixture).await, jan(2));
    assert_eq!(fixture.queue.len().unwrap(), 1);

    assert_eq!(stored.get(&paths.document).await.unwrap(), document);
    assert_eq!(stored.get(&paths.length).await.unwrap(), length);
}

#[tokio::test]
async fn staged_upload_survives_queue_outage() {
    let fixture = fixture().await;
    fixture.queue.fail_next(1);

    let report = StagingJob::new(&fixture.config(), vec![full_pending()])
        .run()
        .await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(rde_position(&fixture).await, jan(2));
    assert!(fixture.queue.is_empty().unwrap());

    let staged: usize = fixture
        .cursors()
        .list()
        .await
        .unwrap()
        .iter()
        .map(|r| r.outbox.len())
        .sum();
    assert_eq!(staged, 1);

    // The next run relays the staged request even though nothing is due.
    match StagingAction::new(fixture.config()).run().await.unwrap() {
        StagingOutcome::NoContent { .. } => {}
        StagingOutcome::JobLaunched(handle) => panic!("unexpected job {}", handle.job_id()),
    }
    let uploads = fixture.queue.entries().unwrap();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].request.watermark, jan(1));
    assert!(
        fixture
            .cursors()
            .list()
            .await
            .unwrap()
            .iter()
            .all(|r| r.outbox.is_empty())
    );

    // Relaying again is a no-op.
    StagingAction::new(fixture.config()).run().await.unwrap();
    assert_eq!(fixture.queue.len().unwrap(), 1);
}

#[tokio::test]
async fn cursor_writes_happen_after_artifacts() {
    let fixture = fixture().await;
    fixture.storage.clear_operations();

    let report = StagingJob::new(&fixture.config(), vec![full_pending()])
        .run()
        .await;
    assert!(report.is_success());

    let ops = fixture.storage.operations();
    let position = |prefix: &str| {
        ops.iter()
            .position(|op| op.is_applied_put() && op.path().starts_with(prefix))
            .unwrap()
    };
    let last_artifact = ops
        .iter()
        .rposition(|op| op.is_applied_put() && op.path().starts_with("rde/"))
        .unwrap();
    assert!(position(CURSOR_PREFIX) > last_artifact);
}
