//! Concurrent staging jobs over the same deposit.
//!
//! Jobs may be delivered more than once; whatever the interleaving, a
//! watermark is staged and its cursor advanced exactly once.

use chrono::{Duration, TimeZone, Utc};

use escrow_staging::cursor::CursorStore;
use escrow_staging::deposit::DepositKey;
use escrow_staging::error::Error;
use escrow_staging::job::{DepositOutcome, StagingJob};
use escrow_staging::mode::{CursorType, DepositMode};
use escrow_staging::pending::PendingDeposit;
use escrow_staging::upload::{UploadAction, UploadRequest};
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
    let fixture = RegistryFixture::new(Utc.with_ymd_and_hms(2024, 1, 2, 1, 0, 0).unwrap());
    fixture.tld("example").registrar("TheRegistrar", "The Registrar");
    for i in 0..20 {
        fixture.domain(
            &format!("d{i}.example"),
            "TheRegistrar",
            jan(1) - Duration::days(3),
        );
    }
    fixture.cursor_at("example", CursorType::RdeStaging, jan(1)).await;
    fixture
}

/// Many jobs race on one deposit - exactly one completes it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_jobs_complete_a_deposit_once() {
    let fixture = fixture().await;
    let config = fixture.config();

    let handles: Vec<_> = (0..6)
        .map(|_| StagingJob::new(&config, vec![full_pending()]).spawn())
        .collect();

    let key = DepositKey::new("example", DepositMode::Full, jan(1));
    let mut completed = 0;
    for handle in handles {
        let report = handle.wait().await.unwrap();
        match report.outcome(&key).unwrap() {
            DepositOutcome::Completed(artifact) => {
                completed += 1;
                let document = fixture.document(&artifact.paths).await;
                assert_eq!(document.fragments.len(), 21);
            }
            DepositOutcome::AlreadyCompleted | DepositOutcome::LockContended => {}
            DepositOutcome::Failed(reason) => panic!("job failed: {reason}"),
        }
    }

    assert_eq!(completed, 1);
    assert_eq!(
        fixture
            .cursors()
            .get("example", CursorType::RdeStaging)
            .await
            .unwrap(),
        jan(2)
    );
    assert_eq!(fixture.queue.len().unwrap(), 1);
    assert!(fixture.storage.paths().iter().all(|p| !p.starts_with("shuffle/")));
}

/// Concurrent advances of one cursor position - one writer wins.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_advances_move_cursor_once() {
    let fixture = fixture().await;
    let cursors = fixture.cursors();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cursors: CursorStore = cursors.clone();
            tokio::spawn(async move {
                let request = UploadRequest {
                    tld: "example".into(),
                    mode: DepositMode::Full,
                    watermark: jan(1),
                    action: UploadAction::RdeUpload,
                    document_path: "rde/example_2024-01-01_full_S1_R0.deposit.ghostryde".into(),
                };
                cursors
                    .advance_and_stage("example", CursorType::RdeStaging, jan(1), jan(2), request)
                    .await
            })
        })
        .collect();

    let mut advanced = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() {
            advanced += 1;
        }
    }
    assert_eq!(advanced, 1);

    let records = cursors.list().await.unwrap();
    let record = records
        .iter()
        .find(|r| r.cursor_type == CursorType::RdeStaging)
        .unwrap();
    assert_eq!(record.position, jan(2));
    assert_eq!(record.outbox.len(), 1);
}

/// A stale job cannot skip a deposit the cursor has not reached.
#[tokio::test]
async fn deposit_ahead_of_cursor_is_rejected() {
    let fixture = fixture().await;
    let mut ahead = full_pending();
    ahead.watermark = jan(3);

    let report = StagingJob::new(&fixture.config(), vec![ahead.clone()])
        .run()
        .await;
    assert!(matches!(
        report.outcome(&ahead.key()),
        Some(DepositOutcome::Failed(_))
    ));

    let err = fixture
        .cursors()
        .try_advance("example", CursorType::RdeStaging, jan(3), jan(4))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CursorOrdering { .. }));
    assert_eq!(
        fixture
            .cursors()
            .get("example", CursorType::RdeStaging)
            .await
            .unwrap(),
        jan(1)
    );
}
