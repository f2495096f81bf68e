//! Legacy migration over the in-memory backends, with legacy photo and
//! document URLs served by a mock HTTP server.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{photo, Harness};
use pmp_common::PhotoStatus;
use pmp_pipeline::db::{CandidateFilter, LegacyRepository, PhotoRepository, ProcessingLog};
use pmp_pipeline::migration::MigrationOptions;
use pmp_pipeline::models::{LegacyPhoto, LegacyProtocol, MigrationState, ProcessingLogEntry};
use pmp_pipeline::queue::{EnqueueOptions, JobKind, JobQueue, JobState};
use pmp_pipeline::storage::{keys, ObjectStore};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn legacy_protocol(age_days: i64, photo_urls: &[String], pdf_url: Option<String>) -> LegacyProtocol {
    LegacyProtocol {
        id: Uuid::new_v4(),
        vehicle_id: Some(Uuid::new_v4()),
        customer_id: None,
        rental_id: Some(Uuid::new_v4()),
        protocol_type: "handover".to_string(),
        data: serde_json::json!({ "fuelLevel": 80, "odometer": 42_000 }),
        pdf_url,
        created_at: Utc::now() - ChronoDuration::days(age_days),
        photos: photo_urls
            .iter()
            .map(|url| LegacyPhoto {
                id: Uuid::new_v4(),
                url: url.clone(),
                description: Some("front left".to_string()),
                category: Some("exterior".to_string()),
            })
            .collect(),
    }
}

async fn serve(server: &MockServer, route: &str, status: u16, body: Vec<u8>) -> String {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status).set_body_bytes(body))
        .mount(server)
        .await;
    format!("{}{}", server.uri(), route)
}

#[tokio::test]
async fn test_failed_protocol_does_not_stop_the_run() {
    let h = Harness::new();
    let server = MockServer::start().await;

    let a = legacy_protocol(3, &[serve(&server, "/a/1.jpg", 200, photo(1)).await], None);
    let b = legacy_protocol(2, &[serve(&server, "/b/1.jpg", 404, Vec::new()).await], None);
    let c = legacy_protocol(
        1,
        &[
            serve(&server, "/c/1.jpg", 200, photo(2)).await,
            serve(&server, "/c/2.jpg", 200, photo(3)).await,
        ],
        None,
    );
    for protocol in [&a, &b, &c] {
        h.repo.insert_legacy_protocol(protocol.clone()).await;
    }

    let orchestrator = h.context.migration_orchestrator().unwrap();
    let progress = orchestrator
        .run(&MigrationOptions {
            batch_size: 2,
            ..MigrationOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(progress.total, 3);
    assert_eq!(progress.processed, 3);
    assert_eq!(progress.successful, 2);
    assert_eq!(progress.failed, 1);
    assert_eq!(progress.errors.len(), 1);
    assert_eq!(progress.errors[0].protocol_id, b.id);
    assert!(progress.errors[0].error.contains("404"));
    assert_eq!(progress.percent(), 100);
    assert_eq!(orchestrator.progress().await, progress);

    let status = |id: Uuid| {
        let repo = h.repo.clone();
        async move { repo.migration_status(id).await.unwrap().unwrap() }
    };
    assert!(status(a.id).await.migrated);
    assert!(status(c.id).await.migrated);
    let failed = status(b.id).await;
    assert!(!failed.migrated);
    assert_eq!(failed.state, MigrationState::Failed);
    assert!(failed.error.is_some());

    // Migrated photos keep their legacy ids and are fully processed
    let photos = h.repo.list_protocol_photos(c.id).await.unwrap();
    assert_eq!(photos.len(), 2);
    for record in &photos {
        assert_eq!(record.status, PhotoStatus::Completed);
        assert!(c.photos.iter().any(|p| p.id == record.photo_id));
        assert_eq!(record.metadata["migrated"], true);
        assert!(h.store.object(&record.original_key).await.is_some());
    }

    // A second run only picks up the failed protocol
    let rerun = orchestrator.run(&MigrationOptions::default()).await.unwrap();
    assert_eq!(rerun.total, 1);
    assert_eq!(rerun.failed, 1);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let h = Harness::new();
    let server = MockServer::start().await;
    let url = serve(&server, "/d/1.jpg", 200, photo(4)).await;
    let protocol = legacy_protocol(1, &[url], None);
    h.repo.insert_legacy_protocol(protocol.clone()).await;

    let progress = h
        .context
        .migration_orchestrator()
        .unwrap()
        .run(&MigrationOptions {
            dry_run: true,
            ..MigrationOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(progress.total, 1);
    assert_eq!(progress.processed, 0);
    assert!(h.store.is_empty().await);
    assert!(!h.repo.migrated_row_exists(protocol.id).await.unwrap());
    let received = server.received_requests().await.unwrap_or_default();
    assert!(received.is_empty());
}

#[tokio::test]
async fn test_selection_by_date_and_id() {
    let h = Harness::new();
    let server = MockServer::start().await;
    let url = serve(&server, "/e/1.jpg", 200, photo(5)).await;
    let old = legacy_protocol(30, &[url.clone()], None);
    let recent = legacy_protocol(1, &[url], None);
    h.repo.insert_legacy_protocol(old.clone()).await;
    h.repo.insert_legacy_protocol(recent.clone()).await;

    let orchestrator = h.context.migration_orchestrator().unwrap();
    let progress = orchestrator
        .run(&MigrationOptions {
            selection: CandidateFilter {
                created_after: Some(Utc::now() - ChronoDuration::days(7)),
                ..CandidateFilter::default()
            },
            ..MigrationOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(progress.total, 1);
    assert!(h.repo.migration_status(recent.id).await.unwrap().unwrap().migrated);
    assert!(!h.repo.migration_status(old.id).await.unwrap().unwrap().migrated);

    let progress = orchestrator
        .run(&MigrationOptions {
            selection: CandidateFilter {
                protocol_ids: Some(vec![old.id]),
                ..CandidateFilter::default()
            },
            ..MigrationOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(progress.successful, 1);
    assert!(h.repo.migration_status(old.id).await.unwrap().unwrap().migrated);
}

#[tokio::test]
async fn test_legacy_bucket_urls_read_from_store() {
    let h = Harness::new();
    h.store
        .put("legacy/p1/front.jpg", photo(6), "image/jpeg", &Default::default())
        .await
        .unwrap();
    let protocol = legacy_protocol(
        1,
        &["https://pub.r2.dev/blackrent-storage/legacy/p1/front.jpg".to_string()],
        None,
    );
    h.repo.insert_legacy_protocol(protocol.clone()).await;

    let orchestrator = h.context.migration_orchestrator().unwrap();
    orchestrator.migrate_protocol(&protocol, false, true).await.unwrap();

    let record = h.repo.get_photo(protocol.photos[0].id).await.unwrap().unwrap();
    assert_eq!(record.status, PhotoStatus::Completed);
    assert_eq!(h.store.get(&record.original_key).await.unwrap(), photo(6));
}

#[tokio::test]
async fn test_pdf_is_moved_and_logged() {
    let h = Harness::new();
    let server = MockServer::start().await;
    let pdf = b"%PDF-1.4 handover protocol".to_vec();
    let pdf_url = serve(&server, "/pdf/handover.pdf", 200, pdf.clone()).await;
    let photo_url = serve(&server, "/f/1.jpg", 200, photo(7)).await;
    let protocol = legacy_protocol(1, &[photo_url], Some(pdf_url.clone()));
    h.repo.insert_legacy_protocol(protocol.clone()).await;

    let orchestrator = h.context.migration_orchestrator().unwrap();
    orchestrator.migrate_protocol(&protocol, true, false).await.unwrap();

    assert!(h.repo.list_protocol_photos(protocol.id).await.unwrap().is_empty());
    let entry = h
        .repo
        .latest(protocol.id, ProcessingLogEntry::PDF_MIGRATION)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.metadata["originalUrl"], pdf_url);
    assert_eq!(entry.metadata["fileSize"], pdf.len());
    let key = entry.metadata["key"].as_str().unwrap();
    assert_eq!(h.store.get(key).await.unwrap(), pdf);
    assert_eq!(h.store.object(key).await.unwrap().content_type, "application/pdf");

    // Migrating again reuses the stored document
    let puts = h.store.put_count();
    orchestrator.migrate_protocol(&protocol, true, false).await.unwrap();
    assert_eq!(h.store.put_count(), puts);
    assert_eq!(
        h.repo
            .count(protocol.id, ProcessingLogEntry::PDF_MIGRATION)
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn test_validate_rollback_and_purge() {
    let h = Harness::new();
    let server = MockServer::start().await;
    let urls = [
        serve(&server, "/g/1.jpg", 200, photo(8)).await,
        serve(&server, "/g/2.jpg", 200, photo(9)).await,
    ];
    let protocol = legacy_protocol(1, &urls, None);
    h.repo.insert_legacy_protocol(protocol.clone()).await;
    let orchestrator = h.context.migration_orchestrator().unwrap();

    let before = orchestrator.validate(protocol.id).await.unwrap();
    assert!(!before.is_valid());
    assert_eq!(
        before.issues,
        vec![
            "Migrated protocol record not found".to_string(),
            "Photo count mismatch: legacy=2, migrated=0".to_string(),
            "Protocol is not flagged as migrated (state not_migrated)".to_string(),
        ]
    );

    orchestrator.migrate_by_id(protocol.id, false, false).await.unwrap();
    let after = orchestrator.validate(protocol.id).await.unwrap();
    assert!(after.is_valid(), "{:?}", after.issues);
    assert_eq!(after.migrated_photo_count, 2);

    let prefix = keys::protocol_prefix(protocol.id);
    let stored = h.store.list(&prefix).await.unwrap().len();
    assert_eq!(stored, 8, "two originals and six renditions");

    assert!(orchestrator.purge_protocol_blobs(protocol.id).await.is_err());

    orchestrator.rollback(protocol.id).await.unwrap();
    let status = h.repo.migration_status(protocol.id).await.unwrap().unwrap();
    assert_eq!(status.state, MigrationState::NotMigrated);
    assert!(!status.migrated);
    assert!(h.repo.list_protocol_photos(protocol.id).await.unwrap().is_empty());
    assert_eq!(h.store.list(&prefix).await.unwrap().len(), stored);

    assert_eq!(orchestrator.purge_protocol_blobs(protocol.id).await.unwrap(), stored);
    assert!(h.store.list(&prefix).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_migrate_job_runs_through_the_queue() {
    let h = Harness::new();
    let server = MockServer::start().await;
    let url = serve(&server, "/h/1.jpg", 200, photo(10)).await;
    let protocol = legacy_protocol(1, &[url], None);
    h.repo.insert_legacy_protocol(protocol.clone()).await;

    let job_id = h
        .queue
        .enqueue(
            JobKind::MigrateProtocol {
                protocol_id: protocol.id,
                skip_photos: false,
                skip_pdfs: false,
            },
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    h.pool().drain().await.unwrap();

    assert_eq!(
        h.queue.get(job_id).await.unwrap().unwrap().state,
        JobState::Completed
    );
    assert!(h.repo.migration_status(protocol.id).await.unwrap().unwrap().migrated);
}

#[tokio::test]
async fn test_migrate_job_for_unknown_protocol_fails() {
    let h = Harness::new();
    let job_id = h
        .queue
        .enqueue(
            JobKind::MigrateProtocol {
                protocol_id: Uuid::new_v4(),
                skip_photos: false,
                skip_pdfs: false,
            },
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    h.pool().drain().await.unwrap();

    let job = h.queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.error.unwrap().contains("legacy protocol"));
}
