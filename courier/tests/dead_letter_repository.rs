//! Integration tests for the dead-letter repository.
//!
//! These tests use a real SQLite database (in-memory) to verify repository
//! operations against the migrated schema.

use courier::Error;
use courier::database::models::DeadLetterDbModel;
use courier::database::repositories::{
    DeadLetterRepository, REPLAY_QUEUED, SqlxDeadLetterRepository,
};
use courier::database::{DbPool, init_pool_with_size, run_migrations};
use courier::delivery::{DeadLetterFilter, ErrorClass, Page};

/// Helper to create a test database pool with migrations applied.
///
/// In-memory databases are per connection, so the pool holds exactly one.
async fn setup_test_db() -> DbPool {
    let pool = init_pool_with_size("sqlite::memory:", 1)
        .await
        .expect("Failed to create test pool");

    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

fn entry(id: &str, destination: &str, class: ErrorClass, failed_at: i64) -> DeadLetterDbModel {
    DeadLetterDbModel {
        id: id.to_string(),
        destination: destination.to_string(),
        priority: "high".to_string(),
        payload: r#"{"severity":"critical","status":"firing","body":{"host":"db-1"}}"#.to_string(),
        error_message: "HTTP 503: upstream unavailable".to_string(),
        error_class: class.as_str().to_string(),
        retry_count: 3,
        submitted_at: failed_at - 5_000,
        failed_at,
        expires_at: failed_at + 60_000,
        replay_of: None,
        replayed_at: None,
        replay_job_id: None,
        replay_result: None,
    }
}

#[tokio::test]
async fn test_upsert_and_get() {
    let repo = SqlxDeadLetterRepository::new(setup_test_db().await);
    let row = entry("job-1", "pagerduty", ErrorClass::Transient, 1_000_000);

    repo.upsert(&row).await.unwrap();
    let fetched = repo.get("job-1").await.unwrap();

    assert_eq!(fetched, row);
    assert_eq!(repo.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_upsert_is_keyed_by_job_id() {
    let repo = SqlxDeadLetterRepository::new(setup_test_db().await);
    repo.upsert(&entry("job-1", "pagerduty", ErrorClass::Transient, 1_000))
        .await
        .unwrap();

    let mut again = entry("job-1", "pagerduty", ErrorClass::Permanent, 2_000);
    again.error_message = "HTTP 401".to_string();
    repo.upsert(&again).await.unwrap();

    assert_eq!(repo.count().await.unwrap(), 1);
    let fetched = repo.get("job-1").await.unwrap();
    assert_eq!(fetched.error_class, "permanent");
    assert_eq!(fetched.failed_at, 2_000);
}

#[tokio::test]
async fn test_get_missing_is_not_found() {
    let repo = SqlxDeadLetterRepository::new(setup_test_db().await);
    let err = repo.get("missing").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn test_list_filters_and_orders() {
    let repo = SqlxDeadLetterRepository::new(setup_test_db().await);
    repo.upsert(&entry("a", "pagerduty", ErrorClass::Transient, 1_000))
        .await
        .unwrap();
    repo.upsert(&entry("b", "slack", ErrorClass::Permanent, 3_000))
        .await
        .unwrap();
    repo.upsert(&entry("c", "pagerduty", ErrorClass::Permanent, 2_000))
        .await
        .unwrap();

    let all = repo
        .list(&DeadLetterFilter::new(), Page::default())
        .await
        .unwrap();
    let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "c", "a"]);

    let pagerduty = repo
        .list(
            &DeadLetterFilter::new().with_destination("pagerduty"),
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(pagerduty.len(), 2);

    let permanent_pagerduty = repo
        .list(
            &DeadLetterFilter::new()
                .with_destination("pagerduty")
                .with_error_class(ErrorClass::Permanent),
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(permanent_pagerduty.len(), 1);
    assert_eq!(permanent_pagerduty[0].id, "c");

    let second_page = repo
        .list(&DeadLetterFilter::new(), Page::new(1, 1))
        .await
        .unwrap();
    assert_eq!(second_page.len(), 1);
    assert_eq!(second_page[0].id, "c");
}

#[tokio::test]
async fn test_claim_replay_only_once() {
    let repo = SqlxDeadLetterRepository::new(setup_test_db().await);
    repo.upsert(&entry("job-1", "pagerduty", ErrorClass::Transient, 1_000))
        .await
        .unwrap();

    assert!(repo.claim_replay("job-1", "replay-1", 5_000).await.unwrap());
    assert!(!repo.claim_replay("job-1", "replay-2", 6_000).await.unwrap());

    let row = repo.get("job-1").await.unwrap();
    assert_eq!(row.replayed_at, Some(5_000));
    assert_eq!(row.replay_job_id.as_deref(), Some("replay-1"));
    assert_eq!(row.replay_result.as_deref(), Some(REPLAY_QUEUED));

    let replayed = repo
        .list(&DeadLetterFilter::new().with_replayed(true), Page::default())
        .await
        .unwrap();
    assert_eq!(replayed.len(), 1);

    let err = repo.claim_replay("missing", "replay-3", 5_000).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn test_release_and_record_replay() {
    let repo = SqlxDeadLetterRepository::new(setup_test_db().await);
    repo.upsert(&entry("job-1", "pagerduty", ErrorClass::Transient, 1_000))
        .await
        .unwrap();

    assert!(repo.claim_replay("job-1", "replay-1", 5_000).await.unwrap());
    // A release by a different claimant is ignored.
    repo.release_replay("job-1", "other").await.unwrap();
    assert!(repo.get("job-1").await.unwrap().is_replayed());

    repo.release_replay("job-1", "replay-1").await.unwrap();
    assert!(!repo.get("job-1").await.unwrap().is_replayed());

    assert!(repo.claim_replay("job-1", "replay-2", 6_000).await.unwrap());
    repo.record_replay_result("job-1", "succeeded").await.unwrap();
    let row = repo.get("job-1").await.unwrap();
    assert_eq!(row.replay_result.as_deref(), Some("succeeded"));
}

#[tokio::test]
async fn test_upsert_keeps_replay_marker() {
    let repo = SqlxDeadLetterRepository::new(setup_test_db().await);
    repo.upsert(&entry("job-1", "pagerduty", ErrorClass::Transient, 1_000))
        .await
        .unwrap();
    assert!(repo.claim_replay("job-1", "replay-1", 5_000).await.unwrap());

    repo.upsert(&entry("job-1", "pagerduty", ErrorClass::Transient, 7_000))
        .await
        .unwrap();
    assert!(repo.get("job-1").await.unwrap().is_replayed());
}

#[tokio::test]
async fn test_delete_expired() {
    let repo = SqlxDeadLetterRepository::new(setup_test_db().await);
    // expires_at = failed_at + 60_000
    repo.upsert(&entry("old", "pagerduty", ErrorClass::Transient, 0))
        .await
        .unwrap();
    repo.upsert(&entry("new", "pagerduty", ErrorClass::Transient, 100_000))
        .await
        .unwrap();

    let removed = repo.delete_expired(60_000).await.unwrap();

    assert_eq!(removed, 1);
    assert_eq!(repo.count().await.unwrap(), 1);
    assert!(repo.get("new").await.is_ok());
}
