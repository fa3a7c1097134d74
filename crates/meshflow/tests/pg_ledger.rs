use chrono::{Duration, Utc};
use serial_test::serial;
use uuid::Uuid;

mod common;
use common::setup_db;

use meshflow::jobs::{JobLedger, JobState, JobsRepo, LedgerError, NewJob, Transition, TransitionOutcome};
use meshflow::storage::{image_key, model_key};

fn new_job() -> NewJob {
    let id = Uuid::new_v4();
    NewJob {
        id,
        image_key: image_key(id),
        image_content_type: "image/jpeg".into(),
        created_at: Utc::now(),
    }
}

#[tokio::test]
#[serial]
async fn insert_get_and_complete() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    let new = new_job();
    let id = new.id;
    let job = repo.insert(new).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(repo.get(id).await.unwrap(), Some(job.clone()));

    let started = match repo.transition(id, Transition::Start).await.unwrap() {
        TransitionOutcome::Applied(j) => j,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(started.state, JobState::Processing);
    assert!(started.updated_at >= job.updated_at);

    let done = match repo
        .transition(
            id,
            Transition::Complete {
                model_key: model_key(id),
            },
        )
        .await
        .unwrap()
    {
        TransitionOutcome::Applied(j) => j,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.model_key.as_deref(), Some(model_key(id).as_str()));
    assert_eq!(done.error, None);
}

#[tokio::test]
#[serial]
async fn transitions_are_conditional() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    let new = new_job();
    let id = new.id;
    repo.insert(new).await.unwrap();

    // cannot skip processing
    assert_eq!(
        repo.transition(id, Transition::Fail { error: "x".into() })
            .await
            .unwrap(),
        TransitionOutcome::Conflict {
            actual: JobState::Pending
        }
    );

    repo.transition(id, Transition::Start).await.unwrap();
    assert_eq!(
        repo.transition(id, Transition::Start).await.unwrap(),
        TransitionOutcome::Conflict {
            actual: JobState::Processing
        }
    );

    repo.transition(id, Transition::Fail { error: "bad input".into() })
        .await
        .unwrap();
    let job = repo.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.as_deref(), Some("bad input"));

    assert_eq!(
        repo.transition(Uuid::new_v4(), Transition::Start)
            .await
            .unwrap(),
        TransitionOutcome::Missing
    );
}

#[tokio::test]
#[serial]
async fn duplicate_ids_are_rejected() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    let new = new_job();
    repo.insert(new.clone()).await.unwrap();
    let err = repo.insert(new.clone()).await.unwrap_err();
    assert!(matches!(err, LedgerError::Duplicate(id) if id == new.id), "{err:?}");
}

#[tokio::test]
#[serial]
async fn counts_and_stale_listing() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool.clone());

    let a = new_job();
    let b = new_job();
    let (a_id, b_id) = (a.id, b.id);
    repo.insert(a).await.unwrap();
    repo.insert(b).await.unwrap();
    repo.transition(a_id, Transition::Start).await.unwrap();
    repo.transition(b_id, Transition::Start).await.unwrap();

    // age one of them
    sqlx::query("UPDATE conversions SET updated_at = now() - interval '1 hour' WHERE id = $1")
        .bind(a_id)
        .execute(&pool)
        .await
        .unwrap();

    let counts = repo.count_by_state().await.unwrap();
    assert_eq!(counts.processing, 2);
    assert_eq!(counts.total(), 2);

    let stale = repo
        .list_stale(Utc::now() - Duration::minutes(10), 10)
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, a_id);
    assert_eq!(
        repo.count_stale(Utc::now() - Duration::minutes(10))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
#[serial]
async fn pending_listing_returns_unstarted_jobs_oldest_first() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    let mut older = new_job();
    older.created_at = Utc::now() - Duration::minutes(5);
    let newer = new_job();
    let started = new_job();
    let (older_id, newer_id, started_id) = (older.id, newer.id, started.id);
    repo.insert(newer).await.unwrap();
    repo.insert(older).await.unwrap();
    repo.insert(started).await.unwrap();
    repo.transition(started_id, Transition::Start).await.unwrap();

    let ids: Vec<Uuid> = repo
        .list_pending(Utc::now() + Duration::seconds(5), 10)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(ids, vec![older_id, newer_id]);

    // rows touched after the cutoff are left alone
    let only_old = repo
        .list_pending(Utc::now() - Duration::minutes(1), 10)
        .await
        .unwrap();
    assert_eq!(only_old.len(), 1);
    assert_eq!(only_old[0].id, older_id);
}

#[tokio::test]
#[serial]
async fn schema_rejects_inconsistent_rows() {
    let Some(pool) = setup_db().await else { return };

    let id = Uuid::new_v4();
    let res = sqlx::query(
        "INSERT INTO conversions (id, image_key, image_content_type, status) VALUES ($1, $2, 'image/png', 'completed')",
    )
    .bind(id)
    .bind(image_key(id))
    .execute(&pool)
    .await;
    assert!(res.is_err(), "completed row without model_key must be rejected");
}
