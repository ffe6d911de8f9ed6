mod common;

use std::sync::Arc;

use common::{TestUser, seed_user};
use sqlx::PgPool;
use tandem::clock::FakeClock;
use tandem::commands::Engine;
use tandem::config::Config;
use tandem::error::AppError;
use tandem::models::UserLifecycleState;
use tandem::services::events::StoredEventPublisher;
use tandem::services::locks::AdvisoryLocks;
use time::OffsetDateTime;

fn engine(pool: PgPool, clock: Arc<FakeClock>, config: Config) -> Engine {
    Engine::new(
        pool,
        clock,
        Arc::new(config),
        Arc::new(AdvisoryLocks::new()),
        Arc::new(StoredEventPublisher::new()),
    )
}

#[sqlx::test]
async fn spin_enters_the_queue_and_sets_waiting(pool: PgPool) {
    let now = OffsetDateTime::now_utc();
    let u = seed_user(&pool, &TestUser::male(now)).await;
    let eng = engine(pool.clone(), Arc::new(FakeClock::new(now)), Config::default());

    eng.spin(u).await.unwrap();

    assert_eq!(common::queue_len(&pool, u).await, 1);
    let status = eng.get_match_status(u).await.unwrap();
    assert_eq!(status.state, UserLifecycleState::Waiting);
}

#[sqlx::test]
async fn repeated_spin_while_waiting_is_rejected_and_does_not_duplicate_the_queue_row(pool: PgPool) {
    let now = OffsetDateTime::now_utc();
    let u = seed_user(&pool, &TestUser::male(now)).await;
    let eng = engine(pool.clone(), Arc::new(FakeClock::new(now)), Config::default());

    eng.spin(u).await.unwrap();
    let err = eng.spin(u).await.unwrap_err();
    assert!(matches!(err, AppError::AlreadyQueued));
    assert_eq!(common::queue_len(&pool, u).await, 1);
}

#[sqlx::test]
async fn spin_during_cooldown_is_rejected(pool: PgPool) {
    let now = OffsetDateTime::now_utc();
    let mut user = TestUser::male(now);
    user.cooldown_until = Some(now + time::Duration::seconds(30));
    let u = seed_user(&pool, &user).await;

    let eng = engine(pool.clone(), Arc::new(FakeClock::new(now)), Config::default());
    let err = eng.spin(u).await.unwrap_err();
    assert!(matches!(err, AppError::InCooldown));
}

#[sqlx::test]
async fn disconnect_while_waiting_clears_the_queue_with_no_penalty(pool: PgPool) {
    let now = OffsetDateTime::now_utc();
    let u = seed_user(&pool, &TestUser::male(now)).await;
    let eng = engine(pool.clone(), Arc::new(FakeClock::new(now)), Config::default());

    eng.spin(u).await.unwrap();
    eng.disconnect(u).await.unwrap();

    assert_eq!(common::queue_len(&pool, u).await, 0);
    let status = eng.get_match_status(u).await.unwrap();
    assert_eq!(status.state, UserLifecycleState::Idle);
}

#[sqlx::test]
async fn disconnect_while_matched_resolves_the_match_and_serves_cooldown(pool: PgPool) {
    let now = OffsetDateTime::now_utc();
    let m = seed_user(&pool, &TestUser::male(now)).await;
    let f = seed_user(&pool, &TestUser::female(now)).await;
    let eng = engine(pool.clone(), Arc::new(FakeClock::new(now)), Config::default());

    eng.spin(m).await.unwrap();
    eng.spin(f).await.unwrap();

    let status = eng.get_match_status(m).await.unwrap();
    let match_id = status.match_id.expect("spin should have paired m and f immediately");

    eng.disconnect(m).await.unwrap();

    let m_status = eng.get_match_status(m).await.unwrap();
    assert_eq!(m_status.state, UserLifecycleState::Cooldown);

    let f_status = eng.get_match_status(f).await.unwrap();
    assert_eq!(f_status.state, UserLifecycleState::Idle);

    let row = sqlx::query!(
        r#"SELECT status as "status: tandem::models::MatchStatus" FROM matches WHERE id = $1"#,
        match_id
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(row.status, tandem::models::MatchStatus::Completed);
}

#[sqlx::test]
async fn heartbeat_is_idempotent_and_only_touches_last_active(pool: PgPool) {
    let now = OffsetDateTime::now_utc();
    let u = seed_user(&pool, &TestUser::male(now)).await;
    let eng = engine(pool.clone(), Arc::new(FakeClock::new(now)), Config::default());

    eng.heartbeat(u).await.unwrap();
    eng.heartbeat(u).await.unwrap();

    let status = eng.get_match_status(u).await.unwrap();
    assert_eq!(status.state, UserLifecycleState::Idle);
}

#[sqlx::test]
async fn get_match_status_for_unknown_user_errors(pool: PgPool) {
    let eng = engine(pool, Arc::new(FakeClock::new(OffsetDateTime::now_utc())), Config::default());
    let err = eng.get_match_status(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, AppError::UnknownUser));
}
