mod common;

use std::sync::Arc;

use common::{TestUser, seed_user};
use sqlx::PgPool;
use tandem::clock::FakeClock;
use tandem::config::Config;
use tandem::models::UserLifecycleState;
use tandem::services::events::StoredEventPublisher;
use tandem::services::locks::AdvisoryLocks;
use tandem::services::scheduler::Scheduler;
use time::OffsetDateTime;

fn scheduler(pool: PgPool, clock: Arc<FakeClock>, config: Config) -> Scheduler {
    Scheduler::new(
        pool,
        clock,
        Arc::new(config),
        Arc::new(AdvisoryLocks::new()),
        Arc::new(StoredEventPublisher::new()),
    )
}

#[sqlx::test]
async fn match_tick_pairs_two_compatible_waiting_users(pool: PgPool) {
    let now = OffsetDateTime::now_utc();
    let m = seed_user(&pool, &TestUser::male(now)).await;
    let f = seed_user(&pool, &TestUser::female(now)).await;

    sqlx::query!("INSERT INTO queue (user_id, joined_at) VALUES ($1, $2), ($3, $2)", m, now, f)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query!("UPDATE user_state SET state = 'waiting' WHERE user_id IN ($1, $2)", m, f)
        .execute(&pool)
        .await
        .unwrap();

    let clock = Arc::new(FakeClock::new(now));
    let sched = scheduler(pool.clone(), clock, Config::default());
    sched.match_tick().await.unwrap();

    assert_eq!(common::match_count_not_completed(&pool, m).await, 1);
    assert_eq!(common::queue_len(&pool, m).await, 0);
    assert_eq!(common::queue_len(&pool, f).await, 0);
}

#[sqlx::test]
async fn eviction_tick_removes_stale_queue_entries(pool: PgPool) {
    let start = OffsetDateTime::now_utc();
    let u = seed_user(&pool, &TestUser::male(start).last_active_at(start)).await;

    sqlx::query!("INSERT INTO queue (user_id, joined_at) VALUES ($1, $2)", u, start)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query!("UPDATE user_state SET state = 'waiting' WHERE user_id = $1", u)
        .execute(&pool)
        .await
        .unwrap();

    let config = Config::default();
    let clock = Arc::new(FakeClock::new(start));
    // No further heartbeat arrives; advance clock past offline_threshold.
    clock.advance(config.offline_threshold + std::time::Duration::from_secs(1));

    let sched = scheduler(pool.clone(), clock, config);
    sched.eviction_tick().await.unwrap();

    assert_eq!(common::queue_len(&pool, u).await, 0);
    let state: UserLifecycleState = sqlx::query_scalar!(
        r#"SELECT state as "state: UserLifecycleState" FROM user_state WHERE user_id = $1"#,
        u
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(state, UserLifecycleState::Idle);
}

#[sqlx::test]
async fn cooldown_tick_releases_expired_cooldowns_to_idle(pool: PgPool) {
    let start = OffsetDateTime::now_utc();
    let u = seed_user(&pool, &TestUser::male(start)).await;

    sqlx::query!(
        "UPDATE user_state SET state = 'cooldown' WHERE user_id = $1",
        u
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query!(
        "UPDATE users SET cooldown_until = $2 WHERE id = $1",
        u,
        start + time::Duration::seconds(30)
    )
    .execute(&pool)
    .await
    .unwrap();

    let config = Config::default();
    let clock = Arc::new(FakeClock::new(start));
    clock.advance(std::time::Duration::from_secs(31));

    let sched = scheduler(pool.clone(), clock, config);
    sched.cooldown_tick().await.unwrap();

    let state: UserLifecycleState = sqlx::query_scalar!(
        r#"SELECT state as "state: UserLifecycleState" FROM user_state WHERE user_id = $1"#,
        u
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(state, UserLifecycleState::Idle);
}
