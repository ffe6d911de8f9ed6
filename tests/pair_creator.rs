mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{TestUser, seed_user};
use sqlx::PgPool;
use tandem::clock::SystemClock;
use tandem::config::Config;
use tandem::services::events::StoredEventPublisher;
use tandem::services::locks::AdvisoryLocks;
use tandem::services::pair_creator::{PairCreator, PairOutcome};
use time::OffsetDateTime;

#[sqlx::test]
async fn compatible_pair_creates_vote_active_match(pool: PgPool) {
    let now = OffsetDateTime::now_utc();
    let m = seed_user(&pool, &TestUser::male(now)).await;
    let f = seed_user(&pool, &TestUser::female(now)).await;

    sqlx::query!("INSERT INTO queue (user_id, joined_at) VALUES ($1, $2)", m, now)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query!("INSERT INTO queue (user_id, joined_at) VALUES ($1, $2)", f, now)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query!("UPDATE user_state SET state = 'waiting' WHERE user_id IN ($1, $2)", m, f)
        .execute(&pool)
        .await
        .unwrap();

    let clock = SystemClock;
    let config = Config::default();
    let locks = AdvisoryLocks::new();
    let events = StoredEventPublisher::new();

    let outcome = PairCreator::create_pair(&pool, &clock, &config, &locks, &events, m, f, 0)
        .await
        .unwrap();

    let created = match outcome {
        PairOutcome::Created(m) => m,
        other => panic!("expected Created, got {other:?}"),
    };
    assert_eq!(created.status, tandem::models::MatchStatus::VoteActive);
    assert!(created.vote_window_expires_at.is_some());

    // Queue is drained and both states moved to vote_window (P1, P5).
    assert_eq!(common::queue_len(&pool, m).await, 0);
    assert_eq!(common::queue_len(&pool, f).await, 0);

    let state: tandem::models::UserLifecycleState =
        sqlx::query_scalar!(r#"SELECT state as "state: tandem::models::UserLifecycleState" FROM user_state WHERE user_id = $1"#, m)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(state, tandem::models::UserLifecycleState::VoteWindow);
}

#[sqlx::test]
async fn never_pair_blocks_creation(pool: PgPool) {
    let now = OffsetDateTime::now_utc();
    let m = seed_user(&pool, &TestUser::male(now)).await;
    let f = seed_user(&pool, &TestUser::female(now)).await;
    let (lo, hi) = tandem::models::Match::canonical_order(m, f);

    sqlx::query!("INSERT INTO never_pair (least_id, greatest_id) VALUES ($1, $2)", lo, hi)
        .execute(&pool)
        .await
        .unwrap();

    sqlx::query!("INSERT INTO queue (user_id, joined_at) VALUES ($1, $2), ($3, $2)", m, now, f)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query!("UPDATE user_state SET state = 'waiting' WHERE user_id IN ($1, $2)", m, f)
        .execute(&pool)
        .await
        .unwrap();

    let clock = SystemClock;
    let config = Config::default();
    let locks = AdvisoryLocks::new();
    let events = StoredEventPublisher::new();

    // Even at tier 3, never_pair must still block (P6).
    let outcome = PairCreator::create_pair(&pool, &clock, &config, &locks, &events, m, f, 3)
        .await
        .unwrap();
    assert!(matches!(outcome, PairOutcome::NoMatch));
}

#[sqlx::test]
async fn concurrent_create_pair_both_directions_yields_exactly_one_success(pool: PgPool) {
    let now = OffsetDateTime::now_utc();
    let a = seed_user(&pool, &TestUser::male(now)).await;
    let b = seed_user(&pool, &TestUser::female(now)).await;

    sqlx::query!("INSERT INTO queue (user_id, joined_at) VALUES ($1, $2), ($3, $2)", a, now, b)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query!("UPDATE user_state SET state = 'waiting' WHERE user_id IN ($1, $2)", a, b)
        .execute(&pool)
        .await
        .unwrap();

    let locks = Arc::new(AdvisoryLocks::new());
    let events = Arc::new(StoredEventPublisher::new());
    let config = Arc::new(Config::default());
    let successes = Arc::new(AtomicUsize::new(0));

    // 100 concurrent workers, half calling CreatePair(a, b), half (b, a) —
    // P7 requires exactly one winner and no deadlock (bounded by the test
    // harness's own timeout if one ever occurred).
    let mut handles = Vec::with_capacity(100);
    for i in 0..100 {
        let pool = pool.clone();
        let locks = Arc::clone(&locks);
        let events = Arc::clone(&events);
        let config = Arc::clone(&config);
        let successes = Arc::clone(&successes);
        let (x, y) = if i % 2 == 0 { (a, b) } else { (b, a) };
        handles.push(tokio::spawn(async move {
            let clock = SystemClock;
            let outcome =
                PairCreator::create_pair(&pool, &clock, &config, &locks, &events, x, y, 0).await;
            if let Ok(PairOutcome::Created(_)) = outcome {
                successes.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(common::match_count_not_completed(&pool, a).await, 1);
}
