#![allow(dead_code)]

use sqlx::PgPool;
use tandem::models::{Gender, GenderPreference};
use time::OffsetDateTime;
use uuid::Uuid;

/// Builder for a seeded user row, mirroring a realistic profile shape
/// without dragging in any of the external profile store's fields.
pub struct TestUser {
    pub id: Uuid,
    pub gender: Gender,
    pub age: i16,
    pub latitude: f64,
    pub longitude: f64,
    pub online: bool,
    pub last_active: OffsetDateTime,
    pub cooldown_until: Option<OffsetDateTime>,
    pub min_age: i16,
    pub max_age: i16,
    pub max_distance: f64,
    pub gender_pref: GenderPreference,
}

impl TestUser {
    pub fn male(now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            gender: Gender::Male,
            age: 25,
            latitude: 39.9,
            longitude: 116.4,
            online: true,
            last_active: now,
            cooldown_until: None,
            min_age: 18,
            max_age: 99,
            max_distance: 100.0,
            gender_pref: GenderPreference::Female,
        }
    }

    pub fn female(now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            gender: Gender::Female,
            age: 24,
            latitude: 39.91,
            longitude: 116.41,
            online: true,
            last_active: now,
            cooldown_until: None,
            min_age: 18,
            max_age: 99,
            max_distance: 100.0,
            gender_pref: GenderPreference::Male,
        }
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    pub fn last_active_at(mut self, at: OffsetDateTime) -> Self {
        self.last_active = at;
        self
    }
}

/// Inserts the user row and its initial `idle` `user_state` row, the
/// same pairing every real signup produces before ever calling `Spin`.
pub async fn seed_user(pool: &PgPool, user: &TestUser) -> Uuid {
    sqlx::query!(
        r#"
        INSERT INTO users (id, gender, age, latitude, longitude, online, last_active,
                            cooldown_until, min_age, max_age, max_distance, gender_pref)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
        user.id,
        user.gender as Gender,
        user.age,
        user.latitude,
        user.longitude,
        user.online,
        user.last_active,
        user.cooldown_until,
        user.min_age,
        user.max_age,
        user.max_distance,
        user.gender_pref as GenderPreference,
    )
    .execute(pool)
    .await
    .expect("seed user");

    sqlx::query!("INSERT INTO user_state (user_id, state) VALUES ($1, 'idle')", user.id)
        .execute(pool)
        .await
        .expect("seed user_state");

    user.id
}

pub async fn queue_len(pool: &PgPool, user_id: Uuid) -> i64 {
    sqlx::query_scalar!("SELECT count(*) FROM queue WHERE user_id = $1", user_id)
        .fetch_one(pool)
        .await
        .expect("count queue")
        .unwrap_or(0)
}

pub async fn match_count_not_completed(pool: &PgPool, user_id: Uuid) -> i64 {
    sqlx::query_scalar!(
        r#"SELECT count(*) FROM matches WHERE (user1_id = $1 OR user2_id = $1) AND status != 'completed'"#,
        user_id
    )
    .fetch_one(pool)
    .await
    .expect("count active matches")
    .unwrap_or(0)
}
