//! # Event Publisher
//!
//! Publishes domain facts for the transport layer to fan out: an
//! object-safe async trait (via `async-trait`) with one production
//! implementation, so tests can swap in a recording stub instead of a
//! real publisher.

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{Event, EventKind};

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Appends the event to the durable log, inside `tx` so publication
    /// can never be observed independent of the mutation it describes,
    /// then best-effort notifies any live in-process subscribers.
    async fn publish(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        kind: EventKind,
    ) -> AppResult<()>;
}

/// Default publisher: persists to `events` and fans out on a broadcast
/// channel for in-process subscribers (the transport layer would
/// subscribe to this in a full deployment).
pub struct StoredEventPublisher {
    sender: broadcast::Sender<Event>,
}

impl StoredEventPublisher {
    pub fn new() -> Self {
        // Bounded so a slow/absent subscriber can't grow memory unbounded;
        // subscribers that fall behind simply miss notifications and fall
        // back to polling the durable log, consistent with "consumers
        // must tolerate at-least-once delivery".
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for StoredEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for StoredEventPublisher {
    async fn publish(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        kind: EventKind,
    ) -> AppResult<()> {
        let payload = serde_json::to_value(&kind).map_err(|_| crate::error::AppError::Internal)?;
        let id = Uuid::new_v4();

        let row = sqlx::query!(
            r#"
            INSERT INTO events (id, payload)
            VALUES ($1, $2)
            RETURNING created_at
            "#,
            id,
            payload
        )
        .fetch_one(tx.as_mut())
        .await?;

        let event = Event { id, kind, created_at: row.created_at };
        trace!(event_id = %id, "event appended to log");
        // A full channel or no subscribers is not an error, the log is
        // the durable source of truth.
        let _ = self.sender.send(event);

        Ok(())
    }
}

pub async fn recent_events(db_pool: &PgPool, limit: i64) -> AppResult<Vec<Event>> {
    let rows = sqlx::query!(
        r#"SELECT id, payload, created_at FROM events ORDER BY created_at DESC LIMIT $1"#,
        limit
    )
    .fetch_all(db_pool)
    .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let kind: EventKind =
            serde_json::from_value(row.payload).map_err(|_| crate::error::AppError::Internal)?;
        events.push(Event { id: row.id, kind, created_at: row.created_at });
    }
    Ok(events)
}
