use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use super::error::{
    CreateSqliteDirectorySnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ChannelId, MessageId, ParticipantId};
use super::types::{LogEvent, MessageRecord, NewMessage, current_unix_millis};
use super::{BoxFuture, LogSubscription, MessageLog, make_subscription};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(750);

const CHANGE_FEED_CAPACITY: usize = 64;

/// Durable [`MessageLog`] backed by sqlite.
///
/// Local appends wake subscriptions immediately; a poll interval picks up rows written
/// by other processes sharing the same database file.
#[derive(Debug, Clone)]
pub struct SqliteLog {
    pool: SqlitePool,
    changes: broadcast::Sender<ChannelId>,
    poll_interval: Duration,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    sender_id: String,
    text: String,
    image: Option<String>,
    created_at: i64,
}

impl SqliteLog {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite message log");

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            pool,
            changes,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn list_messages(&self, channel_id: &ChannelId) -> StorageResult<Vec<MessageRecord>> {
        load_channel(&self.pool, channel_id).await
    }

    async fn run_subscription(
        pool: SqlitePool,
        channel_id: ChannelId,
        mut changes: broadcast::Receiver<ChannelId>,
        poll_interval: Duration,
        event_tx: mpsc::UnboundedSender<LogEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_published: Option<Vec<MessageRecord>> = None;

        loop {
            match load_channel(&pool, &channel_id).await {
                Ok(records) => {
                    if last_published.as_ref() != Some(&records) {
                        if event_tx.send(LogEvent::Snapshot(records.clone())).is_err() {
                            return;
                        }
                        last_published = Some(records);
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        channel_id = %channel_id,
                        error = %error,
                        "sqlite subscription query failed; ending subscription"
                    );
                    let _ = event_tx.send(LogEvent::Failed {
                        reason: error.to_string(),
                    });
                    return;
                }
            }

            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(channel_id = %channel_id, "sqlite subscription cancelled");
                    return;
                }
                _ = ticker.tick() => {}
                changed = changes.recv() => match changed {
                    // Lagging only means we missed wakeups; the reload below covers them.
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }
}

impl MessageLog for SqliteLog {
    fn append<'a>(
        &'a self,
        channel_id: &'a ChannelId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageId>> {
        Box::pin(async move {
            let message_id = MessageId::new_v7();
            let now = u64_to_i64(current_unix_millis(), "sqlite-append-now")?;

            // Server time is kept strictly increasing per channel so equal wall-clock
            // readings never tie.
            sqlx::query(
                "INSERT INTO messages (id, channel_id, sender_id, text, image, created_at) VALUES (?, ?, ?, ?, ?, MAX(?, COALESCE((SELECT MAX(created_at) + 1 FROM messages WHERE channel_id = ?), 0)))",
            )
            .bind(message_id.to_string())
            .bind(channel_id.as_str())
            .bind(input.sender_id.as_str())
            .bind(input.text)
            .bind(input.image)
            .bind(now)
            .bind(channel_id.as_str())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-append-insert",
            })?;

            // No receivers simply means nobody is watching right now.
            let _ = self.changes.send(channel_id.clone());
            Ok(message_id)
        })
    }

    fn subscribe_ordered(&self, channel_id: &ChannelId) -> StorageResult<LogSubscription> {
        let (event_tx, subscription, cancel_rx) = make_subscription(channel_id.clone());
        tokio::spawn(Self::run_subscription(
            self.pool.clone(),
            channel_id.clone(),
            self.changes.subscribe(),
            self.poll_interval,
            event_tx,
            cancel_rx,
        ));
        Ok(subscription)
    }
}

async fn load_channel(pool: &SqlitePool, channel_id: &ChannelId) -> StorageResult<Vec<MessageRecord>> {
    let rows = sqlx::query_as::<_, MessageRow>(
        "SELECT id, sender_id, text, image, created_at FROM messages WHERE channel_id = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(channel_id.as_str())
    .fetch_all(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "sqlite-load-channel",
    })?;

    rows.into_iter().map(message_row_to_record).collect()
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        text: row.text,
        image: row.image.filter(|image| !image.is_empty()),
        sender_id: ParticipantId::new(row.sender_id),
        created_at_unix_millis: Some(i64_to_u64(row.created_at, "message-row-created-at")?),
    })
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp_log(dir: &tempfile::TempDir) -> SqliteLog {
        let path = dir.path().join("nested").join("synapse.db");
        SqliteLog::open(&path.display().to_string())
            .await
            .expect("open sqlite log")
            .with_poll_interval(Duration::from_millis(20))
    }

    async fn next_snapshot(subscription: &mut LogSubscription) -> Vec<MessageRecord> {
        match tokio::time::timeout(Duration::from_secs(5), subscription.recv()).await {
            Ok(Some(LogEvent::Snapshot(records))) => records,
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn database_url_normalization() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_database_url("sqlite://already.db"),
            "sqlite://already.db"
        );
        assert_eq!(normalize_database_url("data/a.db"), "sqlite://data/a.db");
    }

    #[tokio::test]
    async fn appends_are_ordered_and_stamped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = open_temp_log(&dir).await;
        let channel_id = ChannelId::new("direct:2:u1_u2");

        let first = log
            .append(&channel_id, NewMessage::text(ParticipantId::new("u1"), "one"))
            .await
            .expect("append one");
        let second = log
            .append(
                &channel_id,
                NewMessage::text(ParticipantId::new("u2"), "two").with_image("https://img/x.png"),
            )
            .await
            .expect("append two");

        let records = log.list_messages(&channel_id).await.expect("list");
        assert_eq!(
            records.iter().map(|record| record.id).collect::<Vec<_>>(),
            vec![first, second]
        );
        assert_eq!(records[1].image.as_deref(), Some("https://img/x.png"));
        assert!(records[0].created_at_unix_millis < records[1].created_at_unix_millis);
    }

    #[tokio::test]
    async fn subscription_sees_local_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = open_temp_log(&dir).await;
        let channel_id = ChannelId::new("assistant:u1");

        let mut subscription = log.subscribe_ordered(&channel_id).expect("subscribe");
        assert!(next_snapshot(&mut subscription).await.is_empty());

        log.append(&channel_id, NewMessage::text(ParticipantId::new("u1"), "hello"))
            .await
            .expect("append");

        let records = next_snapshot(&mut subscription).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "hello");
    }

    #[tokio::test]
    async fn subscription_sees_appends_from_another_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let watcher = open_temp_log(&dir).await;
        let writer = open_temp_log(&dir).await;
        let channel_id = ChannelId::new("direct:2:u1_u2");

        let mut subscription = watcher.subscribe_ordered(&channel_id).expect("subscribe");
        assert!(next_snapshot(&mut subscription).await.is_empty());

        writer
            .append(&channel_id, NewMessage::text(ParticipantId::new("u2"), "from afar"))
            .await
            .expect("append");

        let records = next_snapshot(&mut subscription).await;
        assert_eq!(records[0].sender_id, ParticipantId::new("u2"));
    }

    #[tokio::test]
    async fn query_failure_ends_subscription_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = open_temp_log(&dir).await;
        let channel_id = ChannelId::new("assistant:u1");

        let mut subscription = log.subscribe_ordered(&channel_id).expect("subscribe");
        assert!(next_snapshot(&mut subscription).await.is_empty());

        sqlx::query("DROP TABLE messages")
            .execute(&log.pool)
            .await
            .expect("drop messages table");

        let event = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("failure event");
        match event {
            Some(LogEvent::Failed { reason }) => assert!(reason.contains("sqlite-load-channel")),
            other => panic!("expected failure, got {other:?}"),
        }

        let closed = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("subscription closed");
        assert!(closed.is_none());
    }
}
