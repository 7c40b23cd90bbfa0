use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use forge_relay::{
    Channel, CredentialLedger, CredentialRecord, Error, LedgerClock, NewCredential, Result,
    RoutingMetadata,
    store::{LegacyRecord, RoutedRecord},
};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::sync::Arc;

const SCHEMA: &str = include_str!("../migrations/001_credential_ledgers.sql");

/// Credential ledgers in the `tokens` (legacy) and `tokens_next` (successor)
/// tables.
#[derive(Clone)]
pub struct SqliteLedger {
    db: SqlitePool,
    clock: Arc<LedgerClock>,
}

impl SqliteLedger {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            clock: Arc::new(LedgerClock::new()),
        }
    }

    /// Create both ledger tables if missing. Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.db)
            .await
            .map_err(storage)?;

        tracing::debug!("credential ledger schema ready");
        Ok(())
    }

    /// Seed the clock from the newest persisted record so stamps keep
    /// increasing across restarts.
    pub async fn resume_clock(&self) -> Result<()> {
        for table in ["tokens", "tokens_next"] {
            let row = sqlx::query(&format!("SELECT MAX(created_at) FROM {}", table))
                .fetch_one(&self.db)
                .await
                .map_err(storage)?;

            let latest: Option<String> = row.try_get(0).map_err(storage)?;
            if let Some(latest) = latest {
                self.clock.observe(parse_timestamp(&latest)?);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl CredentialLedger for SqliteLedger {
    async fn record(&self, credential: NewCredential) -> Result<CredentialRecord> {
        let record = credential.stamp(self.clock.next());
        let created_at = format_timestamp(record.captured_at());

        match &record {
            CredentialRecord::Legacy(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO tokens (token_value, created_at)
                    VALUES (?, ?)
                    "#,
                )
                .bind(&r.value)
                .bind(&created_at)
                .execute(&self.db)
                .await
                .map_err(storage)?;
            }
            CredentialRecord::Routed(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO tokens_next (
                        token_value, installation_id, api_base_url, app_id,
                        environment_type, environment_id, created_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&r.value)
                .bind(&r.routing.installation_id)
                .bind(&r.routing.api_base_url)
                .bind(&r.routing.app_id)
                .bind(&r.routing.environment_type)
                .bind(&r.routing.environment_id)
                .bind(&created_at)
                .execute(&self.db)
                .await
                .map_err(storage)?;
            }
        }

        Ok(record)
    }

    async fn most_recent(&self, channel: Channel) -> Result<Option<CredentialRecord>> {
        match channel {
            Channel::Legacy => {
                let row = sqlx::query(
                    r#"
                    SELECT token_value, created_at
                    FROM tokens
                    ORDER BY created_at DESC, id DESC
                    LIMIT 1
                    "#,
                )
                .fetch_optional(&self.db)
                .await
                .map_err(storage)?;

                row.map(|row| legacy_from_row(&row)).transpose()
            }
            Channel::Successor => {
                let row = sqlx::query(
                    r#"
                    SELECT token_value, installation_id, api_base_url, app_id,
                           environment_type, environment_id, created_at
                    FROM tokens_next
                    ORDER BY created_at DESC, id DESC
                    LIMIT 1
                    "#,
                )
                .fetch_optional(&self.db)
                .await
                .map_err(storage)?;

                row.map(|row| routed_from_row(&row)).transpose()
            }
        }
    }
}

fn legacy_from_row(row: &SqliteRow) -> Result<CredentialRecord> {
    let value: String = row.try_get("token_value").map_err(storage)?;
    let created_at: String = row.try_get("created_at").map_err(storage)?;

    Ok(CredentialRecord::Legacy(LegacyRecord {
        value,
        captured_at: parse_timestamp(&created_at)?,
    }))
}

fn routed_from_row(row: &SqliteRow) -> Result<CredentialRecord> {
    let value: String = row.try_get("token_value").map_err(storage)?;
    let created_at: String = row.try_get("created_at").map_err(storage)?;

    Ok(CredentialRecord::Routed(RoutedRecord {
        value,
        captured_at: parse_timestamp(&created_at)?,
        routing: RoutingMetadata {
            installation_id: row.try_get("installation_id").map_err(storage)?,
            api_base_url: row.try_get("api_base_url").map_err(storage)?,
            app_id: row.try_get("app_id").map_err(storage)?,
            environment_type: row.try_get("environment_type").map_err(storage)?,
            environment_id: row.try_get("environment_id").map_err(storage)?,
        },
    }))
}

// Fixed-width so TEXT ordering matches chronological ordering.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("bad created_at {:?}: {}", raw, e)))
}

fn storage(e: sqlx::Error) -> Error {
    Error::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    // One connection: every connection to `sqlite::memory:` is its own database.
    async fn ledger() -> SqliteLedger {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let ledger = SqliteLedger::new(pool);
        ledger.init_schema().await.unwrap();
        ledger
    }

    fn legacy(value: &str) -> NewCredential {
        NewCredential::Legacy {
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let ledger = ledger().await;
        ledger.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn empty_tables_have_no_most_recent() {
        let ledger = ledger().await;
        assert!(ledger.most_recent(Channel::Legacy).await.unwrap().is_none());
        assert!(ledger.most_recent(Channel::Successor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn legacy_round_trip() {
        let ledger = ledger().await;
        let written = ledger.record(legacy("abc123")).await.unwrap();

        let read = ledger.most_recent(Channel::Legacy).await.unwrap().unwrap();
        assert_eq!(read, written);
        assert!(ledger.most_recent(Channel::Successor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn routed_round_trip_keeps_metadata() {
        let ledger = ledger().await;
        let routing = RoutingMetadata {
            installation_id: "INST1".into(),
            api_base_url: "https://api.example".into(),
            app_id: "APP1".into(),
            environment_type: "DEVELOPMENT".into(),
            environment_id: "ENV1".into(),
        };
        let written = ledger
            .record(NewCredential::Routed {
                value: "jwt".into(),
                routing: routing.clone(),
            })
            .await
            .unwrap();

        let read = ledger.most_recent(Channel::Successor).await.unwrap().unwrap();
        assert_eq!(read, written);
        assert_eq!(read.routing(), Some(&routing));
    }

    #[tokio::test]
    async fn latest_of_many_identical_captures() {
        let ledger = ledger().await;
        let mut last = None;
        for _ in 0..5 {
            last = Some(ledger.record(legacy("same")).await.unwrap());
        }

        let count: i64 = sqlx::query("SELECT COUNT(*) FROM tokens")
            .fetch_one(&ledger.db)
            .await
            .unwrap()
            .get(0);
        assert_eq!(count, 5);

        let read = ledger.most_recent(Channel::Legacy).await.unwrap();
        assert_eq!(read, last);
    }

    #[tokio::test]
    async fn value_is_bound_not_interpolated() {
        let ledger = ledger().await;
        let hostile = "x'); DROP TABLE tokens; --";
        ledger.record(legacy(hostile)).await.unwrap();

        let read = ledger.most_recent(Channel::Legacy).await.unwrap().unwrap();
        assert_eq!(read.value(), hostile);
    }

    #[tokio::test]
    async fn clock_resumes_from_persisted_rows() {
        let ledger = ledger().await;
        let future = "2999-01-01T00:00:00.000000Z";
        sqlx::query("INSERT INTO tokens (token_value, created_at) VALUES (?, ?)")
            .bind("from-the-future")
            .bind(future)
            .execute(&ledger.db)
            .await
            .unwrap();

        // Fresh handle over the same pool, as after a restart.
        let restarted = SqliteLedger::new(ledger.db.clone());
        restarted.resume_clock().await.unwrap();
        let written = restarted.record(legacy("after-restart")).await.unwrap();

        assert!(written.captured_at() > parse_timestamp(future).unwrap());
        let read = restarted.most_recent(Channel::Legacy).await.unwrap().unwrap();
        assert_eq!(read.value(), "after-restart");
    }

    #[tokio::test]
    async fn omitted_metadata_columns_read_as_empty() {
        let ledger = ledger().await;
        sqlx::query("INSERT INTO tokens_next (token_value, created_at) VALUES (?, ?)")
            .bind("bare")
            .bind("2024-01-01T00:00:00.000000Z")
            .execute(&ledger.db)
            .await
            .unwrap();

        let read = ledger.most_recent(Channel::Successor).await.unwrap().unwrap();
        assert_eq!(read.value(), "bare");
        assert!(read.routing().unwrap().is_empty());
    }
}
