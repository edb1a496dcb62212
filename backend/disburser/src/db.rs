//! Database layer — migrations and the SQLite-backed [`DisbursementStore`].

use async_trait::async_trait;
use chrono::DateTime;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::errors::{DisburserError, Result};
use crate::store::DisbursementStore;
use crate::types::{DisbursementTransaction, MilestoneId, StepEvent, StepEventRecord};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    // Make sure the file is created if it doesn't exist yet.
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}?mode=rwc")
    };

    // Every connection to an in-memory database sees its own empty database.
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Row shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct DisbursementRow {
    milestone_id: i64,
    safe_address: String,
    transaction_hash: Option<String>,
    required_signatures: i64,
    collected_signatures: i64,
    is_executed: bool,
    executed_at: Option<i64>,
    amount: String,
    recipient: String,
    retired: bool,
}

impl TryFrom<DisbursementRow> for DisbursementTransaction {
    type Error = DisburserError;

    fn try_from(row: DisbursementRow) -> Result<Self> {
        let id = row.milestone_id;
        let corrupt = move |field: &str| {
            DisburserError::Config(format!("corrupt {field} in disbursement row {id}"))
        };
        let executed_at = match row.executed_at {
            Some(secs) => {
                Some(DateTime::from_timestamp(secs, 0).ok_or_else(|| corrupt("executed_at"))?)
            }
            None => None,
        };
        Ok(DisbursementTransaction {
            milestone_id: row.milestone_id as u64,
            safe_address: row.safe_address,
            transaction_hash: row.transaction_hash,
            required_signatures: u32::try_from(row.required_signatures)
                .map_err(|_| corrupt("required_signatures"))?,
            collected_signatures: u32::try_from(row.collected_signatures)
                .map_err(|_| corrupt("collected_signatures"))?,
            is_executed: row.is_executed,
            executed_at,
            amount: row.amount.parse().map_err(|_| corrupt("amount"))?,
            recipient: row.recipient,
            retired: row.retired,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StepEventRow {
    id: i64,
    milestone_id: i64,
    step: String,
    status: String,
    data: Option<String>,
    error: Option<String>,
    created_at: i64,
}

impl TryFrom<StepEventRow> for StepEventRecord {
    type Error = DisburserError;

    fn try_from(row: StepEventRow) -> Result<Self> {
        let data = match row.data.as_deref() {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        Ok(StepEventRecord {
            id: row.id,
            event: StepEvent {
                milestone_id: row.milestone_id as u64,
                step: row.step.parse()?,
                status: row.status.parse()?,
                data,
                error: row.error,
            },
            created_at: row.created_at,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteStore { pool }
    }
}

#[async_trait]
impl DisbursementStore for SqliteStore {
    async fn load(&self, milestone_id: MilestoneId) -> Result<Option<DisbursementTransaction>> {
        let row = sqlx::query_as::<_, DisbursementRow>(
            r#"
            SELECT milestone_id, safe_address, transaction_hash, required_signatures,
                   collected_signatures, is_executed, executed_at, amount, recipient, retired
            FROM   disbursements
            WHERE  milestone_id = ?1
            "#,
        )
        .bind(milestone_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DisbursementTransaction::try_from).transpose()
    }

    /// Upsert keyed on `milestone_id`. The `WHERE` on the conflict branch keeps
    /// retired rows frozen.
    async fn save(&self, record: &DisbursementTransaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO disbursements
                (milestone_id, safe_address, transaction_hash, required_signatures,
                 collected_signatures, is_executed, executed_at, amount, recipient, retired)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(milestone_id) DO UPDATE SET
                transaction_hash     = excluded.transaction_hash,
                required_signatures  = excluded.required_signatures,
                collected_signatures = excluded.collected_signatures,
                is_executed          = excluded.is_executed,
                executed_at          = excluded.executed_at,
                retired              = excluded.retired,
                updated_at           = strftime('%s', 'now')
            WHERE disbursements.retired = 0
            "#,
        )
        .bind(record.milestone_id as i64)
        .bind(&record.safe_address)
        .bind(&record.transaction_hash)
        .bind(record.required_signatures as i64)
        .bind(record.collected_signatures as i64)
        .bind(record.is_executed)
        .bind(record.executed_at.map(|t| t.timestamp()))
        .bind(record.amount.to_string())
        .bind(&record.recipient)
        .bind(record.retired)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_events(&self, events: &[StepEvent]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for ev in events {
            let data = ev.data.as_ref().map(serde_json::to_string).transpose()?;
            sqlx::query(
                r#"
                INSERT INTO step_events (milestone_id, step, status, data, error)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(ev.milestone_id as i64)
            .bind(ev.step.as_str())
            .bind(ev.status.as_str())
            .bind(data)
            .bind(&ev.error)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn events(&self, milestone_id: MilestoneId) -> Result<Vec<StepEventRecord>> {
        let rows = sqlx::query_as::<_, StepEventRow>(
            r#"
            SELECT id, milestone_id, step, status, data, error, created_at
            FROM   step_events
            WHERE  milestone_id = ?1
            ORDER  BY id ASC
            "#,
        )
        .bind(milestone_id as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StepEventRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use crate::types::{DisbursementRequest, Status, Step};

    async fn store() -> SqliteStore {
        SqliteStore::new(init_pool("sqlite::memory:").await.unwrap())
    }

    fn record() -> DisbursementTransaction {
        DisbursementTransaction::new(DisbursementRequest {
            milestone_id: 42,
            safe_address: "0xSafe".into(),
            recipient: "0xPod".into(),
            amount: u128::MAX,
            transaction_hash: None,
        })
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let store = store().await;
        assert!(store.load(42).await.unwrap().is_none());

        let mut rec = record();
        store.save(&rec).await.unwrap();
        assert_eq!(store.load(42).await.unwrap().as_ref(), Some(&rec));

        rec.transaction_hash = Some("0xabc".into());
        rec.required_signatures = 2;
        rec.collected_signatures = 1;
        store.save(&rec).await.unwrap();
        assert_eq!(store.load(42).await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn retired_rows_are_frozen() {
        let store = store().await;
        let mut rec = record();
        rec.transaction_hash = Some("0xabc".into());
        rec.required_signatures = 2;
        rec.collected_signatures = 2;
        rec.is_executed = true;
        rec.executed_at = DateTime::from_timestamp(Utc::now().timestamp(), 0);
        rec.retired = true;
        store.save(&rec).await.unwrap();

        let mut tampered = rec.clone();
        tampered.is_executed = false;
        tampered.retired = false;
        store.save(&tampered).await.unwrap();

        assert_eq!(store.load(42).await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn step_log_keeps_order_and_payload() {
        let store = store().await;
        let events = vec![
            StepEvent {
                milestone_id: 42,
                step: Step::Propose,
                status: Status::Success,
                data: Some(json!({ "transactionHash": "0xabc" })),
                error: None,
            },
            StepEvent {
                milestone_id: 42,
                step: Step::CollectSignatures,
                status: Status::Error,
                data: None,
                error: Some("User rejected the request: no".into()),
            },
        ];
        store.append_events(&events).await.unwrap();

        let log = store.events(42).await.unwrap();
        let restored: Vec<StepEvent> = log.into_iter().map(|r| r.event).collect();
        assert_eq!(restored, events);
        assert!(store.events(7).await.unwrap().is_empty());
    }
}
