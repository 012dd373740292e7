use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    DurableLogError, LogQuery, LogRecord, RecordId, RecordType, Result, SagaId, SequenceNo,
    Snapshot,
    log::{AppendOptions, DurableLog, RecordStream, validate_records_for_append},
};

const RECORD_COLUMNS: &str =
    "id, saga_id, saga_type, sequence, timestamp, record_type, step_name, payload, metadata";

/// PostgreSQL-backed durable log.
#[derive(Clone)]
pub struct PostgresDurableLog {
    pool: PgPool,
}

impl PostgresDurableLog {
    /// Creates a new PostgreSQL durable log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_record(row: PgRow) -> Result<LogRecord> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;
        let record_type: String = row.try_get("record_type")?;

        Ok(LogRecord {
            record_id: RecordId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_id: SagaId::new(row.try_get::<String, _>("saga_id")?),
            saga_type: row.try_get("saga_type")?,
            sequence: SequenceNo::new(row.try_get("sequence")?),
            timestamp: row.try_get("timestamp")?,
            record_type: record_type.parse()?,
            step_name: row.try_get("step_name")?,
            payload: row.try_get("payload")?,
            metadata,
        })
    }
}

#[async_trait]
impl DurableLog for PostgresDurableLog {
    async fn append(&self, records: Vec<LogRecord>, options: AppendOptions) -> Result<SequenceNo> {
        validate_records_for_append(&records)?;

        let saga_id = records[0].saga_id.clone();
        let mut tx = self.pool.begin().await?;

        if let Some(expected) = options.expected_sequence {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT MAX(sequence) FROM saga_log WHERE saga_id = $1")
                    .bind(saga_id.as_str())
                    .fetch_one(&mut *tx)
                    .await?;

            let actual = SequenceNo::new(current.unwrap_or(0));
            if actual != expected {
                return Err(DurableLogError::ConcurrencyConflict {
                    saga_id,
                    expected,
                    actual,
                });
            }
        }

        let mut last = SequenceNo::initial();
        for record in &records {
            let metadata_json = serde_json::to_value(&record.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO saga_log (id, saga_id, saga_type, sequence, timestamp, record_type, step_name, payload, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(record.record_id.as_uuid())
            .bind(record.saga_id.as_str())
            .bind(&record.saga_type)
            .bind(record.sequence.as_i64())
            .bind(record.timestamp)
            .bind(record.record_type.as_str())
            .bind(&record.step_name)
            .bind(&record.payload)
            .bind(metadata_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // Another writer already holds this sequence number
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_saga_sequence")
                {
                    return DurableLogError::ConcurrencyConflict {
                        saga_id: saga_id.clone(),
                        expected: options.expected_sequence.unwrap_or(SequenceNo::initial()),
                        actual: record.sequence,
                    };
                }
                DurableLogError::Database(e)
            })?;

            last = record.sequence;
        }

        tx.commit().await?;
        metrics::counter!("durable_log_appends_total").increment(records.len() as u64);
        tracing::trace!(saga_id = %saga_id, sequence = %last, "appended saga log records");

        Ok(last)
    }

    async fn read(&self, saga_id: &SagaId) -> Result<Vec<LogRecord>> {
        let sql =
            format!("SELECT {RECORD_COLUMNS} FROM saga_log WHERE saga_id = $1 ORDER BY sequence ASC");
        let rows = sqlx::query(&sql)
            .bind(saga_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn read_from(&self, saga_id: &SagaId, from: SequenceNo) -> Result<Vec<LogRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM saga_log WHERE saga_id = $1 AND sequence >= $2 ORDER BY sequence ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(saga_id.as_str())
            .bind(from.as_i64())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn query(&self, query: LogQuery) -> Result<Vec<LogRecord>> {
        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM saga_log WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.saga_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND saga_id = ${param_count}"));
        }
        if query.saga_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND saga_type = ${param_count}"));
        }
        if query.record_types.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND record_type = ANY(${param_count})"));
        }
        if query.step_name.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND step_name = ${param_count}"));
        }
        if query.from_sequence.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND sequence >= ${param_count}"));
        }
        if query.to_sequence.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND sequence <= ${param_count}"));
        }
        if query.from_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND timestamp >= ${param_count}"));
        }
        if query.to_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND timestamp <= ${param_count}"));
        }

        sql.push_str(" ORDER BY timestamp ASC, sequence ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(id) = query.saga_id {
            sqlx_query = sqlx_query.bind(id.as_str().to_owned());
        }
        if let Some(saga_type) = query.saga_type {
            sqlx_query = sqlx_query.bind(saga_type);
        }
        if let Some(record_types) = query.record_types {
            let names: Vec<String> = record_types
                .iter()
                .map(|t| t.as_str().to_owned())
                .collect();
            sqlx_query = sqlx_query.bind(names);
        }
        if let Some(step_name) = query.step_name {
            sqlx_query = sqlx_query.bind(step_name);
        }
        if let Some(from) = query.from_sequence {
            sqlx_query = sqlx_query.bind(from.as_i64());
        }
        if let Some(to) = query.to_sequence {
            sqlx_query = sqlx_query.bind(to.as_i64());
        }
        if let Some(from_ts) = query.from_timestamp {
            sqlx_query = sqlx_query.bind(from_ts);
        }
        if let Some(to_ts) = query.to_timestamp {
            sqlx_query = sqlx_query.bind(to_ts);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn records_by_type(&self, record_type: RecordType) -> Result<Vec<LogRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM saga_log WHERE record_type = $1 ORDER BY timestamp ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(record_type.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn stream_all(&self) -> Result<RecordStream> {
        use futures_util::StreamExt;

        let sql = format!("SELECT {RECORD_COLUMNS} FROM saga_log ORDER BY position ASC");

        // Rows are fetched eagerly; a RecordStream cannot borrow the pool
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let stream = futures_util::stream::iter(rows).map(Self::row_to_record);

        Ok(Box::pin(stream))
    }

    async fn active_sagas(&self) -> Result<Vec<SagaId>> {
        let terminal: Vec<String> = RecordType::ALL
            .iter()
            .filter(|t| t.is_terminal())
            .map(|t| t.as_str().to_owned())
            .collect();

        // Served by the (saga_id, sequence) index
        let saga_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT saga_id FROM (
                SELECT DISTINCT ON (saga_id) saga_id, record_type
                FROM saga_log
                ORDER BY saga_id, sequence DESC
            ) AS last_record
            WHERE record_type <> ALL($1)
            ORDER BY saga_id
            "#,
        )
        .bind(terminal)
        .fetch_all(&self.pool)
        .await?;

        Ok(saga_ids.into_iter().map(SagaId::new).collect())
    }

    async fn last_sequence(&self, saga_id: &SagaId) -> Result<Option<SequenceNo>> {
        let sequence: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM saga_log WHERE saga_id = $1")
                .bind(saga_id.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(sequence.map(SequenceNo::new))
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_snapshots (saga_id, saga_type, sequence, timestamp, state)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (saga_id) DO UPDATE SET
                saga_type = EXCLUDED.saga_type,
                sequence = EXCLUDED.sequence,
                timestamp = EXCLUDED.timestamp,
                state = EXCLUDED.state
            "#,
        )
        .bind(snapshot.saga_id.as_str())
        .bind(&snapshot.saga_type)
        .bind(snapshot.sequence.as_i64())
        .bind(snapshot.timestamp)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_snapshot(&self, saga_id: &SagaId) -> Result<Option<Snapshot>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT saga_id, saga_type, sequence, timestamp, state
            FROM saga_snapshots
            WHERE saga_id = $1
            "#,
        )
        .bind(saga_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Snapshot {
                saga_id: SagaId::new(row.try_get::<String, _>("saga_id")?),
                saga_type: row.try_get("saga_type")?,
                sequence: SequenceNo::new(row.try_get("sequence")?),
                timestamp: row.try_get::<DateTime<Utc>, _>("timestamp")?,
                state: row.try_get("state")?,
            })),
            None => Ok(None),
        }
    }
}
