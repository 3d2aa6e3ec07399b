// src/storage/postgres.rs

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::{JsonMutator, Storage, StorageError};

/// 键到关系表的映射：
/// `ledger:{auction_id}`                     -> ledger_records(auction_id PK)
/// `recommendation:{session_id}:{message_id}` -> recommendations((session_id, message_id) PK)
enum RecordAddress {
    Ledger(String),
    Recommendation(String, String),
}

impl RecordAddress {
    fn parse(key: &str) -> Result<Self, StorageError> {
        if let Some(id) = key.strip_prefix("ledger:") {
            return Ok(RecordAddress::Ledger(id.to_string()));
        }
        if let Some(rest) = key.strip_prefix("recommendation:") {
            if let Some((session, message)) = rest.split_once(':') {
                return Ok(RecordAddress::Recommendation(
                    session.to_string(),
                    message.to_string(),
                ));
            }
        }
        Err(StorageError::Corrupt(format!(
            "unsupported storage key shape: {}",
            key
        )))
    }
}

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS ledger_records (
        auction_id TEXT PRIMARY KEY,
        data JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_ledger_records_status
        ON ledger_records ((data->>'status'))",
    "CREATE TABLE IF NOT EXISTS recommendations (
        session_id TEXT NOT NULL,
        message_id TEXT NOT NULL,
        data JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (session_id, message_id)
    )",
];

/// 关系型后端。update 在单个事务里 `SELECT ... FOR UPDATE`，
/// 同一键上的并发读-改-写由行锁串行化。
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn connect_and_migrate(url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        }
        Ok(Self { pool })
    }

    // data 为 JSON null 的行是 update 占位行，对外视同不存在
    fn visible(data: Value) -> Option<Value> {
        if data.is_null() {
            None
        } else {
            Some(data)
        }
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let query = match RecordAddress::parse(key)? {
            RecordAddress::Ledger(id) => sqlx::query(
                "INSERT INTO ledger_records (auction_id, data) VALUES ($1, $2)
                 ON CONFLICT (auction_id)
                 DO UPDATE SET data = EXCLUDED.data, updated_at = now()",
            )
            .bind(id)
            .bind(value),
            RecordAddress::Recommendation(session, message) => sqlx::query(
                "INSERT INTO recommendations (session_id, message_id, data) VALUES ($1, $2, $3)
                 ON CONFLICT (session_id, message_id)
                 DO UPDATE SET data = EXCLUDED.data, updated_at = now()",
            )
            .bind(session)
            .bind(message)
            .bind(value),
        };
        query
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let row: Option<(Value,)> = match RecordAddress::parse(key)? {
            RecordAddress::Ledger(id) => {
                sqlx::query_as("SELECT data FROM ledger_records WHERE auction_id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
            }
            RecordAddress::Recommendation(session, message) => sqlx::query_as(
                "SELECT data FROM recommendations WHERE session_id = $1 AND message_id = $2",
            )
            .bind(session)
            .bind(message)
            .fetch_optional(&self.pool)
            .await,
        }
        .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(row.and_then(|(data,)| Self::visible(data)))
    }

    async fn update(&self, key: &str, mutator: JsonMutator) -> Result<Value, StorageError> {
        let address = RecordAddress::parse(key)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        // 先落一个占位行，保证随后的 FOR UPDATE 一定有行可锁，
        // 并发的 create-if-absent 因此也会串行化
        let current: Option<Value> = match &address {
            RecordAddress::Ledger(id) => {
                sqlx::query(
                    "INSERT INTO ledger_records (auction_id, data) VALUES ($1, 'null'::jsonb)
                     ON CONFLICT (auction_id) DO NOTHING",
                )
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
                let row: Option<(Value,)> = sqlx::query_as(
                    "SELECT data FROM ledger_records WHERE auction_id = $1 FOR UPDATE",
                )
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
                row.and_then(|(data,)| Self::visible(data))
            }
            RecordAddress::Recommendation(session, message) => {
                sqlx::query(
                    "INSERT INTO recommendations (session_id, message_id, data)
                     VALUES ($1, $2, 'null'::jsonb)
                     ON CONFLICT (session_id, message_id) DO NOTHING",
                )
                .bind(session)
                .bind(message)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
                let row: Option<(Value,)> = sqlx::query_as(
                    "SELECT data FROM recommendations
                     WHERE session_id = $1 AND message_id = $2 FOR UPDATE",
                )
                .bind(session)
                .bind(message)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
                row.and_then(|(data,)| Self::visible(data))
            }
        };

        // mutator 报错时直接返回，事务连同占位行一起回滚
        let next = mutator(current)?;

        match &address {
            RecordAddress::Ledger(id) => sqlx::query(
                "UPDATE ledger_records SET data = $2, updated_at = now() WHERE auction_id = $1",
            )
            .bind(id)
            .bind(&next)
            .execute(&mut *tx)
            .await,
            RecordAddress::Recommendation(session, message) => sqlx::query(
                "UPDATE recommendations SET data = $3, updated_at = now()
                 WHERE session_id = $1 AND message_id = $2",
            )
            .bind(session)
            .bind(message)
            .bind(&next)
            .execute(&mut *tx)
            .await,
        }
        .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_routing() {
        assert!(matches!(
            RecordAddress::parse("ledger:ctx_1"),
            Ok(RecordAddress::Ledger(id)) if id == "ctx_1"
        ));
        assert!(matches!(
            RecordAddress::parse("recommendation:sess_1:msg_1"),
            Ok(RecordAddress::Recommendation(s, m)) if s == "sess_1" && m == "msg_1"
        ));
        assert!(RecordAddress::parse("other:abc").is_err());
    }
}
