//! JSON key/value settings kept in `master.db`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("no such key: {0}")]
    NoSuchKey(String),
    #[error("invalid json value: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metadata database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("metadata writer stopped before completing")]
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct Metadata {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl Metadata {
    pub fn new(
        writer: SqlitePool,
        reader: SqlitePool,
    ) -> Self {
        Self { writer, reader }
    }

    /// Stores `value` in the background. The receiver resolves once the
    /// value is written.
    pub fn store_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> oneshot::Receiver<Result<(), MetadataError>> {
        let (tx, rx) = oneshot::channel();

        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                return rx;
            }
        };

        let pool = self.writer.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            let result = upsert(&pool, &key, &encoded).await;
            debug!("metadata stored: key={key}, ok={}", result.is_ok());
            let _ = tx.send(result);
        });

        rx
    }

    pub async fn retrieve_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<T, MetadataError> {
        let value: Option<String> = sqlx::query_scalar("select value from meta where key = ?")
            .bind(key)
            .fetch_optional(&self.reader)
            .await?;

        let value = value.ok_or_else(|| MetadataError::NoSuchKey(key.to_string()))?;
        Ok(serde_json::from_str(&value)?)
    }
}

async fn upsert(
    pool: &SqlitePool,
    key: &str,
    value: &str,
) -> Result<(), MetadataError> {
    sqlx::query("insert into meta(key, value) values(?, ?) on conflict(key) do update set value = excluded.value")
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
    Ok(())
}

/// Waits for a write started by [`Metadata::store_json`].
pub async fn stored(rx: oneshot::Receiver<Result<(), MetadataError>>) -> Result<(), MetadataError> {
    rx.await.map_err(|_| MetadataError::Interrupted)?
}
