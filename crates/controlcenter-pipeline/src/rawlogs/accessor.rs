use anyhow::{Context, Result};
use controlcenter_postfix::Sum;
use futures_util::TryStreamExt;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::interval::TimeInterval;

#[derive(Debug, Error)]
pub enum RawLogsError {
    #[error("log line not found")]
    LogLineNotFound,
    #[error("raw logs query failed: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentRow {
    /// Unix seconds.
    pub time: i64,
    pub content: String,
}

/// One page of lines. `cursor` is the id of the last row, or 0 for an
/// empty page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Content {
    pub cursor: i64,
    pub content: Vec<ContentRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SumPair {
    pub time: OffsetDateTime,
    pub sum: Sum,
}

/// Read side of the archive, on the read-only pool.
#[derive(Debug, Clone)]
pub struct RawLogsAccessor {
    pool: SqlitePool,
}

impl RawLogsAccessor {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Lines in `interval` ordered by time and id, starting after the row
    /// id `cursor`.
    pub async fn fetch_logs_in_interval(
        &self,
        interval: TimeInterval,
        page_size: i64,
        cursor: i64,
    ) -> Result<Content> {
        let rows = sqlx::query(
            "select id, time, content from logs where time between ? and ? and id > ? order by time, id asc limit ?",
        )
        .bind(interval.from_unix())
        .bind(interval.to_unix())
        .bind(cursor)
        .bind(page_size)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch raw log lines")?;

        let mut page = Content { cursor: 0, content: Vec::with_capacity(rows.len()) };

        for row in rows {
            page.cursor = row.try_get("id").context("failed to read raw log id")?;
            page.content.push(ContentRow {
                time: row.try_get("time").context("failed to read raw log time")?,
                content: row.try_get("content").context("failed to read raw log content")?,
            });
        }

        Ok(page)
    }

    pub async fn count_log_lines_in_interval(
        &self,
        interval: TimeInterval,
    ) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("select count(*) from logs where time between ? and ?")
            .bind(interval.from_unix())
            .bind(interval.to_unix())
            .fetch_one(&self.pool)
            .await
            .context("failed to count raw log lines")
    }

    /// Streams the lines of `interval`, each followed by a newline.
    pub async fn fetch_logs_in_interval_to_writer<W>(
        &self,
        interval: TimeInterval,
        writer: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut lines = sqlx::query_scalar::<_, String>(
            "select content from logs where time between ? and ? order by time, id asc",
        )
        .bind(interval.from_unix())
        .bind(interval.to_unix())
        .fetch(&self.pool);

        while let Some(line) = lines.try_next().await.context("failed to stream raw log lines")? {
            writer.write_all(line.as_bytes()).await.context("failed to write raw log line")?;
            writer.write_all(b"\n").await.context("failed to write raw log line")?;
        }

        writer.flush().await.context("failed to flush raw log lines")?;
        Ok(())
    }

    pub async fn fetch_log_line(
        &self,
        time: OffsetDateTime,
        sum: Sum,
    ) -> Result<String, RawLogsError> {
        sqlx::query_scalar::<_, String>("select content from logs where time = ? and checksum = ? limit 1")
            .bind(time.unix_timestamp())
            .bind(sum)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RawLogsError::LogLineNotFound)
    }

    /// Time and checksum of the last inserted line.
    pub async fn most_recent_log_time_and_sum(&self) -> Result<Option<SumPair>> {
        let row = sqlx::query_as::<_, (i64, i64)>("select time, checksum from logs order by id desc limit 1")
            .fetch_optional(&self.pool)
            .await
            .context("failed to query most recent raw log line")?;

        let Some((time, sum)) = row else {
            return Ok(None);
        };

        let time = OffsetDateTime::from_unix_timestamp(time)
            .with_context(|| format!("invalid raw log time: time={time}"))?;

        Ok(Some(SumPair { time, sum }))
    }
}
