use anyhow::{Context, Result, bail};
use controlcenter_postfix::SmtpStatus;
use futures_util::future::BoxFuture;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;

use crate::announcer::TimeProbe;
use crate::delivery::{Direction, LogRef};
use crate::interval::TimeInterval;

/// A delivery as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDelivery {
    pub id: i64,
    pub status: SmtpStatus,
    pub direction: Direction,
    pub queued_time: OffsetDateTime,
    pub first_attempt_time: OffsetDateTime,
    pub delivery_time: OffsetDateTime,
    pub host: String,
    pub queue: String,
    pub origin_queue: Option<String>,
    pub message_id: Option<String>,
    pub sender: String,
    pub recipient: String,
    pub relay_name: Option<String>,
    pub dsn: String,
    pub extra_message: Option<String>,
    pub log_lines: Vec<LogRef>,
}

#[derive(Debug, Clone)]
pub struct DeliveryAccessor {
    pool: SqlitePool,
}

fn unix_time(
    row: &SqliteRow,
    column: &str,
) -> Result<OffsetDateTime> {
    let value: i64 = row.try_get(column).with_context(|| format!("failed to read column: column={column}"))?;
    OffsetDateTime::from_unix_timestamp(value).with_context(|| format!("invalid time: column={column}, value={value}"))
}

impl DeliveryAccessor {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Deliveries whose delivery time falls in `interval`. An empty sender
    /// or recipient matches any.
    pub async fn deliveries_for(
        &self,
        sender: &str,
        recipient: &str,
        interval: TimeInterval,
    ) -> Result<Vec<StoredDelivery>> {
        let rows = sqlx::query(
            "select id, status, direction, queued_ts, first_attempt_ts, delivery_ts, host, queue, origin_queue, \
             message_id, sender, recipient, relay_name, dsn, extra_message from deliveries \
             where (? = '' or sender = ?) and (? = '' or recipient = ?) and delivery_ts between ? and ? \
             order by delivery_ts, id",
        )
        .bind(sender)
        .bind(sender)
        .bind(recipient)
        .bind(recipient)
        .bind(interval.from_unix())
        .bind(interval.to_unix())
        .fetch_all(&self.pool)
        .await
        .context("failed to query deliveries")?;

        let mut deliveries = Vec::with_capacity(rows.len());

        for row in rows {
            let id: i64 = row.try_get("id").context("failed to read delivery id")?;
            let status_code: i64 = row.try_get("status").context("failed to read delivery status")?;
            let Some(status) = SmtpStatus::from_code(status_code) else {
                bail!("invalid delivery status: id={id}, status={status_code}");
            };

            deliveries.push(StoredDelivery {
                id,
                status,
                direction: Direction::from_code(row.try_get("direction").context("failed to read direction")?),
                queued_time: unix_time(&row, "queued_ts")?,
                first_attempt_time: unix_time(&row, "first_attempt_ts")?,
                delivery_time: unix_time(&row, "delivery_ts")?,
                host: row.try_get("host").context("failed to read host")?,
                queue: row.try_get("queue").context("failed to read queue")?,
                origin_queue: row.try_get("origin_queue").context("failed to read origin queue")?,
                message_id: row.try_get("message_id").context("failed to read message id")?,
                sender: row.try_get("sender").context("failed to read sender")?,
                recipient: row.try_get("recipient").context("failed to read recipient")?,
                relay_name: row.try_get("relay_name").context("failed to read relay")?,
                dsn: row.try_get("dsn").context("failed to read dsn")?,
                extra_message: row.try_get("extra_message").context("failed to read extra message")?,
                log_lines: self.log_lines(id).await?,
            });
        }

        Ok(deliveries)
    }

    async fn log_lines(
        &self,
        delivery_id: i64,
    ) -> Result<Vec<LogRef>> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "select line_time, checksum from delivery_log_lines where delivery_id = ? order by position",
        )
        .bind(delivery_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to query delivery log lines")?;

        rows.into_iter()
            .map(|(time, sum)| {
                let time = OffsetDateTime::from_unix_timestamp(time)
                    .with_context(|| format!("invalid log line time: delivery_id={delivery_id}, time={time}"))?;
                Ok(LogRef { time, sum })
            })
            .collect()
    }

    pub async fn has_logs(&self) -> Result<bool> {
        sqlx::query_scalar::<_, bool>("select exists(select 1 from deliveries)")
            .fetch_one(&self.pool)
            .await
            .context("failed to check for deliveries")
    }

    /// Time of the most recent stored delivery.
    pub async fn most_recent_log_time(&self) -> Result<Option<OffsetDateTime>> {
        let value = sqlx::query_scalar::<_, Option<i64>>("select max(delivery_ts) from deliveries")
            .fetch_one(&self.pool)
            .await
            .context("failed to query most recent delivery time")?;

        value
            .map(|ts| OffsetDateTime::from_unix_timestamp(ts).with_context(|| format!("invalid delivery time: time={ts}")))
            .transpose()
    }
}

impl TimeProbe for DeliveryAccessor {
    fn most_recent_log_time(&self) -> BoxFuture<'_, Result<Option<OffsetDateTime>>> {
        Box::pin(DeliveryAccessor::most_recent_log_time(self))
    }
}
