//! Delivery store: the final sink of the tracker.

mod accessor;

use std::time::Duration;

use anyhow::{Context, Result};
use controlcenter_postfix::SmtpStatus;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

pub use accessor::{DeliveryAccessor, StoredDelivery};

use crate::dbrunner::{Action, ActionSender, DbRunnerSettings, action, spawn_db_runner};
use crate::delivery::{Delivery, LogRef, RelayedBounceUpdate};
use crate::runner::Running;

/// How far back a relayed bounce looks for the delivery it belongs to.
const RELAYED_BOUNCE_WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy)]
pub struct DeliveryDbSettings {
    pub runner: DbRunnerSettings,
    /// Extra attempts for a relayed bounce whose delivery is not stored
    /// yet.
    pub relayed_bounce_retries: u32,
    pub relayed_bounce_retry_delay: Duration,
}

impl Default for DeliveryDbSettings {
    fn default() -> Self {
        Self {
            runner: DbRunnerSettings::default(),
            relayed_bounce_retries: 5,
            relayed_bounce_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Write side of the delivery store.
#[derive(Clone)]
pub struct DeliveryDb {
    actions: ActionSender,
    settings: DeliveryDbSettings,
}

pub fn spawn_deliverydb(
    pool: SqlitePool,
    settings: DeliveryDbSettings,
) -> (DeliveryDb, Running) {
    let (actions, running) = spawn_db_runner("deliverydb", pool, settings.runner, None);
    (DeliveryDb { actions, settings }, running)
}

impl DeliveryDb {
    pub async fn store(
        &self,
        delivery: Delivery,
    ) -> Result<()> {
        self.actions
            .send(action(move |conn| Box::pin(insert_delivery(conn, delivery))))
            .await
    }

    /// Drops the earlier final result for the same message and recipient,
    /// keeping its deferral summaries, then stores `delivery`.
    pub async fn replace(
        &self,
        delivery: Delivery,
    ) -> Result<()> {
        self.actions
            .send(action(move |conn| Box::pin(replace_delivery(conn, delivery))))
            .await
    }

    /// Marks the matching `sent` deliveries as bounced. Retried a few times
    /// when nothing matches, as the delivery may still be on its way.
    pub async fn relayed_bounce(
        &self,
        bounce: RelayedBounceUpdate,
    ) -> Result<()> {
        let retry = Retry {
            actions: self.actions.clone(),
            attempts_left: self.settings.relayed_bounce_retries,
            delay: self.settings.relayed_bounce_retry_delay,
        };

        self.actions.send(relayed_bounce_action(bounce, retry)).await
    }
}

#[derive(Clone)]
struct Retry {
    actions: ActionSender,
    attempts_left: u32,
    delay: Duration,
}

fn relayed_bounce_action(
    bounce: RelayedBounceUpdate,
    retry: Retry,
) -> Action {
    action(move |conn| Box::pin(apply_relayed_bounce(conn, bounce, retry)))
}

async fn apply_relayed_bounce(
    conn: &mut SqliteConnection,
    bounce: RelayedBounceUpdate,
    retry: Retry,
) -> Result<()> {
    let to = bounce.time.unix_timestamp();
    let from = to - RELAYED_BOUNCE_WINDOW_SECS;
    let sender = bounce.sender.to_string();
    let recipient = bounce.recipient.to_string();

    let ids = sqlx::query_scalar::<_, i64>(
        "select id from deliveries where status = 0 and recipient = ? and delivery_ts between ? and ? \
         and (? = '' or sender = '' or sender = ?) order by delivery_ts, id",
    )
    .bind(&recipient)
    .bind(from)
    .bind(to)
    .bind(&sender)
    .bind(&sender)
    .fetch_all(&mut *conn)
    .await
    .context("failed to find delivery for relayed bounce")?;

    if ids.is_empty() {
        if retry.attempts_left == 0 {
            warn!("relayed bounce matches no delivery: recipient={recipient}, sender={sender}, dsn={}", bounce.dsn);
            return Ok(());
        }

        debug!("relayed bounce not matched yet: recipient={recipient}, attempts_left={}", retry.attempts_left);
        tokio::spawn(async move {
            tokio::time::sleep(retry.delay).await;
            let next = Retry { attempts_left: retry.attempts_left - 1, ..retry.clone() };
            if let Err(err) = retry.actions.send(relayed_bounce_action(bounce, next)).await {
                debug!("relayed bounce retry dropped: error={err:#}");
            }
        });
        return Ok(());
    }

    if ids.len() > 1 {
        warn!("relayed bounce matches several deliveries: recipient={recipient}, count={}", ids.len());
    }

    for id in ids {
        sqlx::query("update deliveries set status = 1, dsn = ?, extra_message = ? where id = ?")
            .bind(&bounce.dsn)
            .bind(&bounce.message)
            .bind(id)
            .execute(&mut *conn)
            .await
            .context("failed to mark delivery as bounced")?;

        append_log_line(conn, id, bounce.line).await?;
        debug!("relayed bounce applied: delivery_id={id}, dsn={}, mta={}", bounce.dsn, bounce.reporting_mta);
    }

    Ok(())
}

async fn append_log_line(
    conn: &mut SqliteConnection,
    delivery_id: i64,
    line: LogRef,
) -> Result<()> {
    sqlx::query(
        "insert into delivery_log_lines(delivery_id, position, line_time, checksum) \
         values(?, (select coalesce(max(position), -1) + 1 from delivery_log_lines where delivery_id = ?), ?, ?)",
    )
    .bind(delivery_id)
    .bind(delivery_id)
    .bind(line.time.unix_timestamp())
    .bind(line.sum)
    .execute(&mut *conn)
    .await
    .context("failed to append delivery log line")?;
    Ok(())
}

async fn replace_delivery(
    conn: &mut SqliteConnection,
    delivery: Delivery,
) -> Result<()> {
    let ids = sqlx::query_scalar::<_, i64>(
        "select id from deliveries where host = ? and queue = ? and recipient = ? and status != ?",
    )
    .bind(&delivery.host)
    .bind(&delivery.queue)
    .bind(delivery.recipient.to_string())
    .bind(SmtpStatus::Deferred.code())
    .fetch_all(&mut *conn)
    .await
    .context("failed to find replaced delivery")?;

    for &id in &ids {
        sqlx::query("delete from delivery_log_lines where delivery_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .context("failed to delete replaced delivery log lines")?;

        sqlx::query("delete from deliveries where id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .context("failed to delete replaced delivery")?;
    }

    debug!("delivery replaced: queue={}, recipient={}, replaced={}", delivery.queue, delivery.recipient, ids.len());
    insert_delivery(conn, delivery).await
}

async fn insert_delivery(
    conn: &mut SqliteConnection,
    delivery: Delivery,
) -> Result<()> {
    let result = sqlx::query(
        "insert into deliveries(status, direction, queued_ts, first_attempt_ts, delivery_ts, host, queue, \
         origin_queue, message_id, sender, recipient, orig_recipient, relay_name, relay_ip, relay_port, dsn, \
         delay, extra_message, client_host, client_ip, size, nrcpt) \
         values(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(delivery.status.code())
    .bind(delivery.direction.code())
    .bind(delivery.queued_time.unix_timestamp())
    .bind(delivery.first_attempt_time.unix_timestamp())
    .bind(delivery.delivery_time.unix_timestamp())
    .bind(&delivery.host)
    .bind(&delivery.queue)
    .bind(delivery.origin_queue.as_deref())
    .bind(delivery.message_id.as_deref())
    .bind(delivery.sender.to_string())
    .bind(delivery.recipient.to_string())
    .bind(delivery.orig_recipient.as_ref().map(ToString::to_string))
    .bind(non_empty(&delivery.relay.name))
    .bind(delivery.relay.ip.map(|ip| ip.to_string()))
    .bind((delivery.relay.port != 0).then_some(i64::from(delivery.relay.port)))
    .bind(&delivery.dsn)
    .bind(f64::from(delivery.delay))
    .bind(non_empty(&delivery.extra_message))
    .bind(delivery.client_host.as_deref())
    .bind(delivery.client_ip.map(|ip| ip.to_string()))
    .bind(delivery.size.and_then(|size| i64::try_from(size).ok()))
    .bind(delivery.nrcpt.map(i64::from))
    .execute(&mut *conn)
    .await
    .context("failed to insert delivery")?;

    let id = result.last_insert_rowid();

    for (position, line) in delivery.log_lines.iter().enumerate() {
        sqlx::query(
            "insert into delivery_log_lines(delivery_id, position, line_time, checksum) values(?, ?, ?, ?)",
        )
        .bind(id)
        .bind(position as i64)
        .bind(line.time.unix_timestamp())
        .bind(line.sum)
        .execute(&mut *conn)
        .await
        .context("failed to insert delivery log line")?;
    }

    debug!(
        "delivery stored: id={id}, queue={}, status={}, recipient={}, lines={}",
        delivery.queue,
        delivery.status,
        delivery.recipient,
        delivery.log_lines.len(),
    );
    Ok(())
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() { None } else { Some(value) }
}
