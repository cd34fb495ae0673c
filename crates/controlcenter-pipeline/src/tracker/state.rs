use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use controlcenter_postfix::{Address, Payload, Record, RelayedBounce, SmtpSentStatus, SmtpStatus};
use time::OffsetDateTime;
use tracing::{debug, trace};

use crate::delivery::{Delivery, Direction, LogRef, RelayedBounceUpdate};

/// Longest parent chain followed when looking for the original message.
const MAX_CHAIN_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct QueueKey {
    host: String,
    queue: String,
}

impl QueueKey {
    fn new(
        host: &str,
        queue: &str,
    ) -> Self {
        Self { host: host.to_string(), queue: queue.to_string() }
    }
}

/// What the tracker hands to its sink.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerOutput {
    Delivery(Box<Delivery>),
    /// A later final status for a recipient that already has one; it
    /// takes the place of the earlier result.
    Replacement(Box<Delivery>),
    RelayedBounce(RelayedBounceUpdate),
}

#[derive(Debug, Clone)]
struct Deferral {
    first: OffsetDateTime,
    last: OffsetDateTime,
    status: SmtpSentStatus,
    daemon: String,
    lines: Vec<LogRef>,
}

#[derive(Debug, Clone)]
enum RecipientState {
    /// Seen only as deferred so far.
    Pending(Deferral),
    /// Passed to another queue on this host, which carries on.
    HandedOff,
    Done,
}

#[derive(Debug, Clone)]
struct Recipient {
    address: Address,
    state: RecipientState,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    first_seen: OffsetDateTime,
    last_activity: OffsetDateTime,
    sender: Option<Address>,
    message_id: Option<String>,
    size: Option<u64>,
    nrcpt: Option<u32>,
    client_host: Option<String>,
    client_ip: Option<IpAddr>,
    origin_queue: Option<String>,
    lines: Vec<LogRef>,
    recipients: Vec<Recipient>,
    parent: Option<QueueKey>,
    children: usize,
    removed: bool,
}

impl QueueEntry {
    fn new(time: OffsetDateTime) -> Self {
        Self {
            first_seen: time,
            last_activity: time,
            sender: None,
            message_id: None,
            size: None,
            nrcpt: None,
            client_host: None,
            client_ip: None,
            origin_queue: None,
            lines: Vec::new(),
            recipients: Vec::new(),
            parent: None,
            children: 0,
            removed: false,
        }
    }

    fn recipient_mut(
        &mut self,
        address: &Address,
    ) -> Option<&mut Recipient> {
        self.recipients.iter_mut().find(|r| &r.address == address)
    }
}

/// Correlates records into deliveries.
///
/// Entries live in an arena keyed by host and queue id; a message handed to
/// a local content filter and re-queued points to its parent by key.
/// Deliveries of such a child carry the sender and queue time of the root.
pub struct TrackerState {
    entries: HashMap<QueueKey, QueueEntry>,
    queue_idle_timeout: Duration,
    prune_interval: Duration,
    last_prune: Option<OffsetDateTime>,
}

impl TrackerState {
    pub fn new(
        queue_idle_timeout: Duration,
        prune_interval: Duration,
    ) -> Self {
        Self { entries: HashMap::new(), queue_idle_timeout, prune_interval, last_prune: None }
    }

    pub fn open_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn handle(
        &mut self,
        record: &Record,
    ) -> Vec<TrackerOutput> {
        let mut out = Vec::new();
        let line = LogRef { time: record.time, sum: record.sum };
        let host = record.header.host.as_str();

        match &record.payload {
            Payload::MailAccepted(p) => {
                let entry = self.touch(host, &p.queue, record.time);
                entry.client_host = Some(p.host.clone());
                entry.client_ip = p.ip;
                entry.lines.push(line);
            }
            Payload::Pickup(p) => {
                let entry = self.touch(host, &p.queue, record.time);
                entry.sender.get_or_insert_with(|| p.sender.clone());
                entry.lines.push(line);
            }
            Payload::CleanupMessageAccepted(p) => {
                let entry = self.touch(host, &p.queue, record.time);
                if !p.message_id.is_empty() {
                    entry.message_id = Some(p.message_id.clone());
                }
                entry.lines.push(line);
            }
            Payload::MailQueued(p) => {
                let entry = self.touch(host, &p.queue, record.time);
                entry.sender = Some(p.sender.clone());
                entry.size = Some(p.size);
                entry.nrcpt = Some(p.nrcpt);
                entry.lines.push(line);
            }
            Payload::BounceCreated(p) => {
                self.touch(host, &p.queue, record.time).lines.push(line);
                let child = self.touch(host, &p.child, record.time);
                child.origin_queue = Some(p.queue.clone());
                child.lines.push(line);
            }
            Payload::SmtpSentStatus(p) => {
                self.sent_status(host, record.header.daemon_name(), p, record.time, line, &mut out);
            }
            Payload::MessageExpired(p) => self.expired(host, &p.queue, record.time, line, &mut out),
            Payload::QueueRemoved(p) => self.removed(host, &p.queue, record.time, &mut out),
            Payload::CleanupMilterReject(p) => {
                let key = QueueKey::new(host, &p.queue);
                if self.entries.remove(&key).is_some() {
                    debug!("message rejected by milter: host={host}, queue={}", p.queue);
                }
            }
            Payload::RelayedBounce(p) => out.push(TrackerOutput::RelayedBounce(relayed_bounce(p, line))),
            Payload::SmtpdConnect(_)
            | Payload::SmtpdDisconnect(_)
            | Payload::SmtpdLostConnection(_)
            | Payload::SmtpdReject(_)
            | Payload::Version(_)
            | Payload::Unsupported => {}
        }

        self.prune_if_due(record.time, &mut out);
        out
    }

    /// Closes every entry, e.g. on shutdown.
    pub fn close_all(&mut self) -> Vec<TrackerOutput> {
        let mut out = Vec::new();
        let keys: Vec<QueueKey> = self.entries.keys().cloned().collect();

        for key in keys {
            self.flush_pending(&key, &mut out);
        }

        self.entries.clear();
        out
    }

    fn touch(
        &mut self,
        host: &str,
        queue: &str,
        time: OffsetDateTime,
    ) -> &mut QueueEntry {
        let entry = self.entries.entry(QueueKey::new(host, queue)).or_insert_with(|| {
            trace!("queue entry opened: host={host}, queue={queue}");
            QueueEntry::new(time)
        });
        entry.last_activity = entry.last_activity.max(time);
        entry.first_seen = entry.first_seen.min(time);
        entry
    }

    fn sent_status(
        &mut self,
        host: &str,
        daemon: &str,
        status: &SmtpSentStatus,
        time: OffsetDateTime,
        line: LogRef,
        out: &mut Vec<TrackerOutput>,
    ) {
        let key = QueueKey::new(host, &status.queue);
        let entry = self.touch(host, &status.queue, time);

        if entry.recipient_mut(&status.recipient).is_none() {
            entry.recipients.push(Recipient {
                address: status.recipient.clone(),
                state: RecipientState::Pending(Deferral {
                    first: time,
                    last: time,
                    status: status.clone(),
                    daemon: daemon.to_string(),
                    lines: Vec::new(),
                }),
            });
        }

        let Some(recipient) = entry.recipient_mut(&status.recipient) else {
            return;
        };

        let is_handoff = status.sent_queued.as_ref().is_some_and(|sq| sq.ip.is_loopback());

        let deferral = match &mut recipient.state {
            RecipientState::Pending(deferral) if status.status == SmtpStatus::Deferred => {
                if deferral.lines.is_empty() {
                    deferral.first = time;
                }
                deferral.last = time;
                deferral.status = status.clone();
                deferral.daemon = daemon.to_string();
                deferral.lines.push(line);
                return;
            }
            RecipientState::Pending(deferral) => Some(deferral.clone()),
            RecipientState::Done if status.status != SmtpStatus::Deferred && !is_handoff => None,
            _ => {
                debug!(
                    "status after recipient was closed: host={host}, queue={}, recipient={}, status={}",
                    status.queue, status.recipient, status.status,
                );
                return;
            }
        };

        let Some(deferral) = deferral else {
            debug!(
                "later status replaces delivery: host={host}, queue={}, recipient={}, status={}",
                status.queue, status.recipient, status.status,
            );
            let delivery = self.build_delivery(&key, status, status.status, daemon, time, time, vec![line]);
            out.push(TrackerOutput::Replacement(Box::new(delivery)));
            return;
        };

        if let Some(handoff) = status.sent_queued.as_ref().filter(|_| is_handoff) {
            recipient.state = RecipientState::HandedOff;
            self.hand_off(&key, &handoff.queue, time, line, deferral.lines);
            return;
        }

        recipient.state = RecipientState::Done;

        if !deferral.lines.is_empty() {
            out.push(self.deferred_summary(&key, &deferral));
        }

        let delivery = self.build_delivery(&key, status, status.status, daemon, time, time, vec![line]);
        out.push(TrackerOutput::Delivery(Box::new(delivery)));
    }

    fn hand_off(
        &mut self,
        parent: &QueueKey,
        child_queue: &str,
        time: OffsetDateTime,
        line: LogRef,
        mut lines: Vec<LogRef>,
    ) {
        let child_key = QueueKey::new(&parent.host, child_queue);
        if &child_key == parent {
            return;
        }

        let child = self.touch(&parent.host, child_queue, time);
        let already_linked = child.parent.as_ref() == Some(parent);
        child.parent = Some(parent.clone());
        lines.push(line);
        child.lines.extend(lines);

        if !already_linked {
            if let Some(parent_entry) = self.entries.get_mut(parent) {
                parent_entry.children += 1;
            }
        }

        debug!(
            "message handed off: host={}, queue={}, child={child_queue}",
            parent.host, parent.queue,
        );
    }

    fn expired(
        &mut self,
        host: &str,
        queue: &str,
        time: OffsetDateTime,
        line: LogRef,
        out: &mut Vec<TrackerOutput>,
    ) {
        let key = QueueKey::new(host, queue);
        let pending = self.take_pending(&key);

        for deferral in pending {
            out.push(self.deferred_summary(&key, &deferral));
            let delivery = self.build_delivery(
                &key,
                &deferral.status,
                SmtpStatus::Expired,
                &deferral.daemon,
                time,
                time,
                vec![line],
            );
            out.push(TrackerOutput::Delivery(Box::new(delivery)));
        }

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.last_activity = entry.last_activity.max(time);
        }
    }

    fn removed(
        &mut self,
        host: &str,
        queue: &str,
        time: OffsetDateTime,
        out: &mut Vec<TrackerOutput>,
    ) {
        let key = QueueKey::new(host, queue);
        self.flush_pending(&key, out);

        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };

        entry.removed = true;
        entry.last_activity = entry.last_activity.max(time);
        self.release(&key);
    }

    /// Drops a removed entry once no child depends on it, then its
    /// ancestors in the same situation.
    fn release(
        &mut self,
        key: &QueueKey,
    ) {
        let mut current = key.clone();

        for _ in 0..MAX_CHAIN_DEPTH {
            let Some(entry) = self.entries.get(&current) else {
                return;
            };

            if !entry.removed || entry.children > 0 {
                return;
            }

            let parent = entry.parent.clone();
            self.entries.remove(&current);
            trace!("queue entry closed: host={}, queue={}", current.host, current.queue);

            let Some(parent) = parent else {
                return;
            };

            match self.entries.get_mut(&parent) {
                Some(parent_entry) => parent_entry.children = parent_entry.children.saturating_sub(1),
                None => return,
            }

            current = parent;
        }
    }

    fn take_pending(
        &mut self,
        key: &QueueKey,
    ) -> Vec<Deferral> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Vec::new();
        };

        let mut pending = Vec::new();
        for recipient in &mut entry.recipients {
            if let RecipientState::Pending(deferral) = &recipient.state {
                if !deferral.lines.is_empty() {
                    pending.push(deferral.clone());
                }
                recipient.state = RecipientState::Done;
            }
        }

        pending
    }

    /// Every recipient still waiting ends as a deferred delivery.
    fn flush_pending(
        &mut self,
        key: &QueueKey,
        out: &mut Vec<TrackerOutput>,
    ) {
        for deferral in self.take_pending(key) {
            out.push(self.deferred_summary(key, &deferral));
        }
    }

    fn prune_if_due(
        &mut self,
        now: OffsetDateTime,
        out: &mut Vec<TrackerOutput>,
    ) {
        let last_prune = *self.last_prune.get_or_insert(now);
        if now - last_prune < self.prune_interval {
            return;
        }

        self.last_prune = Some(now);

        let idle: Vec<QueueKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.last_activity > self.queue_idle_timeout)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &idle {
            self.flush_pending(key, out);
        }

        for key in &idle {
            let Some(entry) = self.entries.remove(key) else {
                continue;
            };

            if let Some(parent) = entry.parent.and_then(|parent| self.entries.get_mut(&parent)) {
                parent.children = parent.children.saturating_sub(1);
            }
        }

        if !idle.is_empty() {
            debug!("idle queue entries pruned: count={}, open={}", idle.len(), self.entries.len());
        }
    }

    fn deferred_summary(
        &self,
        key: &QueueKey,
        deferral: &Deferral,
    ) -> TrackerOutput {
        let delivery = self.build_delivery(
            key,
            &deferral.status,
            SmtpStatus::Deferred,
            &deferral.daemon,
            deferral.first,
            deferral.last,
            deferral.lines.clone(),
        );

        TrackerOutput::Delivery(Box::new(delivery))
    }

    /// Keys from `key` up to the root, root first.
    fn chain(
        &self,
        key: &QueueKey,
    ) -> Vec<&QueueKey> {
        let mut chain = Vec::new();
        let mut current = self.entries.get_key_value(key);

        while let Some((current_key, entry)) = current {
            if chain.len() == MAX_CHAIN_DEPTH || chain.contains(&current_key) {
                break;
            }

            chain.push(current_key);
            current = entry.parent.as_ref().and_then(|parent| self.entries.get_key_value(parent));
        }

        chain.reverse();
        chain
    }

    #[allow(clippy::too_many_arguments)]
    fn build_delivery(
        &self,
        key: &QueueKey,
        status: &SmtpSentStatus,
        final_status: SmtpStatus,
        daemon: &str,
        first_attempt_time: OffsetDateTime,
        delivery_time: OffsetDateTime,
        extra_lines: Vec<LogRef>,
    ) -> Delivery {
        let chain = self.chain(key);
        let entries: Vec<&QueueEntry> = chain.iter().filter_map(|k| self.entries.get(*k)).collect();
        let root = entries.first().copied();
        let own = entries.last().copied();

        let mut log_lines: Vec<LogRef> = entries.iter().flat_map(|e| e.lines.iter().copied()).collect();
        log_lines.extend(extra_lines);
        log_lines.sort_by_key(|line| line.time);

        let queued_time = root.map_or(first_attempt_time, |e| e.first_seen).min(first_attempt_time);

        let sender = root
            .and_then(|e| e.sender.clone())
            .or_else(|| own.and_then(|e| e.sender.clone()))
            .unwrap_or_default();

        let origin_queue = match chain.first() {
            Some(root_key) if *root_key != key => Some(root_key.queue.clone()),
            _ => own.and_then(|e| e.origin_queue.clone()),
        };

        Delivery {
            host: key.host.clone(),
            queue: key.queue.clone(),
            origin_queue,
            message_id: root.and_then(|e| e.message_id.clone()).or_else(|| own.and_then(|e| e.message_id.clone())),
            status: final_status,
            direction: Direction::from_daemon(daemon),
            queued_time,
            first_attempt_time,
            delivery_time,
            sender,
            recipient: status.recipient.clone(),
            orig_recipient: status.orig_recipient.clone(),
            relay: status.relay.clone(),
            dsn: status.dsn.clone(),
            delay: status.delay,
            extra_message: status.extra_message.clone(),
            client_host: root.and_then(|e| e.client_host.clone()),
            client_ip: root.and_then(|e| e.client_ip),
            size: root.and_then(|e| e.size),
            nrcpt: root.and_then(|e| e.nrcpt),
            log_lines,
        }
    }
}

fn relayed_bounce(
    bounce: &RelayedBounce,
    line: LogRef,
) -> RelayedBounceUpdate {
    RelayedBounceUpdate {
        time: line.time,
        sender: bounce.sender.clone(),
        recipient: bounce.recipient.clone(),
        dsn: bounce.dsn.clone(),
        reporting_mta: bounce.reporting_mta.clone(),
        message: bounce.message.clone(),
        line,
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::transform::{DefaultTransformer, Transformer};

    const DAY: Duration = Duration::from_secs(24 * 3600);
    const HOUR: Duration = Duration::from_secs(3600);

    fn feed(
        state: &mut TrackerState,
        lines: &[&str],
    ) -> Vec<TrackerOutput> {
        let mut transformer = DefaultTransformer::new(2020, 2020);
        let mut out = Vec::new();

        for line in lines {
            let record = transformer.transform(line).expect("valid line");
            out.extend(state.handle(&record));
        }

        out
    }

    fn deliveries(out: Vec<TrackerOutput>) -> Vec<Delivery> {
        out.into_iter()
            .filter_map(|o| match o {
                TrackerOutput::Delivery(d) => Some(*d),
                TrackerOutput::Replacement(_) | TrackerOutput::RelayedBounce(_) => None,
            })
            .collect()
    }

    #[test]
    fn sent_message_is_one_delivery() {
        let mut state = TrackerState::new(DAY, HOUR);
        let out = feed(
            &mut state,
            &[
                "Jan 10 16:15:30 mail postfix/smtpd[1]: 4AA091855DA0: client=unknown[192.168.0.1]",
                "Jan 10 16:15:30 mail postfix/cleanup[2]: 4AA091855DA0: message-id=<abc@sender.com>",
                "Jan 10 16:15:30 mail postfix/qmgr[3]: 4AA091855DA0: from=<sender@sender.com>, size=1234, nrcpt=1 (queue active)",
                "Jan 10 16:15:31 mail postfix/smtp[4]: 4AA091855DA0: to=<recipient@example.com>, relay=mx.example.com[1.2.3.4]:25, \
                 delay=0.5, delays=0.1/0.1/0.2/0.1, dsn=2.0.0, status=sent (250 2.0.0 Ok)",
                "Jan 10 16:15:31 mail postfix/qmgr[3]: 4AA091855DA0: removed",
            ],
        );

        let deliveries = deliveries(out);
        assert_eq!(deliveries.len(), 1);

        let d = &deliveries[0];
        assert_eq!(d.status, SmtpStatus::Sent);
        assert_eq!(d.direction, Direction::Outbound);
        assert_eq!(d.sender, Address::new("sender", "sender.com"));
        assert_eq!(d.recipient, Address::new("recipient", "example.com"));
        assert_eq!(d.relay.name, "mx.example.com");
        assert_eq!(d.dsn, "2.0.0");
        assert_eq!(d.size, Some(1234));
        assert_eq!(d.client_host.as_deref(), Some("unknown"));
        assert!(d.message_id.is_some());
        assert_eq!(d.queued_time, datetime!(2020-01-10 16:15:30 UTC));
        assert_eq!(d.delivery_time, datetime!(2020-01-10 16:15:31 UTC));
        assert_eq!(d.log_lines.len(), 4);
        assert_eq!(state.open_entries(), 0);
    }

    #[test]
    fn deferred_then_expired() {
        let mut state = TrackerState::new(DAY, HOUR);
        let out = feed(
            &mut state,
            &[
                "Sep 25 18:26:36 mail postfix/qmgr[1]: 3A1973E542: from=<sender@example.com>, size=4000, nrcpt=1 (queue active)",
                "Sep 25 18:26:36 mail postfix/smtp[2]: 3A1973E542: to=<nobody@example.net>, relay=none, delay=0.1, \
                 delays=0.1/0/0/0, dsn=4.1.1, status=deferred (connect to example.net: Connection refused)",
                "Sep 27 10:00:00 mail postfix/smtp[2]: 3A1973E542: to=<nobody@example.net>, relay=none, delay=1, \
                 delays=0.1/0/0/0, dsn=4.1.1, status=deferred (connect to example.net: Connection refused)",
                "Sep 30 16:46:07 mail postfix/smtp[2]: 3A1973E542: to=<nobody@example.net>, relay=none, delay=2, \
                 delays=0.1/0/0/0, dsn=4.1.1, status=deferred (connect to example.net: Connection refused)",
                "Sep 30 20:46:08 mail postfix/qmgr[1]: 3A1973E542: from=<sender@example.com>, status=expired, returned to sender",
                "Sep 30 20:46:08 mail postfix/qmgr[1]: 3A1973E542: removed",
            ],
        );

        let deliveries = deliveries(out);
        assert_eq!(deliveries.len(), 2);

        let deferred = &deliveries[0];
        assert_eq!(deferred.status, SmtpStatus::Deferred);
        assert_eq!(deferred.dsn, "4.1.1");
        assert_eq!(deferred.first_attempt_time, datetime!(2020-09-25 18:26:36 UTC));
        assert_eq!(deferred.delivery_time, datetime!(2020-09-30 16:46:07 UTC));
        assert_eq!(deferred.log_lines.len(), 4);

        let expired = &deliveries[1];
        assert_eq!(expired.status, SmtpStatus::Expired);
        assert_eq!(expired.dsn, "4.1.1");
        assert_eq!(expired.delivery_time, datetime!(2020-09-30 20:46:08 UTC));
        assert_eq!(expired.recipient, Address::new("nobody", "example.net"));
        assert_eq!(state.open_entries(), 0);
    }

    #[test]
    fn deferred_then_sent_emits_summary_and_delivery() {
        let mut state = TrackerState::new(DAY, HOUR);
        let out = feed(
            &mut state,
            &[
                "Jan 10 10:00:00 mail postfix/smtp[2]: 3A1973E542: to=<a@example.net>, relay=none, delay=0.1, \
                 delays=0.1/0/0/0, dsn=4.4.1, status=deferred (timeout)",
                "Jan 10 10:30:00 mail postfix/smtp[2]: 3A1973E542: to=<a@example.net>, relay=mx.example.net[5.6.7.8]:25, \
                 delay=1800, delays=0.1/1800/0.1/0.1, dsn=2.0.0, status=sent (250 ok)",
            ],
        );

        let deliveries = deliveries(out);
        assert_eq!(
            deliveries.iter().map(|d| d.status).collect::<Vec<_>>(),
            vec![SmtpStatus::Deferred, SmtpStatus::Sent],
        );
    }

    #[test]
    fn later_final_status_replaces_the_earlier_one() {
        let mut state = TrackerState::new(DAY, HOUR);
        let out = feed(
            &mut state,
            &[
                "Jan 10 10:00:00 mail postfix/smtp[2]: 3A1973E542: to=<a@example.net>, relay=mx.example.net[5.6.7.8]:25, \
                 delay=0.1, delays=0.1/0/0/0, dsn=5.1.1, status=bounced (user unknown)",
                "Jan 10 10:00:05 mail postfix/smtp[2]: 3A1973E542: to=<a@example.net>, relay=mx.example.net[5.6.7.8]:25, \
                 delay=5, delays=0.1/0/0/5, dsn=2.0.0, status=sent (250 ok)",
                "Jan 10 10:00:05 mail postfix/qmgr[1]: 3A1973E542: removed",
            ],
        );

        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], TrackerOutput::Delivery(d) if d.status == SmtpStatus::Bounced));

        let TrackerOutput::Replacement(replacement) = &out[1] else {
            panic!("expected a replacement, got {:?}", out[1]);
        };
        assert_eq!(replacement.status, SmtpStatus::Sent);
        assert_eq!(replacement.dsn, "2.0.0");
        assert_eq!(replacement.recipient, Address::new("a", "example.net"));
        assert_eq!(replacement.delivery_time, datetime!(2020-01-10 10:00:05 UTC));
        assert_eq!(state.open_entries(), 0);
    }

    #[test]
    fn deferral_after_final_status_is_ignored() {
        let mut state = TrackerState::new(DAY, HOUR);
        let out = feed(
            &mut state,
            &[
                "Jan 10 10:00:00 mail postfix/smtp[2]: 3A1973E542: to=<a@example.net>, relay=mx.example.net[5.6.7.8]:25, \
                 delay=0.1, delays=0.1/0/0/0, dsn=2.0.0, status=sent (250 ok)",
                "Jan 10 10:00:05 mail postfix/smtp[2]: 3A1973E542: to=<a@example.net>, relay=none, delay=5, \
                 delays=0.1/0/0/5, dsn=4.4.1, status=deferred (timeout)",
                "Jan 10 10:00:05 mail postfix/qmgr[1]: 3A1973E542: removed",
            ],
        );

        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], TrackerOutput::Delivery(d) if d.status == SmtpStatus::Sent));
    }

    #[test]
    fn removed_queue_closes_pending_recipients_as_deferred() {
        let mut state = TrackerState::new(DAY, HOUR);
        let out = feed(
            &mut state,
            &[
                "Jan 10 10:00:00 mail postfix/smtp[2]: 3A1973E542: to=<a@example.net>, relay=none, delay=0.1, \
                 delays=0.1/0/0/0, dsn=4.4.1, status=deferred (timeout)",
                "Jan 10 10:05:00 mail postfix/qmgr[1]: 3A1973E542: removed",
            ],
        );

        let deliveries = deliveries(out);
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].status, SmtpStatus::Deferred);
        assert_eq!(state.open_entries(), 0);
    }

    #[test]
    fn content_filter_handoff_reports_only_the_final_hop() {
        let mut state = TrackerState::new(DAY, HOUR);
        let out = feed(
            &mut state,
            &[
                "Jan 10 16:15:30 mail postfix/qmgr[1]: AB5501855DA0: from=<sender@sender.com>, size=100, nrcpt=1 (queue active)",
                "Jan 10 16:15:31 mail postfix/smtpd[2]: 2F01D1855DB2: client=localhost[127.0.0.1]",
                "Jan 10 16:15:31 mail postfix/qmgr[1]: 2F01D1855DB2: from=<sender@sender.com>, size=200, nrcpt=1 (queue active)",
                "Jan 10 16:15:31 mail postfix/smtp[3]: AB5501855DA0: to=<to@mail.com>, orig_to=<root>, \
                 relay=127.0.0.1[127.0.0.1]:10024, delay=0.87, delays=0.68/0.01/0/0.18, dsn=2.0.0, status=sent \
                 (250 2.0.0 from MTA(smtp:[127.0.0.1]:10025): 250 2.0.0 Ok: queued as 2F01D1855DB2)",
                "Jan 10 16:15:31 mail postfix/qmgr[1]: AB5501855DA0: removed",
            ],
        );

        assert!(deliveries(out).is_empty());
        assert_eq!(state.open_entries(), 2);

        let out = feed(
            &mut state,
            &[
                "Jan 10 16:15:32 mail postfix/smtp[4]: 2F01D1855DB2: to=<to@mail.com>, relay=mx.mail.com[5.6.7.8]:25, \
                 delay=1, delays=0.1/0.1/0.4/0.4, dsn=2.0.0, status=sent (250 OK)",
                "Jan 10 16:15:32 mail postfix/qmgr[1]: 2F01D1855DB2: removed",
            ],
        );

        let deliveries = deliveries(out);
        assert_eq!(deliveries.len(), 1);

        let d = &deliveries[0];
        assert_eq!(d.queue, "2F01D1855DB2");
        assert_eq!(d.origin_queue.as_deref(), Some("AB5501855DA0"));
        assert_eq!(d.sender, Address::new("sender", "sender.com"));
        assert_eq!(d.queued_time, datetime!(2020-01-10 16:15:30 UTC));
        assert_eq!(d.relay.name, "mx.mail.com");
        assert_eq!(d.log_lines.len(), 5);
        assert!(d.log_lines.windows(2).all(|w| w[0].time <= w[1].time));
        assert_eq!(state.open_entries(), 0);
    }

    #[test]
    fn same_queue_on_other_host_is_another_message() {
        let mut state = TrackerState::new(DAY, HOUR);
        feed(
            &mut state,
            &[
                "Jan 10 10:00:00 mx1 postfix/qmgr[1]: 3A1973E542: from=<a@example.com>, size=1, nrcpt=1 (queue active)",
                "Jan 10 10:00:00 mx2 postfix/qmgr[1]: 3A1973E542: from=<b@example.com>, size=1, nrcpt=1 (queue active)",
                "Jan 10 10:00:01 mx2 postfix/qmgr[1]: 3A1973E542: removed",
            ],
        );

        assert_eq!(state.open_entries(), 1);
    }

    #[test]
    fn relayed_bounce_is_forwarded() {
        let mut state = TrackerState::new(DAY, HOUR);
        let out = feed(
            &mut state,
            &[
                "Jan 10 16:15:40 mail lightmeter/relayed-bounce[1]: AC80013D2BC: code=\"5.3.0\", \
                 recipient=<recipient@example.com>, message=\"Mailbox full\"",
            ],
        );

        match out.as_slice() {
            [TrackerOutput::RelayedBounce(update)] => {
                assert_eq!(update.dsn, "5.3.0");
                assert_eq!(update.recipient, Address::new("recipient", "example.com"));
                assert_eq!(update.time, datetime!(2020-01-10 16:15:40 UTC));
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn milter_reject_drops_the_entry() {
        let mut state = TrackerState::new(DAY, HOUR);
        feed(
            &mut state,
            &[
                "Jan 10 10:00:00 mail postfix/smtpd[1]: 4AA091855DA0: client=unknown[192.168.0.1]",
                "Jan 10 10:00:01 mail postfix/cleanup[2]: 4AA091855DA0: milter-reject: END-OF-MESSAGE from unknown[192.168.0.1]: 5.7.1 Spam",
            ],
        );

        assert_eq!(state.open_entries(), 0);
    }

    #[test]
    fn idle_entries_are_closed_as_deferred() {
        let mut state = TrackerState::new(HOUR, Duration::from_secs(60));
        let out = feed(
            &mut state,
            &[
                "Jan 10 10:00:00 mail postfix/smtp[2]: 3A1973E542: to=<a@example.net>, relay=none, delay=0.1, \
                 delays=0.1/0/0/0, dsn=4.4.1, status=deferred (timeout)",
                "Jan 10 12:00:00 mail postfix/smtpd[9]: connect from unknown[1.2.3.4]",
            ],
        );

        let deliveries = deliveries(out);
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].status, SmtpStatus::Deferred);
        assert_eq!(state.open_entries(), 0);
    }

    #[test]
    fn close_all_flushes_pending_recipients() {
        let mut state = TrackerState::new(DAY, HOUR);
        feed(
            &mut state,
            &[
                "Jan 10 10:00:00 mail postfix/smtp[2]: 3A1973E542: to=<a@example.net>, relay=none, delay=0.1, \
                 delays=0.1/0/0/0, dsn=4.4.1, status=deferred (timeout)",
                "Jan 10 10:00:00 mail postfix/qmgr[1]: 4AA091855DA0: from=<a@example.com>, size=1, nrcpt=1 (queue active)",
            ],
        );

        let deliveries = deliveries(state.close_all());
        assert_eq!(deliveries.len(), 1);
        assert_eq!(state.open_entries(), 0);
    }
}
