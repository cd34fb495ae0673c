use std::sync::{Arc, Mutex};

use controlcenter_postfix::Record;
use futures_util::future::BoxFuture;

/// Consumer of ingested records. Publishing never fails; a slow consumer
/// holds up the reader instead.
pub trait Publisher: Send + Sync {
    fn publish(
        &self,
        record: Record,
    ) -> BoxFuture<'_, ()>;
}

/// Fans a record out to a fixed list of consumers, in order.
#[derive(Clone, Default)]
pub struct MultiPublisher {
    publishers: Vec<Arc<dyn Publisher>>,
}

impl MultiPublisher {
    pub fn new(publishers: Vec<Arc<dyn Publisher>>) -> Self {
        Self { publishers }
    }
}

impl Publisher for MultiPublisher {
    fn publish(
        &self,
        record: Record,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some((last, rest)) = self.publishers.split_last() else {
                return;
            };

            for publisher in rest {
                publisher.publish(record.clone()).await;
            }

            last.publish(record).await;
        })
    }
}

/// Keeps every published record in memory.
#[derive(Debug, Default)]
pub struct CollectingPublisher {
    records: Mutex<Vec<Record>>,
}

impl CollectingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

impl Publisher for CollectingPublisher {
    fn publish(
        &self,
        record: Record,
    ) -> BoxFuture<'_, ()> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(record);
        Box::pin(async {})
    }
}
