//! Keeps the running Postfix version in the metadata store.

use controlcenter_postfix::{Payload, Record};
use futures_util::future::BoxFuture;
use tracing::{info, warn};

use crate::metadata::{Metadata, stored};
use crate::publisher::Publisher;

pub const POSTFIX_VERSION_KEY: &str = "postfix_version";

pub struct VersionPublisher {
    metadata: Metadata,
}

impl VersionPublisher {
    pub fn new(metadata: Metadata) -> Self {
        Self { metadata }
    }
}

impl Publisher for VersionPublisher {
    fn publish(
        &self,
        record: Record,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Payload::Version(version) = &record.payload else {
                return;
            };

            info!("postfix version detected: version={}, host={}", version.version, record.header.host);

            let rx = self.metadata.store_json(POSTFIX_VERSION_KEY, &version.version);
            let version = version.version.clone();

            tokio::spawn(async move {
                if let Err(err) = stored(rx).await {
                    warn!("failed to store postfix version: version={version}, error={err}");
                }
            });
        })
    }
}
