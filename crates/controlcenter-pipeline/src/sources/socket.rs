use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SourceError;
use super::file::StreamSource;
use crate::announcer::{EmptyImportAnnouncer, ImportAnnouncer};
use crate::reader::{ReadContext, read_lines};

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// `unix=/path/to/socket` or `tcp=host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for SocketAddress {
    type Err = SourceError;

    fn from_str(description: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = description.split('=').collect();
        let [kind, address] = parts.as_slice() else {
            return Err(SourceError::InvalidSocketDescription(description.to_string()));
        };

        match *kind {
            "unix" => Ok(Self::Unix(PathBuf::from(address))),
            "tcp" => Ok(Self::Tcp(address.to_string())),
            other => Err(SourceError::UnsupportedSocketKind(other.to_string())),
        }
    }
}

enum Listener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// Accepts log streams; every connection is read on its own task.
pub struct SocketSource {
    listener: Listener,
}

impl SocketSource {
    pub async fn bind(address: &SocketAddress) -> Result<Self> {
        let listener = match address {
            #[cfg(unix)]
            SocketAddress::Unix(path) => {
                if let Err(err) = tokio::fs::remove_file(path).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        return Err(err)
                            .with_context(|| format!("failed to remove stale socket: path={}", path.display()));
                    }
                }

                let listener = UnixListener::bind(path)
                    .with_context(|| format!("failed to bind unix socket: path={}", path.display()))?;
                info!("log socket ready: unix={}", path.display());
                Listener::Unix(listener)
            }
            #[cfg(not(unix))]
            SocketAddress::Unix(_) => return Err(SourceError::UnsupportedSocketKind("unix".to_string()).into()),
            SocketAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind tcp socket: addr={addr}"))?;
                info!("log socket ready: tcp={addr}");
                Listener::Tcp(listener)
            }
        };

        Ok(Self { listener })
    }

    pub fn local_tcp_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(_) => None,
        }
    }

    /// Runs until cancelled. Only the first connection reports import
    /// progress; later ones may start after the import was announced done.
    pub async fn serve(
        self,
        ctx: ReadContext,
        connection_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut connections = JoinSet::new();
        let mut first = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        warn!("log connection task failed: error={err}");
                    }
                }
                accepted = self.accept() => {
                    let (stream, peer) = accepted?;
                    info!("log socket connection: peer={peer}");

                    let announcer: Arc<dyn ImportAnnouncer> = if first {
                        first = false;
                        ctx.announcer.clone()
                    } else {
                        Arc::new(EmptyImportAnnouncer)
                    };

                    let conn_ctx = ReadContext { idle_timeout: connection_timeout, ..ctx.with_announcer(announcer) };
                    connections.spawn(read_connection(stream, conn_ctx, peer, cancel.child_token()));
                }
            }
        }

        debug!("log socket stopping: open_connections={}", connections.len());
        while connections.join_next().await.is_some() {}
        Ok(())
    }

    async fn accept(&self) -> Result<(Box<dyn AsyncRead + Unpin + Send>, String)> {
        match &self.listener {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await.context("failed to accept tcp connection")?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await.context("failed to accept unix connection")?;
                Ok((Box::new(stream), "unix".to_string()))
            }
        }
    }
}

async fn read_connection(
    stream: Box<dyn AsyncRead + Unpin + Send>,
    ctx: ReadContext,
    peer: String,
    cancel: CancellationToken,
) {
    match read_lines(StreamSource::new(stream), &ctx, cancel).await {
        Ok(()) => debug!("log socket connection closed: peer={peer}"),
        Err(err) => warn!("log socket connection failed: peer={peer}, error={err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use super::*;
    use crate::announcer::DummyImportAnnouncer;
    use crate::clock::{Clock, FakeClock};
    use crate::publisher::CollectingPublisher;
    use crate::transform::{TransformerArgs, TransformerRegistry};

    fn context(
        publisher: Arc<CollectingPublisher>,
        announcer: Arc<DummyImportAnnouncer>,
    ) -> ReadContext {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(datetime!(2020-06-01 0:00 UTC)));
        let transformer = TransformerRegistry::builtin()
            .builder("default", TransformerArgs { clock: clock.clone(), year: Some(2020) })
            .expect("known format");

        ReadContext { publisher, transformer, announcer, clock, idle_timeout: Duration::from_secs(60) }
    }

    #[test]
    fn parses_socket_descriptions() {
        assert_eq!("unix=/run/logs.sock".parse::<SocketAddress>(), Ok(SocketAddress::Unix(PathBuf::from("/run/logs.sock"))));
        assert_eq!("tcp=:9999".parse::<SocketAddress>(), Ok(SocketAddress::Tcp(":9999".to_string())));
        assert_eq!(
            "tcp".parse::<SocketAddress>(),
            Err(SourceError::InvalidSocketDescription("tcp".to_string())),
        );
        assert_eq!(
            "tcp=a=b".parse::<SocketAddress>(),
            Err(SourceError::InvalidSocketDescription("tcp=a=b".to_string())),
        );
        assert_eq!("udp=:514".parse::<SocketAddress>(), Err(SourceError::UnsupportedSocketKind("udp".to_string())));
    }

    #[tokio::test]
    async fn connections_are_read_and_only_the_first_reports_progress() {
        let publisher = Arc::new(CollectingPublisher::new());
        let announcer = Arc::new(DummyImportAnnouncer::new());
        let ctx = context(publisher.clone(), announcer.clone());

        let source = SocketSource::bind(&SocketAddress::Tcp("127.0.0.1:0".to_string())).await.expect("bind");
        let addr = source.local_tcp_addr().expect("tcp address");
        let cancel = CancellationToken::new();
        let serving = tokio::spawn(source.serve(ctx, DEFAULT_CONNECTION_TIMEOUT, cancel.clone()));

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(
                b"Jan 10 16:15:30 mail postfix/qmgr[3]: 4AA091855DA0: removed\n\
                  Jan 10 16:15:31 mail postfix/qmgr[3]: 4AA091855DB0: removed\n",
            )
            .await
            .expect("write");
        stream.shutdown().await.expect("shutdown");
        drop(stream);

        timeout(Duration::from_secs(5), announcer.wait_finished()).await.expect("first connection finished");

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream.write_all(b"Jan 10 16:15:32 mail postfix/qmgr[3]: 4AA091855DC0: removed\n").await.expect("write");
        stream.shutdown().await.expect("shutdown");
        drop(stream);

        timeout(Duration::from_secs(5), async {
            while publisher.records().len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all records published");

        cancel.cancel();
        timeout(Duration::from_secs(5), serving).await.expect("stops").expect("joined").expect("serve");

        assert_eq!(announcer.start(), Some(Some(datetime!(2020-01-10 16:15:30 UTC))));
        assert_eq!(announcer.progress().iter().filter(|p| p.finished).count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_replaces_stale_file() {
        let path = crate::dbrunner::tests::temp_dir().join("logs.sock");
        std::fs::write(&path, "stale").expect("write");

        let source = SocketSource::bind(&SocketAddress::Unix(path.clone())).await.expect("bind");
        assert!(source.local_tcp_addr().is_none());

        let publisher = Arc::new(CollectingPublisher::new());
        let announcer = Arc::new(DummyImportAnnouncer::new());
        let cancel = CancellationToken::new();
        let serving =
            tokio::spawn(source.serve(context(publisher.clone(), announcer.clone()), DEFAULT_CONNECTION_TIMEOUT, cancel.clone()));

        let mut stream = tokio::net::UnixStream::connect(&path).await.expect("connect");
        stream.write_all(b"Jan 10 16:15:30 mail postfix/qmgr[3]: 4AA091855DA0: removed\n").await.expect("write");
        stream.shutdown().await.expect("shutdown");
        drop(stream);

        timeout(Duration::from_secs(5), announcer.wait_finished()).await.expect("finished");
        assert_eq!(publisher.records().len(), 1);

        cancel.cancel();
        timeout(Duration::from_secs(5), serving).await.expect("stops").expect("joined").expect("serve");
    }
}
