//! Unix domain socket channels.

use std::sync::Arc;

use super::options::DomainSocketConfig;
use super::stream::StreamChannel;
use super::ChannelContext;
use crate::error::Result;

pub(crate) const KIND: &str = "domain_socket";

/// Build a domain socket channel from `config`.
pub fn domain_socket_channel(
    id: impl Into<String>,
    config: &DomainSocketConfig,
    ctx: ChannelContext,
) -> Result<StreamChannel> {
    StreamChannel::new(
        id,
        KIND,
        config.mode,
        config.options.clone(),
        Arc::new(imp::SocketEndpoint::new(config.path.clone(), config.permissions)),
        ctx,
    )
}

#[cfg(unix)]
pub(crate) mod imp {
    use async_trait::async_trait;
    use std::io;
    use std::path::PathBuf;
    use tokio::net::{UnixListener, UnixStream};
    use tracing::{debug, warn};

    use crate::transport::stream::{Acceptor, Duplex, Endpoint};

    pub(crate) struct SocketEndpoint {
        path: PathBuf,
        permissions: Option<u32>,
    }

    impl SocketEndpoint {
        pub(crate) fn new(path: PathBuf, permissions: Option<u32>) -> Self {
            Self { path, permissions }
        }
    }

    #[async_trait]
    impl Endpoint for SocketEndpoint {
        fn describe(&self) -> String {
            self.path.display().to_string()
        }

        async fn dial(&self) -> io::Result<Duplex> {
            let stream = UnixStream::connect(&self.path).await?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }

        async fn bind(&self) -> io::Result<Box<dyn Acceptor>> {
            if self.path.exists() {
                debug!("Removing stale socket {}", self.path.display());
                std::fs::remove_file(&self.path)?;
            }
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let listener = UnixListener::bind(&self.path)?;

            if let Some(mode) = self.permissions {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(mode))?;
            }

            Ok(Box::new(SocketAcceptor { listener }))
        }

        fn cleanup(&self) {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!("Removed socket {}", self.path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove socket {}: {}", self.path.display(), e),
            }
        }
    }

    struct SocketAcceptor {
        listener: UnixListener,
    }

    #[async_trait]
    impl Acceptor for SocketAcceptor {
        async fn accept(&mut self) -> io::Result<Duplex> {
            let (stream, _) = self.listener.accept().await?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}

#[cfg(not(unix))]
pub(crate) mod imp {
    use async_trait::async_trait;
    use std::io;
    use std::path::PathBuf;

    use crate::error::{ConduitError, Result};
    use crate::transport::stream::{Acceptor, Duplex, Endpoint};

    pub(crate) struct SocketEndpoint {
        path: PathBuf,
    }

    impl SocketEndpoint {
        pub(crate) fn new(path: PathBuf, _permissions: Option<u32>) -> Self {
            Self { path }
        }
    }

    #[async_trait]
    impl Endpoint for SocketEndpoint {
        fn describe(&self) -> String {
            self.path.display().to_string()
        }

        fn check(&self) -> Result<()> {
            Err(ConduitError::Unsupported {
                message: "domain sockets are not available on this platform".into(),
            })
        }

        async fn dial(&self) -> io::Result<Duplex> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "domain sockets unavailable"))
        }

        async fn bind(&self) -> io::Result<Box<dyn Acceptor>> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "domain sockets unavailable"))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ConduitError;
    use crate::events::EventBus;
    use crate::transport::{Channel, ChannelMode, ConnectionState, InboundMessage};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn ctx() -> (ChannelContext, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (ChannelContext::new(EventBus::new(), tx), rx)
    }

    async fn wait_connected(ch: &StreamChannel) {
        for _ in 0..200 {
            if ch.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("channel {} never connected", ch.id());
    }

    #[tokio::test]
    async fn test_exchange_one_message_each_way() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.sock");

        let (server_ctx, mut server_rx) = ctx();
        let mut server_config = DomainSocketConfig::new(&path, ChannelMode::Server);
        server_config.permissions = Some(0o600);
        let server = domain_socket_channel("server", &server_config, server_ctx).unwrap();
        server.connect().await.unwrap();
        assert_eq!(server.state(), ConnectionState::Connecting);

        let (client_ctx, mut client_rx) = ctx();
        let client = domain_socket_channel(
            "client",
            &DomainSocketConfig::new(&path, ChannelMode::Client),
            client_ctx,
        )
        .unwrap();
        client.connect().await.unwrap();
        wait_connected(&server).await;

        client.send(&json!({"from": "client"})).await.unwrap();
        server.send(&json!({"from": "server"})).await.unwrap();

        assert_eq!(server_rx.recv().await.unwrap().payload, json!({"from": "client"}));
        assert_eq!(client_rx.recv().await.unwrap().payload, json!({"from": "server"}));

        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        client.close().await.unwrap();
        server.close().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_client_connect_to_missing_socket_fails() {
        let dir = TempDir::new().unwrap();
        let (client_ctx, _rx) = ctx();
        let client = domain_socket_channel(
            "client",
            &DomainSocketConfig::new(dir.path().join("absent.sock"), ChannelMode::Client),
            client_ctx,
        )
        .unwrap();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ConduitError::TransportFailure { .. }));
    }

    #[tokio::test]
    async fn test_new_peer_replaces_previous() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replace.sock");

        let (server_ctx, mut server_rx) = ctx();
        let server = domain_socket_channel(
            "server",
            &DomainSocketConfig::new(&path, ChannelMode::Server),
            server_ctx,
        )
        .unwrap();
        server.connect().await.unwrap();

        let mut no_reconnect = DomainSocketConfig::new(&path, ChannelMode::Client);
        no_reconnect.options.reconnect = false;

        let (first_ctx, _first_rx) = ctx();
        let first = domain_socket_channel("first", &no_reconnect, first_ctx).unwrap();
        first.connect().await.unwrap();
        wait_connected(&server).await;

        let (second_ctx, mut second_rx) = ctx();
        let second = domain_socket_channel("second", &no_reconnect, second_ctx).unwrap();
        second.connect().await.unwrap();

        // The server talks to whichever peer connected last.
        second.send(&json!({"peer": 2})).await.unwrap();
        assert_eq!(server_rx.recv().await.unwrap().payload, json!({"peer": 2}));
        server.send(&json!({"to": "latest"})).await.unwrap();
        assert_eq!(second_rx.recv().await.unwrap().payload, json!({"to": "latest"}));

        second.close().await.unwrap();
        first.close().await.unwrap();
        server.close().await.unwrap();
    }
}
