//! Named pipe channels.
//!
//! Native `\\.\pipe\<name>` pipes on Windows. Elsewhere the `fallback`
//! setting decides: `domainSocket` serves the same name over a domain socket
//! at `<tmp>/<name>.sock`, `error` makes `connect()` fail with `Unsupported`.

use std::sync::Arc;

#[cfg(not(windows))]
use super::options::PipeFallback;
use super::options::NamedPipeConfig;
use super::stream::{Endpoint, StreamChannel};
use super::ChannelContext;
use crate::error::Result;

pub(crate) const KIND: &str = "named_pipe";

/// Build a named pipe channel from `config`.
pub fn named_pipe_channel(
    id: impl Into<String>,
    config: &NamedPipeConfig,
    ctx: ChannelContext,
) -> Result<StreamChannel> {
    let id = id.into();
    let endpoint = select_endpoint(&id, config);
    StreamChannel::new(id, KIND, config.mode, config.options.clone(), endpoint, ctx)
}

#[cfg(windows)]
fn select_endpoint(_id: &str, config: &NamedPipeConfig) -> Arc<dyn Endpoint> {
    Arc::new(native::PipeEndpoint::new(config.pipe_path()))
}

#[cfg(not(windows))]
fn select_endpoint(id: &str, config: &NamedPipeConfig) -> Arc<dyn Endpoint> {
    match config.fallback {
        PipeFallback::DomainSocket => {
            let path = config.fallback_path();
            tracing::info!(
                "Named pipes unavailable; channel {} uses domain socket {}",
                id,
                path.display()
            );
            Arc::new(super::domain_socket::imp::SocketEndpoint::new(path, Some(0o600)))
        }
        PipeFallback::Error => Arc::new(unavailable::NoPipes {
            name: config.name.clone(),
        }),
    }
}

#[cfg(not(windows))]
mod unavailable {
    use async_trait::async_trait;
    use std::io;

    use crate::error::{ConduitError, Result};
    use crate::transport::stream::{Acceptor, Duplex, Endpoint};

    pub(super) struct NoPipes {
        pub name: String,
    }

    #[async_trait]
    impl Endpoint for NoPipes {
        fn describe(&self) -> String {
            format!("pipe {}", self.name)
        }

        fn check(&self) -> Result<()> {
            Err(ConduitError::Unsupported {
                message: format!(
                    "named pipe '{}' requires Windows and fallback is disabled",
                    self.name
                ),
            })
        }

        async fn dial(&self) -> io::Result<Duplex> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "named pipes unavailable"))
        }

        async fn bind(&self) -> io::Result<Box<dyn Acceptor>> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "named pipes unavailable"))
        }
    }
}

#[cfg(windows)]
mod native {
    use async_trait::async_trait;
    use std::io;
    use std::time::Duration;
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};

    use crate::transport::stream::{Acceptor, Duplex, Endpoint};

    /// ERROR_PIPE_BUSY: every server instance is taken.
    const PIPE_BUSY: i32 = 231;

    pub(super) struct PipeEndpoint {
        path: String,
    }

    impl PipeEndpoint {
        pub(super) fn new(path: String) -> Self {
            Self { path }
        }
    }

    #[async_trait]
    impl Endpoint for PipeEndpoint {
        fn describe(&self) -> String {
            self.path.clone()
        }

        async fn dial(&self) -> io::Result<Duplex> {
            let client = loop {
                match ClientOptions::new().open(&self.path) {
                    Ok(client) => break client,
                    Err(e) if e.raw_os_error() == Some(PIPE_BUSY) => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => return Err(e),
                }
            };
            let (reader, writer) = tokio::io::split(client);
            Ok((Box::new(reader), Box::new(writer)))
        }

        async fn bind(&self) -> io::Result<Box<dyn Acceptor>> {
            let next = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&self.path)?;
            Ok(Box::new(PipeAcceptor {
                path: self.path.clone(),
                next,
            }))
        }
    }

    struct PipeAcceptor {
        path: String,
        next: NamedPipeServer,
    }

    #[async_trait]
    impl Acceptor for PipeAcceptor {
        async fn accept(&mut self) -> io::Result<Duplex> {
            self.next.connect().await?;
            // Keep one instance waiting so the next peer can connect.
            let fresh = ServerOptions::new().create(&self.path)?;
            let connected = std::mem::replace(&mut self.next, fresh);
            let (reader, writer) = tokio::io::split(connected);
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ConduitError;
    use crate::events::EventBus;
    use crate::transport::{Channel, ChannelMode, InboundMessage};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn ctx() -> (ChannelContext, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (ChannelContext::new(EventBus::new(), tx), rx)
    }

    #[tokio::test]
    async fn test_fallback_error_fails_connect() {
        let mut config = NamedPipeConfig::new("conduit-no-fallback", ChannelMode::Client);
        config.fallback = PipeFallback::Error;
        let (c, _rx) = ctx();
        let channel = named_pipe_channel("pipe", &config, c).unwrap();

        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, ConduitError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_fallback_domain_socket_exchanges_messages() {
        let name = format!("conduit-pipe-{}", uuid::Uuid::new_v4().simple());
        let (sc, mut server_rx) = ctx();
        let server = named_pipe_channel(
            "pipe-server",
            &NamedPipeConfig::new(&name, ChannelMode::Server),
            sc,
        )
        .unwrap();
        server.connect().await.unwrap();

        let (cc, _client_rx) = ctx();
        let client = named_pipe_channel(
            "pipe-client",
            &NamedPipeConfig::new(&name, ChannelMode::Client),
            cc,
        )
        .unwrap();
        client.connect().await.unwrap();
        client.send(&json!({"hello": "pipe"})).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, json!({"hello": "pipe"}));

        client.close().await.unwrap();
        server.close().await.unwrap();
        assert!(!NamedPipeConfig::new(&name, ChannelMode::Server)
            .fallback_path()
            .exists());
    }
}
