//! TCP network stream channels.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use super::options::NetworkConfig;
use super::stream::{Acceptor, Duplex, Endpoint, StreamChannel};
use super::ChannelContext;
use crate::error::Result;

pub(crate) const KIND: &str = "network";

/// Build a network channel from `config`.
pub fn network_channel(
    id: impl Into<String>,
    config: &NetworkConfig,
    ctx: ChannelContext,
) -> Result<StreamChannel> {
    let address = config.address()?;
    StreamChannel::new(
        id,
        KIND,
        config.mode,
        config.options.clone(),
        Arc::new(TcpEndpoint { address }),
        ctx,
    )
}

struct TcpEndpoint {
    address: String,
}

#[async_trait]
impl Endpoint for TcpEndpoint {
    fn describe(&self) -> String {
        self.address.clone()
    }

    async fn dial(&self) -> io::Result<Duplex> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    }

    async fn bind(&self) -> io::Result<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(&self.address).await?;
        Ok(Box::new(TcpAcceptor { listener }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> io::Result<Duplex> {
        let (stream, peer) = self.listener.accept().await?;
        tracing::debug!("Accepted network peer {}", peer);
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::transport::{Channel, ChannelMode};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_client_talks_to_plain_tcp_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (tx, mut rx) = mpsc::channel(16);
        let channel = network_channel(
            "net",
            &NetworkConfig::new("127.0.0.1", port, ChannelMode::Client),
            ChannelContext::new(EventBus::new(), tx),
        )
        .unwrap();

        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            write_half.write_all(b"{\"echo\":true}\n").await.unwrap();
            line
        });

        channel.connect().await.unwrap();
        channel.send(&json!({"jsonrpc": "2.0", "method": "ping"})).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.payload, json!({"echo": true}));
        assert_eq!(peer.await.unwrap(), r#"{"jsonrpc":"2.0","method":"ping"}"#);
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let config: NetworkConfig = serde_json::from_value(json!({"url": "not a url"})).unwrap();
        assert!(network_channel("bad", &config, ChannelContext::new(EventBus::new(), tx)).is_err());
    }
}
