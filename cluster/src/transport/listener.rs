use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::{Error, Result};

/// A bidirectional byte stream to a peer.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type Connection = Box<dyn Stream>;

/// The network capability a consensus server is started with.
///
/// `close` must make a pending or later `accept` fail promptly.
#[async_trait]
pub trait NetworkListener: Send + Sync {
    async fn accept(&self) -> Result<Connection>;
    async fn dial(&self, address: &str, timeout: Duration) -> Result<Connection>;
    fn close(&self) -> Result<()>;
    /// The address peers should dial to reach this listener.
    fn local_address(&self) -> String;
}

fn closed_error() -> Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed").into()
}

/// [`NetworkListener`] over plain TCP.
pub struct TcpNetworkListener {
    listener: Mutex<Option<Arc<TcpListener>>>,
    address: String,
    closed: watch::Sender<bool>,
}

impl TcpNetworkListener {
    /// Binds `addr`. Peers are told to dial `advertise` when given, the bound
    /// address otherwise.
    pub async fn bind(addr: &str, advertise: Option<String>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let address = match advertise {
            Some(advertise) => advertise,
            None => listener.local_addr()?.to_string(),
        };
        let (closed, _) = watch::channel(false);
        Ok(TcpNetworkListener {
            listener: Mutex::new(Some(Arc::new(listener))),
            address,
            closed,
        })
    }

    fn listener(&self) -> Option<Arc<TcpListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl NetworkListener for TcpNetworkListener {
    async fn accept(&self) -> Result<Connection> {
        let mut closed = self.closed.subscribe();
        let is_closed = *closed.borrow();
        let listener = match self.listener() {
            Some(listener) if !is_closed => listener,
            _ => return Err(closed_error()),
        };
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream) as Connection)
            }
            _ = closed.changed() => Err(closed_error()),
        }
    }

    async fn dial(&self, address: &str, timeout: Duration) -> Result<Connection> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream) as Connection)
    }

    fn close(&self) -> Result<()> {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.closed.send_replace(true);
        Ok(())
    }

    fn local_address(&self) -> String {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let listener = Arc::new(TcpNetworkListener::bind("127.0.0.1:0", None).await.unwrap());
        let accepting = tokio::spawn({
            let listener = listener.clone();
            async move { listener.accept().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = Instant::now();
        listener.close().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), accepting)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(2));

        assert!(listener.accept().await.is_err());
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let listener = TcpNetworkListener::bind("127.0.0.1:0", None).await.unwrap();
        let address = listener.local_address();

        let (accepted, dialed) = tokio::join!(
            listener.accept(),
            listener.dial(&address, Duration::from_secs(1))
        );
        let (mut server, mut client) = (accepted.unwrap(), dialed.unwrap());
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_advertised_address() {
        let listener = TcpNetworkListener::bind("127.0.0.1:0", Some("node-a:4002".into()))
            .await
            .unwrap();
        assert_eq!(listener.local_address(), "node-a:4002");
    }
}
