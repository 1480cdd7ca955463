//! Raft message transport
//!
//! Carries raft-rs `Message`s between servers over connections obtained from
//! the [`TransportAdapter`]. Every frame is a big endian `u32` length followed
//! by a bincode [`WireFrame`] holding the sender's advertised address and the
//! protobuf encoded message, so a receiver learns how to reach whoever talks
//! to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protobuf::Message as PbMessage;
use raft::prelude::Message;
use serde_derive::{Deserialize, Serialize};
use slog::{debug, info, warn, Logger};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;

use super::adapter::TransportAdapter;
use super::listener::Connection;
use crate::consensus::CONNECTION_TIMEOUT;
use crate::error::Result;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: u32 = 64 << 20;
/// Messages queued per peer before new ones are dropped. Raft resends.
const PEER_QUEUE_SIZE: usize = 1024;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFrame {
    pub from_address: String,
    pub message: Vec<u8>,
}

pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    frame: &WireFrame,
) -> Result<()> {
    let encoded = bincode::serialize(frame)?;
    let length = u32::try_from(encoded.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| frame_too_large(encoded.len()))?;
    writer.write_u32(length).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<WireFrame> {
    let length = reader.read_u32().await?;
    if length > MAX_FRAME_SIZE {
        return Err(frame_too_large(length as usize));
    }
    let mut buffer = vec![0u8; length as usize];
    reader.read_exact(&mut buffer).await?;
    Ok(bincode::deserialize(&buffer)?)
}

fn frame_too_large(len: usize) -> crate::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("frame of {} bytes exceeds {}", len, MAX_FRAME_SIZE),
    )
    .into()
}

/// Send side for a single peer
struct PeerClient {
    address: String,
    /// Channel feeding the peer's send loop
    sender: Sender<Message>,
    /// Set once the send loop gave up; the next send redials
    invalid: Arc<AtomicBool>,
}

impl PeerClient {
    fn new(transport: &RaftTransport, id: u64, address: String) -> Self {
        let (sender, receiver) = mpsc::channel(PEER_QUEUE_SIZE);
        let invalid = Arc::new(AtomicBool::new(false));

        let adapter = transport.adapter.clone();
        let logger = transport.logger.new(slog::o!("peer" => id));
        let from_address = adapter.local_address();
        let target = address.clone();
        let invalid_clone = invalid.clone();
        tokio::spawn(async move {
            if let Err(e) =
                Self::stream_messages(&adapter, &target, &from_address, receiver).await
            {
                warn!(logger, "sending to peer failed"; "address" => &target, "error" => %e);
                invalid_clone.store(true, Ordering::SeqCst);
            }
        });

        PeerClient {
            address,
            sender,
            invalid,
        }
    }

    /// Dials on the first message, then writes every queued message until
    /// the channel closes or the connection breaks.
    async fn stream_messages(
        adapter: &TransportAdapter,
        address: &str,
        from_address: &str,
        mut receiver: Receiver<Message>,
    ) -> Result<()> {
        let mut conn: Option<Connection> = None;
        while let Some(msg) = receiver.recv().await {
            if conn.is_none() {
                conn = Some(adapter.dial(address, CONNECTION_TIMEOUT).await?);
            }
            let frame = WireFrame {
                from_address: from_address.to_string(),
                message: msg.write_to_bytes()?,
            };
            if let Some(conn) = conn.as_mut() {
                write_frame(conn, &frame).await?;
            }
        }
        Ok(())
    }
}

/// Where a peer can be reached.
struct PeerAddress {
    address: String,
    /// Taken from the peer's own frames rather than from membership; a newer
    /// frame may replace it.
    learned: bool,
}

/// Point to point delivery of raft messages, keyed by raft id.
pub struct RaftTransport {
    adapter: TransportAdapter,
    addresses: Mutex<HashMap<u64, PeerAddress>>,
    peers: Mutex<HashMap<u64, PeerClient>>,
    /// Tasks reading inbound connections
    receivers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    logger: Logger,
}

impl RaftTransport {
    pub fn new(adapter: TransportAdapter, logger: Logger) -> Arc<Self> {
        Arc::new(RaftTransport {
            adapter,
            addresses: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            receivers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            logger,
        })
    }

    pub fn local_address(&self) -> String {
        self.adapter.local_address()
    }

    /// Records where `id` can be reached, replacing any previous address.
    pub fn add_peer(&self, id: u64, address: &str) {
        let previous = self
            .addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                PeerAddress {
                    address: address.to_string(),
                    learned: false,
                },
            );
        if previous.map(|p| p.address).as_deref() != Some(address) {
            info!(self.logger, "peer address set"; "peer" => id, "address" => address);
        }
    }

    pub fn remove_peer(&self, id: u64) {
        self.addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        info!(self.logger, "peer removed"; "peer" => id);
    }

    pub fn peer_address(&self, id: u64) -> Option<String> {
        self.addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|p| p.address.clone())
    }

    /// Queues a message for its destination. Never blocks: messages to
    /// unknown peers or to a full queue are dropped.
    pub fn send(&self, msg: Message) {
        let to = msg.to;
        let Some(address) = self.peer_address(to) else {
            debug!(self.logger, "no address for peer, dropping message"; "peer" => to);
            return;
        };

        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let stale = peers
            .get(&to)
            .map_or(false, |p| p.invalid.load(Ordering::SeqCst) || p.address != address);
        if stale {
            peers.remove(&to);
        }
        let peer = peers
            .entry(to)
            .or_insert_with(|| PeerClient::new(self, to, address));

        if let Err(e) = peer.sender.try_send(msg) {
            debug!(self.logger, "dropping raft message"; "peer" => to, "error" => %e);
        }
    }

    /// Accepts peer connections and forwards every message they carry into
    /// `mailbox` until the transport is closed.
    pub fn start(self: &Arc<Self>, mailbox: Sender<Message>) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                match transport.adapter.accept().await {
                    Ok(conn) => {
                        let receiver = transport.clone();
                        let mailbox = mailbox.clone();
                        let handle = tokio::spawn(async move {
                            if let Err(e) = receiver.receive(conn, mailbox).await {
                                debug!(receiver.logger, "peer connection closed"; "error" => %e);
                            }
                        });
                        let mut receivers =
                            transport.receivers.lock().unwrap_or_else(|e| e.into_inner());
                        receivers.retain(|h| !h.is_finished());
                        receivers.push(handle);
                    }
                    Err(_) if transport.closed.load(Ordering::SeqCst) => break,
                    Err(e) => {
                        warn!(transport.logger, "accept failed"; "error" => %e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
            info!(transport.logger, "transport closed");
        })
    }

    async fn receive(&self, mut conn: Connection, mailbox: Sender<Message>) -> Result<()> {
        loop {
            let frame = read_frame(&mut conn).await?;
            let msg = Message::parse_from_bytes(&frame.message)?;
            self.learn_address(msg.from, frame.from_address);
            if mailbox.send(msg).await.is_err() {
                return Ok(());
            }
        }
    }

    /// Records the address a peer advertises in its frames, unless
    /// membership already told us where it lives.
    fn learn_address(&self, id: u64, address: String) {
        let mut addresses = self.addresses.lock().unwrap_or_else(|e| e.into_inner());
        match addresses.get(&id) {
            Some(known) if !known.learned || known.address == address => {}
            _ => {
                debug!(self.logger, "learned peer address"; "peer" => id, "address" => &address);
                addresses.insert(
                    id,
                    PeerAddress {
                        address,
                        learned: true,
                    },
                );
            }
        }
    }

    /// Stops accepting connections, drops every send loop and hangs up on
    /// inbound connections.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        for receiver in self
            .receivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            receiver.abort();
        }
        self.adapter.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{NetworkListener, TcpNetworkListener};
    use raft::prelude::MessageType;

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    async fn transport() -> Arc<RaftTransport> {
        let listener = TcpNetworkListener::bind("127.0.0.1:0", None).await.unwrap();
        RaftTransport::new(TransportAdapter::new(Arc::new(listener)), logger())
    }

    #[tokio::test]
    async fn test_frame_rejects_oversized_length() {
        let mut bytes: &[u8] = &(MAX_FRAME_SIZE + 1).to_be_bytes();
        assert!(read_frame(&mut bytes).await.is_err());
    }

    #[tokio::test]
    async fn test_message_delivery() {
        let a = transport().await;
        let b = transport().await;
        let (tx, mut rx) = mpsc::channel(16);
        let accept_loop = b.start(tx);

        a.add_peer(2, &b.local_address());
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgHeartbeat);
        msg.from = 1;
        msg.to = 2;
        msg.term = 5;
        a.send(msg);

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.get_msg_type(), MessageType::MsgHeartbeat);
        assert_eq!(received.term, 5);
        // The receiver now knows how to answer.
        assert_eq!(b.peer_address(1), Some(a.local_address()));

        b.close().unwrap();
        tokio::time::timeout(Duration::from_secs(2), accept_loop)
            .await
            .unwrap()
            .unwrap();
    }

    fn frame(from: u64, from_address: &str) -> WireFrame {
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgHeartbeatResponse);
        msg.from = from;
        msg.to = 2;
        WireFrame {
            from_address: from_address.to_string(),
            message: msg.write_to_bytes().unwrap(),
        }
    }

    async fn dial(to: &RaftTransport) -> Connection {
        let dialer = TcpNetworkListener::bind("127.0.0.1:0", None).await.unwrap();
        dialer
            .dial(&to.local_address(), Duration::from_secs(2))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_learned_address_follows_frames() {
        let b = transport().await;
        let (tx, mut rx) = mpsc::channel(16);
        let _accept_loop = b.start(tx);
        let mut conn = dial(&b).await;

        for address in ["10.0.0.1:4000", "10.0.0.2:4000"] {
            write_frame(&mut conn, &frame(7, address)).await.unwrap();
            rx.recv().await.unwrap();
            assert_eq!(b.peer_address(7).as_deref(), Some(address));
        }

        // Membership wins over whatever the peer advertises.
        b.add_peer(7, "10.0.0.3:4000");
        write_frame(&mut conn, &frame(7, "10.0.0.4:4000")).await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(b.peer_address(7).as_deref(), Some("10.0.0.3:4000"));
        b.close().unwrap();
    }

    #[tokio::test]
    async fn test_close_hangs_up_inbound_connections() {
        let b = transport().await;
        let (tx, mut rx) = mpsc::channel(16);
        let accept_loop = b.start(tx);
        let mut conn = dial(&b).await;
        write_frame(&mut conn, &frame(7, "10.0.0.1:4000")).await.unwrap();
        rx.recv().await.unwrap();

        b.close().unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        tokio::time::timeout(Duration::from_secs(2), accept_loop)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_peer_is_dropped() {
        let a = transport().await;
        let mut msg = Message::default();
        msg.to = 42;
        a.send(msg);
        assert!(a.peers.lock().unwrap().is_empty());
    }
}
