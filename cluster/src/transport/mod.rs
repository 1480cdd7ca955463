//! Peer networking: the listener capability, the adapter raft talks
//! through, and the framed raft message transport on top.

mod adapter;
mod listener;
mod network;

pub use self::adapter::TransportAdapter;
pub use self::listener::{Connection, NetworkListener, Stream, TcpNetworkListener};
pub use self::network::{read_frame, write_frame, RaftTransport, WireFrame, MAX_FRAME_SIZE};
