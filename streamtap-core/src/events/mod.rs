//! ## streamtap-core::events
//! **Decoded message and stream events, and subscriber fan-out**
//!
//! ### Key Submodules:
//! - `network/`: Connection identity shared by the tracker and the events
//! - `subscribers/`: Ordered callback list with panic isolation

pub mod network;
pub mod subscribers;

use bytes::Bytes;

pub use network::ConnectionId;
pub use subscribers::{Subscriber, SubscriberList, SubscriptionId};

/// Which half of a connection a message travelled on, seen from the
/// monitored process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded application message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEvent {
    pub connection: ConnectionId,
    pub direction: Direction,
    /// Capture time of the frame that carried the message, in milliseconds
    /// since the UNIX epoch.
    pub epoch: i64,
    pub payload: Bytes,
}

impl MessageEvent {
    #[inline]
    pub fn new(connection: ConnectionId, direction: Direction, epoch: i64, payload: Bytes) -> Self {
        Self {
            connection,
            direction,
            epoch,
            payload,
        }
    }
}

/// Contiguous bytes released by TCP reassembly, before any framing. One event
/// per reassembled segment, in stream order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEvent {
    pub connection: ConnectionId,
    pub direction: Direction,
    /// Capture time of the segment, in milliseconds since the UNIX epoch.
    pub epoch: i64,
    pub data: Bytes,
}

impl StreamEvent {
    #[inline]
    pub fn new(connection: ConnectionId, direction: Direction, epoch: i64, data: Bytes) -> Self {
        Self {
            connection,
            direction,
            epoch,
            data,
        }
    }
}

/// Events that belong to one direction of one connection.
pub trait ConnectionEvent {
    /// Short label used in logs.
    const KIND: &'static str;

    fn connection(&self) -> &ConnectionId;
    fn direction(&self) -> Direction;
}

impl ConnectionEvent for MessageEvent {
    const KIND: &'static str = "message";

    fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}

impl ConnectionEvent for StreamEvent {
    const KIND: &'static str = "stream";

    fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}
