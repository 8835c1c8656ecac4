//! The byte-transport seam between a driver and its instrument.
//!
//! Everything above this trait works in terms of raw byte writes and a
//! read sink; serial lines, port-agent sockets and in-process test
//! doubles all plug in the same way.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use seadaq_core::DriverResult;

/// Where a transport delivers everything it reads. When the transport
/// dies it drops its sender, which is how the driver learns the
/// connection is gone.
pub type DataSink = mpsc::UnboundedSender<Bytes>;
pub type DataStream = mpsc::UnboundedReceiver<Bytes>;

pub fn data_channel() -> (DataSink, DataStream) {
    mpsc::unbounded_channel()
}

/// A two-way byte transport to one instrument.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open the transport and start delivering reads into `sink`.
    async fn open(&mut self, sink: DataSink) -> DriverResult<()>;

    /// Write raw bytes toward the instrument.
    async fn send(&mut self, data: &[u8]) -> DriverResult<()>;

    /// Close the transport. Implementations drop their sink so the
    /// reader side unblocks.
    async fn close(&mut self) -> DriverResult<()>;
}

/// A configured transport, shared between the driver (which opens and
/// closes it) and the protocol engine (which writes commands).
pub type SharedConnection = Arc<Mutex<Box<dyn Connection>>>;

pub fn share(connection: Box<dyn Connection>) -> SharedConnection {
    Arc::new(Mutex::new(connection))
}
