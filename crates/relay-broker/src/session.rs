//! Per-connection session state and its outbound delivery queue.
//!
//! The queue is the only thing shared between a session's inbound path and
//! its outbound path. Producers (the broker, the adapter's acks) push with
//! [`Session::enqueue`], which never blocks. Exactly one [`drain`] loop per
//! session consumes it and writes to the transport.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::Identifier;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Consumer half of a session's outbound queue.
pub type OutboundReceiver = mpsc::Receiver<Bytes>;

/// A connected client as seen by the broker.
#[derive(Debug)]
pub struct Session {
    id: Identifier,
    created_at: DateTime<Utc>,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// Mutated only by the broker actor.
    channels: Mutex<HashSet<String>>,
}

impl Session {
    /// Create a session with an empty channel set and a bounded queue.
    pub fn new(id: Identifier, capacity: usize) -> (Arc<Self>, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            id,
            created_at: Utc::now(),
            outbound: Mutex::new(Some(tx)),
            channels: Mutex::new(HashSet::new()),
        });
        (session, rx)
    }

    pub fn id(&self) -> Identifier {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Try to queue a payload. Returns false when the queue is full or closed.
    pub fn enqueue(&self, payload: Bytes) -> bool {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.try_send(payload).is_ok(),
            None => false,
        }
    }

    /// Close the queue. Payloads already queued are still drained, after
    /// which the drainer sees end-of-stream. Returns true on the first call.
    pub fn close(&self) -> bool {
        self.outbound.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    /// Snapshot of the joined channels, sorted.
    pub fn joined_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.lock().iter().cloned().collect();
        channels.sort();
        channels
    }

    pub fn is_member(&self, channel: &str) -> bool {
        self.channels.lock().contains(channel)
    }

    pub(crate) fn add_channel(&self, channel: &str) -> bool {
        self.channels.lock().insert(channel.to_string())
    }

    pub(crate) fn remove_channel(&self, channel: &str) -> bool {
        self.channels.lock().remove(channel)
    }

    pub(crate) fn take_channels(&self) -> Vec<String> {
        self.channels.lock().drain().collect()
    }
}

/// Raised by a transport when a payload could not be written.
#[derive(Debug, thiserror::Error)]
#[error("transport write failed: {0}")]
pub struct TransportWriteError(pub String);

/// Write side of a session's transport.
#[async_trait]
pub trait OutboundSink: Send {
    async fn write(&mut self, payload: Bytes) -> Result<(), TransportWriteError>;

    /// Keepalive sent while the queue is idle.
    async fn heartbeat(&mut self) -> Result<(), TransportWriteError> {
        Ok(())
    }
}

/// Drain a session's queue into its transport, strictly FIFO and one payload
/// at a time. Returns the number of payloads written once the queue is closed
/// and empty, or the first write error.
pub async fn drain<S>(
    mut rx: OutboundReceiver,
    sink: &mut S,
    heartbeat: Option<Duration>,
) -> Result<usize, TransportWriteError>
where
    S: OutboundSink + ?Sized,
{
    let mut ticker = heartbeat.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut written = 0;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(payload) => {
                    sink.write(payload).await?;
                    written += 1;
                }
                None => return Ok(written),
            },
            _ = next_tick(&mut ticker) => sink.heartbeat().await?,
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
