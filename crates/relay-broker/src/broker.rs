//! Channel membership actor.
//!
//! A single task owns the `channel -> members` map and the session registry.
//! Every operation travels through one bounded mailbox and is applied to
//! completion before the next one starts, so a session is in a channel's
//! member set exactly when that channel is in the session's joined set.
//!
//! Broadcast fan-out never waits on a receiver: a member whose queue is full
//! is evicted from the channel and its queue is closed. A session with a
//! closed queue stays registered until the adapter unregisters it, but can
//! no longer join channels or publish.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use relay_core::{Envelope, Identifier};
use relay_telemetry::MetricsRecorder;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::BrokerError;
use crate::session::Session;

pub const SESSIONS_REGISTERED_TOTAL: &str = "relay_sessions_registered_total";
pub const SESSIONS_ACTIVE: &str = "relay_sessions_active";
pub const BROADCASTS_TOTAL: &str = "relay_broadcasts_total";
pub const DELIVERIES_TOTAL: &str = "relay_deliveries_total";
pub const EVICTIONS_TOTAL: &str = "relay_evictions_total";
pub const SERIALIZATION_ERRORS_TOTAL: &str = "relay_serialization_errors_total";

/// Broker configuration.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Requests buffered before callers start waiting on the mailbox.
    pub mailbox_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1024,
        }
    }
}

/// Outcome of one broadcast.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: Vec<Identifier>,
}

/// Point-in-time view of broker state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub sessions: usize,
    pub channels: usize,
    pub memberships: usize,
}

enum Request {
    Register {
        session: Arc<Session>,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        id: Identifier,
        reply: oneshot::Sender<bool>,
    },
    Join {
        id: Identifier,
        channel: String,
        reply: oneshot::Sender<bool>,
    },
    Leave {
        id: Identifier,
        channel: String,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        origin: Option<Identifier>,
        envelope: Envelope,
        reply: oneshot::Sender<Result<BroadcastReport, BrokerError>>,
    },
    Members {
        channel: String,
        reply: oneshot::Sender<Vec<Identifier>>,
    },
    Stats {
        reply: oneshot::Sender<BrokerStats>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// Actor state. Only ever touched by the task started in [`Broker::spawn`].
pub struct Broker {
    sessions: HashMap<Identifier, Arc<Session>>,
    channels: HashMap<String, HashMap<Identifier, Arc<Session>>>,
    metrics: Arc<MetricsRecorder>,
}

impl Broker {
    fn new(metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            sessions: HashMap::new(),
            channels: HashMap::new(),
            metrics,
        }
    }

    /// Start the actor. The task exits after [`BrokerHandle::shutdown`] or
    /// once every handle is dropped, closing all remaining session queues.
    pub fn spawn(
        config: BrokerConfig,
        metrics: Arc<MetricsRecorder>,
    ) -> (BrokerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let task = tokio::spawn(Broker::new(metrics).run(rx));
        (BrokerHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        tracing::info!("Broker started");
        while let Some(request) = rx.recv().await {
            match request {
                Request::Register { session, reply } => {
                    let _ = reply.send(self.register(session));
                }
                Request::Unregister { id, reply } => {
                    let _ = reply.send(self.unregister(id));
                }
                Request::Join { id, channel, reply } => {
                    let _ = reply.send(self.join(id, channel));
                }
                Request::Leave { id, channel, reply } => {
                    let _ = reply.send(self.leave(id, &channel));
                }
                Request::Broadcast {
                    origin,
                    envelope,
                    reply,
                } => {
                    let _ = reply.send(self.broadcast(origin, &envelope));
                }
                Request::Members { channel, reply } => {
                    let _ = reply.send(self.members(&channel));
                }
                Request::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                Request::Shutdown { reply } => {
                    let closed = self.close_all();
                    tracing::info!(closed, "Broker shutting down");
                    let _ = reply.send(closed);
                    break;
                }
            }
        }
        self.close_all();
        tracing::info!("Broker stopped");
    }

    fn register(&mut self, session: Arc<Session>) -> bool {
        let id = session.id();
        if session.is_closed() {
            tracing::debug!(session_id = %id, "Ignoring register for closed session");
            return false;
        }
        match self.sessions.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                self.metrics.increment_counter(SESSIONS_REGISTERED_TOTAL, 1);
                self.metrics.add_gauge(SESSIONS_ACTIVE, 1);
                tracing::info!(session_id = %id, "Session registered");
                true
            }
        }
    }

    fn unregister(&mut self, id: Identifier) -> bool {
        let Some(session) = self.sessions.remove(&id) else {
            tracing::debug!(session_id = %id, "Unregister for unknown session");
            return false;
        };
        for channel in session.take_channels() {
            self.detach(&channel, id);
        }
        session.close();
        self.metrics.add_gauge(SESSIONS_ACTIVE, -1);
        tracing::info!(session_id = %id, "Session unregistered");
        true
    }

    fn join(&mut self, id: Identifier, channel: String) -> bool {
        let Some(session) = self.sessions.get(&id) else {
            tracing::debug!(session_id = %id, channel = %channel, "Join from unregistered session");
            return false;
        };
        if session.is_closed() {
            tracing::debug!(session_id = %id, channel = %channel, "Join from closed session");
            return false;
        }
        let members = self.channels.entry(channel.clone()).or_default();
        if members.contains_key(&id) {
            return false;
        }
        members.insert(id, Arc::clone(session));
        session.add_channel(&channel);
        tracing::info!(session_id = %id, channel = %channel, "Joined channel");
        true
    }

    fn leave(&mut self, id: Identifier, channel: &str) -> bool {
        let Some(session) = self.sessions.get(&id).cloned() else {
            tracing::debug!(session_id = %id, channel, "Leave from unregistered session");
            return false;
        };
        if !self.detach(channel, id) {
            return false;
        }
        session.remove_channel(channel);
        tracing::info!(session_id = %id, channel, "Left channel");
        true
    }

    /// Remove `id` from a channel's member set, pruning the channel when it
    /// empties. Leaves the session's own channel set alone.
    fn detach(&mut self, channel: &str, id: Identifier) -> bool {
        let Some(members) = self.channels.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(&id).is_some();
        if members.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    fn broadcast(
        &mut self,
        origin: Option<Identifier>,
        envelope: &Envelope,
    ) -> Result<BroadcastReport, BrokerError> {
        let channel = envelope.require_channel()?;
        if let Some(id) = origin {
            let open = self.sessions.get(&id).is_some_and(|s| !s.is_closed());
            if !open {
                tracing::debug!(session_id = %id, channel, "Broadcast from closed or unknown session");
                return Ok(BroadcastReport::default());
            }
        }
        let payload = match envelope.encode() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                self.metrics.increment_counter(SERIALIZATION_ERRORS_TOTAL, 1);
                tracing::error!(channel, error = %e, "Dropping broadcast");
                return Err(e.into());
            }
        };
        self.metrics.increment_counter(BROADCASTS_TOTAL, 1);
        Ok(self.fan_out(channel, payload))
    }

    fn fan_out(&mut self, channel: &str, payload: Bytes) -> BroadcastReport {
        let members: Vec<Arc<Session>> = match self.channels.get(channel) {
            Some(members) => members.values().cloned().collect(),
            None => return BroadcastReport::default(),
        };

        let mut report = BroadcastReport::default();
        let mut slow = Vec::new();
        let mut stale = Vec::new();
        for session in members {
            if session.enqueue(payload.clone()) {
                report.delivered += 1;
            } else if session.is_closed() {
                stale.push(session);
            } else {
                slow.push(session);
            }
        }

        for session in slow {
            self.evict(channel, &session);
            report.evicted.push(session.id());
        }
        // Already closed elsewhere; drop the membership without counting it.
        for session in stale {
            self.detach(channel, session.id());
            session.remove_channel(channel);
            tracing::debug!(session_id = %session.id(), channel, "Dropped closed member");
        }

        self.metrics
            .increment_counter(DELIVERIES_TOTAL, report.delivered as u64);
        report
    }

    fn evict(&mut self, channel: &str, session: &Session) {
        self.detach(channel, session.id());
        session.remove_channel(channel);
        session.close();
        self.metrics.increment_counter(EVICTIONS_TOTAL, 1);
        tracing::warn!(
            session_id = %session.id(),
            channel,
            "Send queue full, evicted slow consumer"
        );
    }

    fn members(&self, channel: &str) -> Vec<Identifier> {
        let mut ids: Vec<Identifier> = self
            .channels
            .get(channel)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn stats(&self) -> BrokerStats {
        BrokerStats {
            sessions: self.sessions.len(),
            channels: self.channels.len(),
            memberships: self.channels.values().map(HashMap::len).sum(),
        }
    }

    fn close_all(&mut self) -> usize {
        let closed = self.sessions.len();
        for (_, session) in self.sessions.drain() {
            session.take_channels();
            session.close();
        }
        self.channels.clear();
        self.metrics.set_gauge(SESSIONS_ACTIVE, 0);
        closed
    }
}

/// Cloneable entry point to the broker actor.
#[derive(Clone, Debug)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Request>,
}

impl BrokerHandle {
    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(request(reply))
            .await
            .map_err(|_| BrokerError::Stopped)?;
        rx.await.map_err(|_| BrokerError::Stopped)
    }

    /// Record a session. Returns false if it was already registered or its
    /// queue is closed.
    pub async fn register(&self, session: Arc<Session>) -> Result<bool, BrokerError> {
        self.call(|reply| Request::Register { session, reply }).await
    }

    /// Remove a session from every channel and close its queue. Repeated
    /// calls are no-ops returning false.
    pub async fn unregister(&self, session: &Session) -> Result<bool, BrokerError> {
        let id = session.id();
        self.call(|reply| Request::Unregister { id, reply }).await
    }

    pub async fn join(
        &self,
        session: &Session,
        channel: impl Into<String>,
    ) -> Result<bool, BrokerError> {
        let id = session.id();
        let channel = channel.into();
        self.call(|reply| Request::Join { id, channel, reply }).await
    }

    pub async fn leave(
        &self,
        session: &Session,
        channel: impl Into<String>,
    ) -> Result<bool, BrokerError> {
        let id = session.id();
        let channel = channel.into();
        self.call(|reply| Request::Leave { id, channel, reply }).await
    }

    /// Fan an envelope out to its channel as-is.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<BroadcastReport, BrokerError> {
        self.call(|reply| Request::Broadcast {
            origin: None,
            envelope,
            reply,
        })
        .await?
    }

    /// Fan out a client message, replacing its sender with the session's.
    /// A no-op once the session is unregistered or its queue is closed.
    pub async fn broadcast_from(
        &self,
        session: &Session,
        mut envelope: Envelope,
    ) -> Result<BroadcastReport, BrokerError> {
        let origin = Some(session.id());
        envelope.stamp_sender(session.id());
        self.call(|reply| Request::Broadcast {
            origin,
            envelope,
            reply,
        })
        .await?
    }

    /// Current members of a channel, sorted.
    pub async fn members(&self, channel: impl Into<String>) -> Result<Vec<Identifier>, BrokerError> {
        let channel = channel.into();
        self.call(|reply| Request::Members { channel, reply }).await
    }

    pub async fn stats(&self) -> Result<BrokerStats, BrokerError> {
        self.call(|reply| Request::Stats { reply }).await
    }

    /// Stop the actor after every request queued ahead of this one. Returns
    /// the number of sessions whose queues were closed.
    pub async fn shutdown(&self) -> Result<usize, BrokerError> {
        self.call(|reply| Request::Shutdown { reply }).await
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OutboundReceiver;
    use relay_core::MessageType;

    fn new_session(raw: u64, capacity: usize) -> (Arc<Session>, OutboundReceiver) {
        Session::new(Identifier::from_raw(raw), capacity)
    }

    fn spawn() -> (BrokerHandle, Arc<MetricsRecorder>) {
        let metrics = Arc::new(MetricsRecorder::new());
        let (handle, _task) = Broker::spawn(BrokerConfig::default(), Arc::clone(&metrics));
        (handle, metrics)
    }

    fn assert_consistent(broker: &Broker) {
        for (channel, members) in &broker.channels {
            assert!(!members.is_empty(), "empty channel {channel} kept");
            for session in members.values() {
                assert!(session.is_member(channel));
            }
        }
        for session in broker.sessions.values() {
            for channel in session.joined_channels() {
                let members = broker.channels.get(&channel).expect("joined channel missing");
                assert!(members.contains_key(&session.id()));
            }
        }
    }

    fn decode(payload: Bytes) -> Envelope {
        Envelope::decode(std::str::from_utf8(&payload).unwrap()).unwrap()
    }

    #[test]
    fn membership_stays_consistent_across_operations() {
        let mut broker = Broker::new(Arc::new(MetricsRecorder::new()));
        let sessions: Vec<_> = (1..=5).map(|i| new_session(i, 8)).collect();
        for (s, _) in &sessions {
            broker.register(Arc::clone(s));
        }

        let channels = ["a", "b", "c"];
        // Deterministic walk over join/leave/unregister.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let id = Identifier::from_raw(seed % 5 + 1);
            let channel = channels[(seed >> 8) as usize % channels.len()];
            match (seed >> 16) % 10 {
                0..=4 => {
                    broker.join(id, channel.to_string());
                }
                5..=8 => {
                    broker.leave(id, channel);
                }
                _ => {
                    broker.unregister(id);
                }
            }
            assert_consistent(&broker);
        }
    }

    #[test]
    fn leave_unknown_channel_is_noop() {
        let mut broker = Broker::new(Arc::new(MetricsRecorder::new()));
        let (s, _rx) = new_session(1, 4);
        broker.register(Arc::clone(&s));
        broker.join(s.id(), "general".into());

        assert!(!broker.leave(s.id(), "nochan"));
        assert_eq!(s.joined_channels(), vec!["general".to_string()]);
        assert_eq!(broker.members("general"), vec![s.id()]);
        assert_consistent(&broker);
    }

    #[test]
    fn join_is_idempotent() {
        let mut broker = Broker::new(Arc::new(MetricsRecorder::new()));
        let (s, _rx) = new_session(1, 4);
        broker.register(Arc::clone(&s));

        assert!(broker.join(s.id(), "general".into()));
        assert!(!broker.join(s.id(), "general".into()));
        assert_eq!(broker.stats().memberships, 1);
    }

    #[test]
    fn empty_channels_are_pruned() {
        let mut broker = Broker::new(Arc::new(MetricsRecorder::new()));
        let (s, _rx) = new_session(1, 4);
        broker.register(Arc::clone(&s));
        broker.join(s.id(), "general".into());
        assert_eq!(broker.stats().channels, 1);

        broker.leave(s.id(), "general");
        assert_eq!(broker.stats().channels, 0);
        assert!(broker.members("general").is_empty());
    }

    #[test]
    fn closed_session_cannot_register() {
        let mut broker = Broker::new(Arc::new(MetricsRecorder::new()));
        let (s, _rx) = new_session(1, 4);
        s.close();
        assert!(!broker.register(s));
        assert_eq!(broker.stats().sessions, 0);
    }

    #[tokio::test]
    async fn broadcast_fans_out_to_every_member() {
        let (broker, metrics) = spawn();
        let mut receivers = Vec::new();
        let mut sessions = Vec::new();
        for i in 1..=3 {
            let (s, rx) = new_session(i, 8);
            broker.register(Arc::clone(&s)).await.unwrap();
            broker.join(&s, "general").await.unwrap();
            sessions.push(s);
            receivers.push(rx);
        }
        let (outsider, mut outsider_rx) = new_session(99, 8);
        broker.register(Arc::clone(&outsider)).await.unwrap();

        let mut envelope = Envelope::message("general", "hi");
        envelope.sender = "forged".into();
        let report = broker.broadcast_from(&sessions[0], envelope).await.unwrap();
        assert_eq!(report.delivered, 3);
        assert!(report.evicted.is_empty());

        for rx in &mut receivers {
            let got = decode(rx.try_recv().unwrap());
            assert_eq!(got.kind, MessageType::Message);
            assert_eq!(got.channel_name(), Some("general"));
            assert_eq!(got.content, "hi");
            assert_eq!(got.sender, "user1");
            assert!(rx.try_recv().is_err(), "exactly one payload expected");
        }
        assert!(outsider_rx.try_recv().is_err());
        assert_eq!(metrics.counter(BROADCASTS_TOTAL), 1);
        assert_eq!(metrics.counter(DELIVERIES_TOTAL), 3);
    }

    #[tokio::test]
    async fn full_queue_is_evicted_without_affecting_others() {
        let (broker, metrics) = spawn();
        let mut receivers = Vec::new();
        for i in 1..=3 {
            let (s, rx) = new_session(i, 8);
            broker.register(Arc::clone(&s)).await.unwrap();
            broker.join(&s, "general").await.unwrap();
            receivers.push(rx);
        }
        let (slow, mut slow_rx) = new_session(4, 1);
        broker.register(Arc::clone(&slow)).await.unwrap();
        broker.join(&slow, "general").await.unwrap();
        broker.join(&slow, "other").await.unwrap();
        assert!(slow.enqueue(Bytes::from_static(b"backlog")));

        let report = broker
            .broadcast(Envelope::message("general", "hi"))
            .await
            .unwrap();
        assert_eq!(report.delivered, 3);
        assert_eq!(report.evicted, vec![slow.id()]);

        assert_eq!(
            broker.members("general").await.unwrap(),
            vec![
                Identifier::from_raw(1),
                Identifier::from_raw(2),
                Identifier::from_raw(3)
            ]
        );
        assert!(!slow.is_member("general"));
        assert!(slow.is_closed());
        assert_eq!(metrics.counter(EVICTIONS_TOTAL), 1);

        // Drainer sees the backlog, then end-of-stream.
        assert_eq!(slow_rx.recv().await.unwrap(), Bytes::from_static(b"backlog"));
        assert!(slow_rx.recv().await.is_none());

        for rx in &mut receivers {
            assert_eq!(decode(rx.try_recv().unwrap()).content, "hi");
        }

        // The adapter's follow-up unregister cleans the remaining membership.
        assert!(broker.unregister(&slow).await.unwrap());
        assert!(broker.members("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn evicted_session_cannot_join_or_publish() {
        let (broker, metrics) = spawn();
        let (peer, mut peer_rx) = new_session(5, 8);
        broker.register(Arc::clone(&peer)).await.unwrap();
        broker.join(&peer, "general").await.unwrap();
        broker.join(&peer, "other").await.unwrap();

        let (slow, _slow_rx) = new_session(4, 1);
        broker.register(Arc::clone(&slow)).await.unwrap();
        broker.join(&slow, "general").await.unwrap();
        broker.join(&slow, "news").await.unwrap();
        assert!(slow.enqueue(Bytes::from_static(b"backlog")));

        let report = broker
            .broadcast(Envelope::message("general", "hi"))
            .await
            .unwrap();
        assert_eq!(report.evicted, vec![slow.id()]);
        assert_eq!(decode(peer_rx.try_recv().unwrap()).content, "hi");

        assert!(!broker.join(&slow, "other").await.unwrap());
        assert_eq!(broker.members("other").await.unwrap(), vec![peer.id()]);
        assert!(!slow.is_member("other"));

        let report = broker
            .broadcast_from(&slow, Envelope::message("other", "from evicted"))
            .await
            .unwrap();
        assert_eq!(report, BroadcastReport::default());
        assert!(peer_rx.try_recv().is_err());

        // A later broadcast to another of its channels drops it without
        // counting a second eviction.
        let report = broker
            .broadcast(Envelope::message("news", "update"))
            .await
            .unwrap();
        assert_eq!(report, BroadcastReport::default());
        assert!(broker.members("news").await.unwrap().is_empty());
        assert!(slow.joined_channels().is_empty());
        assert_eq!(metrics.counter(EVICTIONS_TOTAL), 1);
        assert_eq!(broker.stats().await.unwrap().sessions, 2);
    }

    #[tokio::test]
    async fn broadcast_from_unregistered_session_is_noop() {
        let (broker, _metrics) = spawn();
        let (s, _rx) = new_session(1, 4);
        let (peer, mut peer_rx) = new_session(2, 4);
        broker.register(Arc::clone(&s)).await.unwrap();
        broker.register(Arc::clone(&peer)).await.unwrap();
        broker.join(&peer, "general").await.unwrap();
        broker.unregister(&s).await.unwrap();

        let report = broker
            .broadcast_from(&s, Envelope::message("general", "late"))
            .await
            .unwrap();
        assert_eq!(report.delivered, 0);
        assert!(peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_twice_matches_once() {
        let (broker, metrics) = spawn();
        let (s, _rx) = new_session(1, 4);
        let (other, _orx) = new_session(2, 4);
        broker.register(Arc::clone(&s)).await.unwrap();
        broker.register(Arc::clone(&other)).await.unwrap();
        broker.join(&s, "a").await.unwrap();
        broker.join(&s, "b").await.unwrap();
        broker.join(&other, "a").await.unwrap();

        assert!(broker.unregister(&s).await.unwrap());
        let once = broker.stats().await.unwrap();
        assert!(!broker.unregister(&s).await.unwrap());
        let twice = broker.stats().await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(
            twice,
            BrokerStats {
                sessions: 1,
                channels: 1,
                memberships: 1
            }
        );
        assert!(s.is_closed());
        assert!(s.joined_channels().is_empty());
        assert_eq!(metrics.gauge(SESSIONS_ACTIVE), 1);
    }

    #[tokio::test]
    async fn operations_after_unregister_are_noops() {
        let (broker, _metrics) = spawn();
        let (s, _rx) = new_session(1, 4);
        broker.register(Arc::clone(&s)).await.unwrap();
        broker.unregister(&s).await.unwrap();

        assert!(!broker.join(&s, "general").await.unwrap());
        assert!(!broker.leave(&s, "general").await.unwrap());
        assert!(!broker.register(Arc::clone(&s)).await.unwrap());
        assert!(broker.members("general").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadcast_without_channel_is_rejected() {
        let (broker, metrics) = spawn();
        let err = broker.broadcast(Envelope::ack("x")).await.unwrap_err();
        assert_eq!(err.error_kind(), "missing_channel");
        assert_eq!(metrics.counter(BROADCASTS_TOTAL), 0);

        // The actor keeps serving after a failed broadcast.
        assert_eq!(broker.stats().await.unwrap(), BrokerStats::default());
    }

    #[tokio::test]
    async fn broadcast_to_empty_channel_delivers_nothing() {
        let (broker, _metrics) = spawn();
        let report = broker
            .broadcast(Envelope::message("nobody", "hello?"))
            .await
            .unwrap();
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn per_channel_order_is_preserved() {
        let (broker, _metrics) = spawn();
        let (s, mut rx) = new_session(1, 64);
        broker.register(Arc::clone(&s)).await.unwrap();
        broker.join(&s, "ordered").await.unwrap();

        for i in 0..20 {
            broker
                .broadcast(Envelope::message("ordered", i.to_string()))
                .await
                .unwrap();
        }
        for i in 0..20 {
            assert_eq!(decode(rx.recv().await.unwrap()).content, i.to_string());
        }
    }

    #[tokio::test]
    async fn shutdown_closes_all_sessions_and_stops() {
        let (broker, _metrics) = spawn();
        let (a, mut a_rx) = new_session(1, 4);
        let (b, _b_rx) = new_session(2, 4);
        broker.register(Arc::clone(&a)).await.unwrap();
        broker.register(Arc::clone(&b)).await.unwrap();
        broker.join(&a, "general").await.unwrap();
        broker.broadcast(Envelope::message("general", "last")).await.unwrap();

        assert_eq!(broker.shutdown().await.unwrap(), 2);
        assert!(a.is_closed());
        assert!(b.is_closed());

        // In-flight fan-out completed before the stop.
        assert_eq!(decode(a_rx.recv().await.unwrap()).content, "last");
        assert!(a_rx.recv().await.is_none());

        assert!(matches!(broker.stats().await, Err(BrokerError::Stopped)));
        assert!(!broker.is_running());
    }
}
