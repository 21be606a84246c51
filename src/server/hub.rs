//! Session registry and broadcast fan-out
//!
//! The set of registered sessions lives inside [`Hub`] and is only touched by
//! [`Hub::run`]. Every other task talks to the hub through a cloneable
//! [`HubHandle`], so membership changes and fan-out are serialized without
//! any locking.

use crate::config::HubConfig;
use crate::server::session::SessionId;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub is not running")]
    Closed,
}

/// A registered session as the hub sees it
///
/// The hub holds the only sender of the session's outbound queue, so dropping
/// the handle closes that queue and stops the session's outbound pump.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub remote: String,
    tx: mpsc::Sender<Vec<u8>>,
}

impl SessionHandle {
    pub fn new(id: SessionId, remote: impl Into<String>, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            id,
            remote: remote.into(),
            tx,
        }
    }
}

/// A payload queued for fan-out
#[derive(Debug, Clone)]
pub struct Broadcast {
    /// Session the payload came from, if any
    pub origin: Option<SessionId>,
    pub payload: Vec<u8>,
}

/// Read-only requests answered from inside the control loop
#[derive(Debug)]
enum Query {
    SessionCount(oneshot::Sender<usize>),
}

/// One unit of work for the control loop
#[derive(Debug)]
enum HubEvent {
    Register(SessionHandle),
    Unregister(SessionId),
    Broadcast(Broadcast),
    Query(Query),
}

/// Cheap, cloneable way to reach a running [`Hub`]
///
/// Registrations, unregistrations and queries share one FIFO queue, so a
/// session's unregister can never overtake its register.
#[derive(Clone)]
pub struct HubHandle {
    control: mpsc::Sender<HubEvent>,
    broadcast: mpsc::Sender<Broadcast>,
    shutdown: CancellationToken,
}

impl HubHandle {
    /// Hand a new session to the hub
    pub async fn register(&self, session: SessionHandle) -> Result<(), HubError> {
        self.control
            .send(HubEvent::Register(session))
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Ask the hub to drop a session; unknown ids are ignored by the hub
    pub async fn unregister(&self, id: SessionId) -> Result<(), HubError> {
        self.control
            .send(HubEvent::Unregister(id))
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Queue a payload for every registered session
    ///
    /// Waits while the broadcast intake is full.
    pub async fn broadcast(&self, origin: Option<SessionId>, payload: Vec<u8>) -> Result<(), HubError> {
        self.broadcast
            .send(Broadcast { origin, payload })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Number of currently registered sessions
    pub async fn session_count(&self) -> Result<usize, HubError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(HubEvent::Query(Query::SessionCount(tx)))
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Stop the control loop; every outbound queue is closed on the way out
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// The broadcast hub
pub struct Hub {
    config: HubConfig,
    sessions: HashMap<SessionId, SessionHandle>,
    control_rx: mpsc::Receiver<HubEvent>,
    broadcast_rx: mpsc::Receiver<Broadcast>,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(config: &HubConfig) -> (Self, HubHandle) {
        let (control, control_rx) = mpsc::channel(config.control_buffer.max(1));
        let (broadcast, broadcast_rx) = mpsc::channel(config.broadcast_buffer.max(1));
        let shutdown = CancellationToken::new();

        let hub = Self {
            config: config.clone(),
            sessions: HashMap::new(),
            control_rx,
            broadcast_rx,
            shutdown: shutdown.clone(),
        };

        let handle = HubHandle {
            control,
            broadcast,
            shutdown,
        };

        (hub, handle)
    }

    /// Create a hub and run its control loop on a new task
    pub fn spawn(config: &HubConfig) -> HubHandle {
        let (hub, handle) = Self::new(config);
        tokio::spawn(hub.run());
        handle
    }

    /// Run the control loop until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!("Hub control loop started");

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.control_rx.recv() => event,
                msg = self.broadcast_rx.recv() => msg.map(HubEvent::Broadcast),
            };

            // Both senders live in HubHandle, so one closed intake means every handle is gone
            let Some(event) = event else { break };
            self.handle(event);
        }

        let remaining = self.sessions.len();
        self.sessions.clear();
        info!(closed_sessions = remaining, "Hub control loop stopped");
    }

    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register(session) => self.register(session),
            HubEvent::Unregister(id) => self.unregister(id),
            HubEvent::Broadcast(msg) => self.broadcast(msg),
            HubEvent::Query(Query::SessionCount(reply)) => {
                let _ = reply.send(self.sessions.len());
            }
        }
    }

    fn register(&mut self, session: SessionHandle) {
        if self.sessions.contains_key(&session.id) {
            debug!(session_id = %session.id, "Session already registered");
            return;
        }

        if let Some(max) = self.config.max_sessions {
            if self.sessions.len() >= max {
                // Dropping the handle closes the session's queue and tears it down
                warn!(
                    session_id = %session.id,
                    remote = %session.remote,
                    max_sessions = max,
                    "Session limit reached, rejecting session"
                );
                return;
            }
        }

        info!(
            session_id = %session.id,
            remote = %session.remote,
            sessions = self.sessions.len() + 1,
            "Session registered"
        );
        self.sessions.insert(session.id, session);
    }

    fn unregister(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.remove(&id) {
            info!(
                session_id = %id,
                remote = %session.remote,
                sessions = self.sessions.len(),
                "Session unregistered"
            );
        }
    }

    /// Fan a payload out to every session
    ///
    /// A session whose queue is full or closed is evicted on the spot rather
    /// than being allowed to hold up the others.
    fn broadcast(&mut self, msg: Broadcast) {
        let mut delivered = 0;
        let mut evicted = Vec::new();

        for (id, session) in &self.sessions {
            if !self.config.echo_to_sender && msg.origin == Some(*id) {
                continue;
            }

            match session.tx.try_send(msg.payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(session_id = %id, remote = %session.remote, "Outbound queue full, evicting slow consumer");
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session_id = %id, remote = %session.remote, "Outbound queue closed, evicting session");
                    evicted.push(*id);
                }
            }
        }

        for id in evicted {
            self.sessions.remove(&id);
        }

        debug!(
            bytes = msg.payload.len(),
            delivered,
            sessions = self.sessions.len(),
            "Broadcast fanned out"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn session(capacity: usize) -> (SessionHandle, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (SessionHandle::new(SessionId::new(), "127.0.0.1:9000", tx), rx)
    }

    fn registered(hub: &Hub) -> HashSet<SessionId> {
        hub.sessions.keys().copied().collect()
    }

    #[test]
    fn test_register_unregister_matches_set_model() {
        let (mut hub, _handle) = Hub::new(&HubConfig::default());
        let ids: Vec<SessionId> = (0..8).map(|_| SessionId::new()).collect();
        let mut model = HashSet::new();

        // Deterministic pseudo-random op sequence, duplicates included
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let id = ids[(seed >> 33) as usize % ids.len()];

            if (seed >> 20) & 1 == 0 {
                let (tx, _rx) = mpsc::channel(1);
                hub.handle(HubEvent::Register(SessionHandle::new(id, "peer", tx)));
                model.insert(id);
            } else {
                hub.handle(HubEvent::Unregister(id));
                model.remove(&id);
            }

            assert_eq!(registered(&hub), model);
        }
    }

    #[test]
    fn test_duplicate_register_keeps_one_entry() {
        let (mut hub, _handle) = Hub::new(&HubConfig::default());
        let (first, _rx) = session(4);
        let id = first.id;
        let (tx, _rx2) = mpsc::channel(4);

        hub.handle(HubEvent::Register(first));
        hub.handle(HubEvent::Register(SessionHandle::new(id, "other", tx)));

        assert_eq!(hub.sessions.len(), 1);
        assert_eq!(hub.sessions[&id].remote, "127.0.0.1:9000");
    }

    #[test]
    fn test_unregister_closes_outbound_queue() {
        let (mut hub, _handle) = Hub::new(&HubConfig::default());
        let (s, mut rx) = session(4);
        let id = s.id;

        hub.handle(HubEvent::Register(s));
        hub.handle(HubEvent::Unregister(id));
        hub.handle(HubEvent::Unregister(id));

        assert!(hub.sessions.is_empty());
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn test_broadcast_reaches_every_session_unmodified() {
        let (mut hub, _handle) = Hub::new(&HubConfig::default());
        let mut receivers = Vec::new();
        for _ in 0..5 {
            let (s, rx) = session(4);
            hub.handle(HubEvent::Register(s));
            receivers.push(rx);
        }

        hub.handle(HubEvent::Broadcast(Broadcast {
            origin: None,
            payload: b"hello world".to_vec(),
        }));

        for mut rx in receivers {
            assert_eq!(rx.try_recv().unwrap(), b"hello world".to_vec());
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_full_queue_evicts_only_slow_consumer() {
        let (mut hub, _handle) = Hub::new(&HubConfig::default());
        let (slow, mut slow_rx) = session(1);
        let slow_id = slow.id;
        hub.handle(HubEvent::Register(slow));

        let mut fast = Vec::new();
        for _ in 0..3 {
            let (s, rx) = session(8);
            hub.handle(HubEvent::Register(s));
            fast.push(rx);
        }

        hub.handle(HubEvent::Broadcast(Broadcast { origin: None, payload: b"one".to_vec() }));
        // Slow consumer's single slot is taken, so the second broadcast evicts it
        hub.handle(HubEvent::Broadcast(Broadcast { origin: None, payload: b"two".to_vec() }));
        assert!(!hub.sessions.contains_key(&slow_id));
        assert_eq!(hub.sessions.len(), 3);

        hub.handle(HubEvent::Broadcast(Broadcast { origin: None, payload: b"three".to_vec() }));

        // Buffered message drains, then the queue reports closed
        assert_eq!(slow_rx.try_recv().unwrap(), b"one".to_vec());
        assert!(matches!(slow_rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));

        for mut rx in fast {
            assert_eq!(rx.try_recv().unwrap(), b"one".to_vec());
            assert_eq!(rx.try_recv().unwrap(), b"two".to_vec());
            assert_eq!(rx.try_recv().unwrap(), b"three".to_vec());
        }
    }

    #[test]
    fn test_closed_receiver_is_evicted() {
        let (mut hub, _handle) = Hub::new(&HubConfig::default());
        let (gone, rx) = session(4);
        drop(rx);
        let (alive, mut alive_rx) = session(4);
        hub.handle(HubEvent::Register(gone));
        hub.handle(HubEvent::Register(alive));

        hub.handle(HubEvent::Broadcast(Broadcast { origin: None, payload: b"x".to_vec() }));
        assert_eq!(hub.sessions.len(), 1);
        assert_eq!(alive_rx.try_recv().unwrap(), b"x".to_vec());
    }

    #[test]
    fn test_sender_receives_own_broadcast_by_default() {
        let (mut hub, _handle) = Hub::new(&HubConfig::default());
        let (a, mut a_rx) = session(4);
        let a_id = a.id;
        hub.handle(HubEvent::Register(a));

        hub.handle(HubEvent::Broadcast(Broadcast { origin: Some(a_id), payload: b"me".to_vec() }));
        assert_eq!(a_rx.try_recv().unwrap(), b"me".to_vec());
    }

    #[test]
    fn test_echo_suppression() {
        let (mut hub, _handle) = Hub::new(&HubConfig::default().echo_to_sender(false));
        let (a, mut a_rx) = session(4);
        let (b, mut b_rx) = session(4);
        let a_id = a.id;
        hub.handle(HubEvent::Register(a));
        hub.handle(HubEvent::Register(b));

        hub.handle(HubEvent::Broadcast(Broadcast { origin: Some(a_id), payload: b"hi".to_vec() }));
        assert!(a_rx.try_recv().is_err());
        assert_eq!(b_rx.try_recv().unwrap(), b"hi".to_vec());
    }

    #[test]
    fn test_session_limit_rejects_extra_sessions() {
        let (mut hub, _handle) = Hub::new(&HubConfig::default().max_sessions(2));
        let (a, _a_rx) = session(4);
        let (b, _b_rx) = session(4);
        let (c, mut c_rx) = session(4);

        hub.handle(HubEvent::Register(a));
        hub.handle(HubEvent::Register(b));
        hub.handle(HubEvent::Register(c));

        assert_eq!(hub.sessions.len(), 2);
        assert!(matches!(c_rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[tokio::test]
    async fn test_handle_reports_closed_after_shutdown() {
        let (hub, handle) = Hub::new(&HubConfig::default());
        let task = tokio::spawn(hub.run());

        let (s, mut rx) = session(4);
        handle.register(s).await.unwrap();
        assert_eq!(handle.session_count().await.unwrap(), 1);

        handle.shutdown();
        task.await.unwrap();

        assert!(handle.is_shut_down());
        assert!(rx.recv().await.is_none());
        assert!(matches!(handle.session_count().await, Err(HubError::Closed)));
        assert!(handle.broadcast(None, b"late".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_unregister_never_overtakes_register() {
        let handle = Hub::spawn(&HubConfig::default());
        let (keep, _keep_rx) = session(4);
        handle.register(keep).await.unwrap();

        for _ in 0..200 {
            let (s, _rx) = session(4);
            let id = s.id;
            handle.register(s).await.unwrap();
            handle.unregister(id).await.unwrap();
            assert_eq!(handle.session_count().await.unwrap(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_unregister_leaves_no_zombies() {
        let handle = Hub::spawn(&HubConfig::default());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let (s, _rx) = session(4);
                    let id = s.id;
                    handle.register(s).await.unwrap();
                    handle.unregister(id).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(handle.session_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_loop_exits_when_handles_dropped() {
        let (hub, handle) = Hub::new(&HubConfig::default());
        let task = tokio::spawn(hub.run());

        drop(handle);

        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("hub loop should stop")
            .unwrap();
    }
}
