//! Client sessions: one inbound and one outbound pump per connected peer
//!
//! The inbound pump is the only reader of the connection and the outbound
//! pump the only writer. The two share a cancellation token that acts as the
//! connection's "closed" flag, so whichever pump fails first takes the other
//! one down with it.

use crate::config::HubConfig;
use crate::server::hub::{HubError, HubHandle, SessionHandle};
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique id of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a pump stopped
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("read failed: {0}")]
    Read(String),

    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),

    #[error("write failed: {0}")]
    Write(String),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Collapse newlines to spaces and trim surrounding whitespace
pub fn normalize(text: &str) -> String {
    text.replace('\n', " ").trim().to_string()
}

/// Join handles for a started session's pumps
pub struct SessionTasks {
    pub inbound: JoinHandle<Result<(), SessionError>>,
    pub outbound: JoinHandle<Result<(), SessionError>>,
}

/// One connected peer
#[derive(Clone)]
pub struct ClientSession {
    pub id: SessionId,
    pub remote: String,
    hub: HubHandle,
    config: Arc<HubConfig>,
    closed: CancellationToken,
}

impl ClientSession {
    pub fn new(remote: impl Into<String>, hub: HubHandle, config: Arc<HubConfig>) -> Self {
        Self {
            id: SessionId::new(),
            remote: remote.into(),
            hub,
            config,
            closed: CancellationToken::new(),
        }
    }

    /// Register with the hub and start both pumps
    ///
    /// If the hub is gone the connection halves are dropped and nothing is
    /// started.
    pub async fn start<W, R, E>(self, sink: W, stream: R) -> Result<SessionTasks, HubError>
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: fmt::Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.config.send_buffer.max(1));
        self.hub
            .register(SessionHandle::new(self.id, self.remote.clone(), tx))
            .await?;

        let writer = self.clone();
        let outbound = tokio::spawn(writer.write_pump(sink, rx));
        let inbound = tokio::spawn(self.read_pump(stream));

        Ok(SessionTasks { inbound, outbound })
    }

    /// Whether either pump has shut the connection
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Read frames until the connection fails, then unregister
    pub async fn read_pump<R, E>(self, mut stream: R) -> Result<(), SessionError>
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        let result = self.read_loop(&mut stream).await;

        match &result {
            Ok(()) => debug!(session_id = %self.id, "Inbound pump finished"),
            Err(e) => warn!(session_id = %self.id, remote = %self.remote, error = %e, "Inbound pump failed"),
        }

        info!(session_id = %self.id, remote = %self.remote, "Unregistering session");
        if self.hub.unregister(self.id).await.is_err() {
            debug!(session_id = %self.id, "Hub already stopped");
        }
        self.closed.cancel();

        result
    }

    async fn read_loop<R, E>(&self, stream: &mut R) -> Result<(), SessionError>
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        let pong_wait = self.config.pong_wait;
        let limit = self.config.max_message_size;

        loop {
            // Every iteration arms a fresh deadline, so any frame refreshes it
            let next = tokio::select! {
                _ = self.closed.cancelled() => return Ok(()),
                next = timeout(pong_wait, stream.next()) => next,
            };

            let msg = match next {
                Err(_) => return Err(SessionError::ReadTimeout(pong_wait)),
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(SessionError::Read(e.to_string())),
                Ok(Some(Ok(msg))) => msg,
            };

            let text = match msg {
                Message::Text(text) => {
                    check_size(text.len(), limit)?;
                    normalize(text.as_str())
                }
                Message::Binary(data) => {
                    check_size(data.len(), limit)?;
                    normalize(&String::from_utf8_lossy(&data))
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(frame) => {
                    debug!(session_id = %self.id, ?frame, "Peer closed connection");
                    return Ok(());
                }
            };

            debug!(session_id = %self.id, bytes = text.len(), "Received message");
            self.hub.broadcast(Some(self.id), text.into_bytes()).await?;
        }
    }

    /// Drain the outbound queue onto the wire, interleaved with heartbeats
    pub async fn write_pump<W>(self, mut sink: W, mut rx: mpsc::Receiver<Vec<u8>>) -> Result<(), SessionError>
    where
        W: Sink<Message> + Unpin,
        W::Error: fmt::Display,
    {
        let result = self.write_loop(&mut sink, &mut rx).await;

        match &result {
            Ok(()) => debug!(session_id = %self.id, "Outbound pump finished"),
            Err(e) => warn!(session_id = %self.id, remote = %self.remote, error = %e, "Outbound pump failed"),
        }

        self.closed.cancel();
        drop(rx);
        // Closing twice is fine; whatever error comes back is not interesting
        let _ = timeout(self.config.write_wait, sink.close()).await;

        result
    }

    async fn write_loop<W>(&self, sink: &mut W, rx: &mut mpsc::Receiver<Vec<u8>>) -> Result<(), SessionError>
    where
        W: Sink<Message> + Unpin,
        W::Error: fmt::Display,
    {
        let period = self.config.ping_period();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return Ok(()),
                msg = rx.recv() => match msg {
                    Some(payload) => {
                        let size = payload.len();
                        let text = String::from_utf8_lossy(&payload).into_owned();
                        self.write(sink, Message::Text(text.into())).await?;
                        debug!(session_id = %self.id, bytes = size, "Wrote message");
                    }
                    None => {
                        debug!(session_id = %self.id, "Outbound queue closed by hub");
                        if let Err(e) = self.write(sink, Message::Close(None)).await {
                            debug!(session_id = %self.id, error = %e, "Close frame not delivered");
                        }
                        return Ok(());
                    }
                },
                _ = ticker.tick() => {
                    self.write(sink, Message::Ping("Ping".into())).await?;
                    self.write(sink, Message::Text(".".into())).await?;
                    debug!(session_id = %self.id, "Sent heartbeat");
                }
            }
        }
    }

    async fn write<W>(&self, sink: &mut W, msg: Message) -> Result<(), SessionError>
    where
        W: Sink<Message> + Unpin,
        W::Error: fmt::Display,
    {
        match timeout(self.config.write_wait, sink.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::Write(e.to_string())),
            Err(_) => Err(SessionError::WriteTimeout(self.config.write_wait)),
        }
    }
}

fn check_size(size: usize, limit: usize) -> Result<(), SessionError> {
    if size > limit {
        return Err(SessionError::MessageTooLarge { size, limit });
    }
    Ok(())
}
