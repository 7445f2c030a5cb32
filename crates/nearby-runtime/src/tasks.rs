//! Per-session tasks
//!
//! Every session runs its transport I/O on its own tokio task. A task owns its
//! [`Transport`] outright and closes it exactly once on every exit path; it
//! never touches engine state and reports progress back to the engine worker
//! through an unbounded channel instead.
//!
//! - Initiator: connect, send `Hello`, verify the `Echo`, then run the session
//! - Responder: wait for `Hello`, ask the worker to accept, answer `Echo`, then
//!   run the session
//!
//! The responder takes the `Hello` token at its word; it is not checked against
//! the device that connected. Sessions are unauthenticated.

use std::sync::Arc;

use nearby_core::protocol::{generate_nonce, verify_echo, Frame, Nonce, HANDSHAKE_VERSION};
use nearby_core::{
    Connector, DeviceHandle, IdentityToken, PeerId, SessionConfig, SessionError, Timestamp,
    Transport, TransportError,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// Commands from the worker to a session task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Send { payload: Vec<u8>, timestamp: Timestamp },
    Close,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed from our side (explicit close or eviction)
    Local,
    /// The remote sent `Goodbye`
    Remote,
    /// The link dropped without a `Goodbye`
    Disconnected,
    /// Transport or framing error
    Error,
    /// Engine shutdown
    Shutdown,
}

/// Progress of one session, tagged by the worker with peer and generation
#[derive(Debug)]
pub enum SessionProgress {
    /// Transport connected, handshake under way
    Connected,
    /// Handshake confirmed
    Established,
    ConnectFailed(TransportError),
    HandshakeFailed(SessionError),
    Message { payload: Vec<u8>, timestamp: Timestamp },
    Closed(CloseReason),
}

/// Permission for a responder task to run a session
#[derive(Debug)]
pub struct InboundGrant {
    pub peer_id: PeerId,
    pub generation: u64,
    /// Token to prove ownership of in the echo
    pub local_token: IdentityToken,
    pub commands: mpsc::Receiver<SessionCommand>,
}

/// Reports from session tasks to the engine worker
#[derive(Debug)]
pub enum SessionReport {
    Progress {
        peer_id: PeerId,
        generation: u64,
        progress: SessionProgress,
    },
    /// A responder received `Hello` and needs the worker's decision
    InboundHello {
        token: IdentityToken,
        reply: oneshot::Sender<Result<InboundGrant, SessionError>>,
    },
}

// ----------------------------------------------------------------------------
// Task Context
// ----------------------------------------------------------------------------

/// Everything a session task needs besides its transport
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub reports: mpsc::UnboundedSender<SessionReport>,
    pub shutdown: watch::Receiver<bool>,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_payload_size: usize,
}

impl TaskContext {
    pub fn new(
        config: &SessionConfig,
        reports: mpsc::UnboundedSender<SessionReport>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reports,
            shutdown,
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            max_payload_size: config.max_payload_size,
        }
    }

    async fn shutting_down(&mut self) {
        // A dropped sender also means the engine is gone
        let _ = self.shutdown.wait_for(|stop| *stop).await;
    }
}

/// A task's identity towards the worker
pub(crate) struct SessionLink {
    context: TaskContext,
    peer_id: PeerId,
    generation: u64,
}

impl SessionLink {
    pub fn new(context: TaskContext, peer_id: PeerId, generation: u64) -> Self {
        Self {
            context,
            peer_id,
            generation,
        }
    }

    fn report(&self, progress: SessionProgress) {
        let report = SessionReport::Progress {
            peer_id: self.peer_id,
            generation: self.generation,
            progress,
        };
        if self.context.reports.send(report).is_err() {
            trace!("Engine gone, dropping report for {}", self.peer_id);
        }
    }

    /// Resolves when the session must end before it became active
    async fn interrupted(&mut self, commands: &mut mpsc::Receiver<SessionCommand>) -> CloseReason {
        loop {
            tokio::select! {
                _ = self.context.shutting_down() => return CloseReason::Shutdown,
                command = commands.recv() => match command {
                    Some(SessionCommand::Close) | None => return CloseReason::Local,
                    Some(SessionCommand::Send { .. }) => {
                        debug!("Dropping send to {} before the session is active", self.peer_id);
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Initiator
// ----------------------------------------------------------------------------

/// Connect to `device` and prove that it owns `remote_token`
pub(crate) async fn run_initiator(
    mut link: SessionLink,
    mut commands: mpsc::Receiver<SessionCommand>,
    connector: Arc<dyn Connector>,
    device: DeviceHandle,
    remote_token: IdentityToken,
    local_token: IdentityToken,
) {
    let connect_timeout = link.context.connect_timeout;
    let connected = tokio::select! {
        result = timeout(connect_timeout, connector.connect(&device)) => result,
        reason = link.interrupted(&mut commands) => {
            link.report(SessionProgress::Closed(reason));
            return;
        }
    };

    let mut transport = match connected {
        Ok(Ok(transport)) => transport,
        Ok(Err(err)) => {
            debug!("Connect to {} failed: {}", device, err);
            link.report(SessionProgress::ConnectFailed(err));
            return;
        }
        Err(_) => {
            debug!("Connect to {} timed out", device);
            link.report(SessionProgress::ConnectFailed(TransportError::Timeout {
                duration_ms: connect_timeout.as_millis() as u64,
            }));
            return;
        }
    };
    link.report(SessionProgress::Connected);

    let nonce = generate_nonce();
    let handshake_timeout = link.context.handshake_timeout;
    let peer_id = link.peer_id;
    let handshake = tokio::select! {
        result = timeout(
            handshake_timeout,
            initiate(transport.as_mut(), peer_id, nonce, local_token, remote_token),
        ) => result.unwrap_or_else(|_| Err(SessionError::HandshakeFailed {
            peer_id,
            reason: format!("no echo within {}ms", handshake_timeout.as_millis()),
        })),
        reason = link.interrupted(&mut commands) => {
            transport.close().await;
            link.report(SessionProgress::Closed(reason));
            return;
        }
    };

    if let Err(err) = handshake {
        debug!("{}", err);
        transport.close().await;
        link.report(SessionProgress::HandshakeFailed(err));
        return;
    }

    link.report(SessionProgress::Established);
    run_active(link, commands, transport).await;
}

async fn initiate(
    transport: &mut dyn Transport,
    peer_id: PeerId,
    nonce: Nonce,
    local_token: IdentityToken,
    remote_token: IdentityToken,
) -> Result<(), SessionError> {
    let hello = Frame::Hello {
        version: HANDSHAKE_VERSION,
        nonce,
        token: local_token,
    };
    let bytes = hello
        .to_bytes()
        .map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
    transport.send(&bytes).await?;

    let reply = transport.recv().await?.ok_or(TransportError::Closed)?;
    let echo = Frame::from_bytes(&reply)?;
    if !verify_echo(&echo, &nonce, &remote_token) {
        return Err(SessionError::HandshakeFailed {
            peer_id,
            reason: format!("unexpected {} in reply to hello", echo.kind()),
        });
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Responder
// ----------------------------------------------------------------------------

/// Drive an incoming transport until the worker accepts or rejects it
pub(crate) async fn run_responder(mut context: TaskContext, mut transport: Box<dyn Transport>) {
    let handshake_timeout = context.handshake_timeout;
    let hello = tokio::select! {
        result = timeout(handshake_timeout, transport.recv()) => result,
        _ = context.shutting_down() => {
            transport.close().await;
            return;
        }
    };

    let (nonce, token) = match hello {
        Ok(Ok(Some(bytes))) => match Frame::from_bytes(&bytes) {
            Ok(Frame::Hello {
                version,
                nonce,
                token,
            }) if version == HANDSHAKE_VERSION => (nonce, token),
            Ok(frame) => {
                debug!("Inbound link opened with {} frame, closing", frame.kind());
                transport.close().await;
                return;
            }
            Err(err) => {
                debug!("Inbound link sent garbage: {}", err);
                transport.close().await;
                return;
            }
        },
        Ok(Ok(None)) | Ok(Err(_)) | Err(_) => {
            debug!("Inbound link closed before hello");
            transport.close().await;
            return;
        }
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    let request = SessionReport::InboundHello {
        token,
        reply: reply_tx,
    };
    if context.reports.send(request).is_err() {
        transport.close().await;
        return;
    }

    let decision = tokio::select! {
        decision = reply_rx => decision,
        _ = context.shutting_down() => {
            transport.close().await;
            return;
        }
    };
    let grant = match decision {
        Ok(Ok(grant)) => grant,
        Ok(Err(err)) => {
            debug!("Inbound hello from {} rejected: {}", token, err);
            transport.close().await;
            return;
        }
        Err(_) => {
            transport.close().await;
            return;
        }
    };

    let link = SessionLink::new(context, grant.peer_id, grant.generation);
    let echo = Frame::echo_for(&nonce, grant.local_token)
        .to_bytes()
        .map_err(|e| TransportError::InvalidFrame(e.to_string()));
    let sent = match echo {
        Ok(bytes) => transport.send(&bytes).await,
        Err(err) => Err(err),
    };
    if let Err(err) = sent {
        transport.close().await;
        link.report(SessionProgress::HandshakeFailed(err.into()));
        return;
    }

    link.report(SessionProgress::Established);
    run_active(link, grant.commands, transport).await;
}

// ----------------------------------------------------------------------------
// Active Session
// ----------------------------------------------------------------------------

/// Pump messages until either side closes; closes the transport on exit
async fn run_active(
    mut link: SessionLink,
    mut commands: mpsc::Receiver<SessionCommand>,
    mut transport: Box<dyn Transport>,
) {
    trace!("Session with {} active", link.peer_id);
    let reason = loop {
        tokio::select! {
            _ = link.context.shutting_down() => {
                say_goodbye(transport.as_mut()).await;
                break CloseReason::Shutdown;
            }
            command = commands.recv() => match command {
                Some(SessionCommand::Send { payload, timestamp }) => {
                    let frame = Frame::Message { timestamp, payload };
                    let sent = match frame.to_bytes() {
                        Ok(bytes) => transport.send(&bytes).await,
                        Err(err) => Err(TransportError::SendFailed(err.to_string())),
                    };
                    if let Err(err) = sent {
                        warn!("Send to {} failed: {}", link.peer_id, err);
                        break CloseReason::Error;
                    }
                }
                Some(SessionCommand::Close) | None => {
                    say_goodbye(transport.as_mut()).await;
                    break CloseReason::Local;
                }
            },
            received = transport.recv() => match received {
                Ok(Some(bytes)) => match Frame::from_bytes(&bytes) {
                    Ok(Frame::Message { timestamp, payload }) => {
                        if payload.len() > link.context.max_payload_size {
                            warn!(
                                "Dropping {} byte message from {} (max {})",
                                payload.len(),
                                link.peer_id,
                                link.context.max_payload_size
                            );
                            continue;
                        }
                        link.report(SessionProgress::Message { payload, timestamp });
                    }
                    Ok(Frame::Goodbye) => break CloseReason::Remote,
                    Ok(frame) => {
                        debug!("Ignoring {} frame from {}", frame.kind(), link.peer_id);
                    }
                    Err(err) => {
                        warn!("Closing session with {}: {}", link.peer_id, err);
                        break CloseReason::Error;
                    }
                },
                Ok(None) => break CloseReason::Disconnected,
                Err(err) => {
                    warn!("Session with {} failed: {}", link.peer_id, err);
                    break CloseReason::Error;
                }
            }
        }
    };

    transport.close().await;
    debug!("Session with {} closed ({:?})", link.peer_id, reason);
    link.report(SessionProgress::Closed(reason));
}

async fn say_goodbye(transport: &mut dyn Transport) {
    if let Ok(bytes) = Frame::Goodbye.to_bytes() {
        if let Err(err) = transport.send(&bytes).await {
            trace!("Goodbye not delivered: {}", err);
        }
    }
}
