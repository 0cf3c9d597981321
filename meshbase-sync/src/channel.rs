//! Per-partner request channel.
//!
//! One actor task per proxy owns the outgoing request numbering and sends
//! requests strictly one after another, in submission order. Callers talk
//! to it through an unbounded queue and get the response on a oneshot.

use crate::config::NetMeshBaseConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{MeshMessage, XprisoMessage};
use crate::transport::{stop_requested, MeshTransport};
use meshbase_types::NetMeshBaseIdentifier;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

struct Command {
    message: XprisoMessage,
    reply: oneshot::Sender<SyncResult<XprisoMessage>>,
}

/// Response to a queued request.
pub struct PendingReply(oneshot::Receiver<SyncResult<XprisoMessage>>);

impl PendingReply {
    pub async fn wait(self) -> SyncResult<XprisoMessage> {
        self.0.await.map_err(|_| SyncError::ChannelClosed)?
    }
}

/// Sending half of a channel. Dropping it stops the actor.
pub(crate) struct Channel {
    session: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    kill: watch::Sender<bool>,
    failures: Arc<AtomicU32>,
}

impl Channel {
    /// Starts the actor. It stops on `shutdown`, on [`Channel::close`] or
    /// when the channel is dropped.
    pub(crate) fn spawn(
        partner: NetMeshBaseIdentifier,
        transport: Arc<dyn MeshTransport>,
        config: Arc<NetMeshBaseConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (kill, kill_rx) = watch::channel(false);
        let failures = Arc::new(AtomicU32::new(0));
        let session = Uuid::new_v4();
        let actor = Actor {
            partner,
            session,
            transport,
            config,
            failures: Arc::clone(&failures),
            next_request_id: 0,
        };
        tokio::spawn(actor.run(rx, kill_rx, shutdown));
        Self {
            session,
            commands,
            kill,
            failures,
        }
    }

    pub(crate) const fn session(&self) -> Uuid {
        self.session
    }

    /// Queues a request. Requests are sent in the order they are queued.
    pub(crate) fn enqueue(&self, message: XprisoMessage) -> SyncResult<PendingReply> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command { message, reply })
            .map_err(|_| SyncError::ChannelClosed)?;
        Ok(PendingReply(rx))
    }

    pub(crate) async fn request(&self, message: XprisoMessage) -> SyncResult<XprisoMessage> {
        self.enqueue(message)?.wait().await
    }

    /// Stops the actor, failing queued and in-flight requests.
    pub(crate) fn close(&self) {
        let _ = self.kill.send(true);
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

struct Actor {
    partner: NetMeshBaseIdentifier,
    session: Uuid,
    transport: Arc<dyn MeshTransport>,
    config: Arc<NetMeshBaseConfig>,
    failures: Arc<AtomicU32>,
    next_request_id: u64,
}

impl Actor {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        mut kill: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let command = tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                () = stop_requested(&mut kill) => break,
                () = stop_requested(&mut shutdown) => break,
            };

            self.next_request_id += 1;
            let mut message = command.message;
            message.session = self.session;
            message.request_id = self.next_request_id;

            let result = tokio::select! {
                result = self.deliver(message) => result,
                () = stop_requested(&mut kill) => Err(SyncError::ChannelClosed),
                () = stop_requested(&mut shutdown) => Err(SyncError::ChannelClosed),
            };
            let _ = command.reply.send(result);
        }
        debug!("Channel to {} closed", self.partner);
    }

    /// Sends one request, retrying timeouts and network errors.
    async fn deliver(&self, message: XprisoMessage) -> SyncResult<XprisoMessage> {
        let request_id = message.request_id;
        let attempts = self.config.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let sent = tokio::time::timeout(
                self.config.request_timeout(),
                self.transport
                    .send_request(&self.partner, MeshMessage::Xpriso(message.clone())),
            )
            .await
            .unwrap_or(Err(SyncError::Timeout));

            match sent {
                Ok(response) => {
                    self.failures.store(0, Ordering::SeqCst);
                    return self.interpret(response, request_id);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let backoff = self.config.retry.backoff(attempt);
                    warn!(
                        "Request {} to {} failed ({}), retrying in {:?}",
                        request_id, self.partner, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    if e.is_channel_failure() {
                        self.failures.fetch_add(1, Ordering::SeqCst);
                    }
                    warn!("Request {} to {} failed: {}", request_id, self.partner, e);
                    return Err(e);
                }
            }
        }
    }

    fn interpret(&self, response: MeshMessage, request_id: u64) -> SyncResult<XprisoMessage> {
        match response {
            MeshMessage::Xpriso(reply) if reply.response_id == Some(request_id) => {
                debug!("Response to request {} from {}", request_id, self.partner);
                Ok(reply)
            }
            MeshMessage::Xpriso(reply) => Err(SyncError::ProtocolViolation {
                partner: self.partner.to_string(),
                reason: format!(
                    "response to {:?} received for request {request_id}",
                    reply.response_id
                ),
            }),
            MeshMessage::Error(e) => Err(SyncError::Peer {
                code: e.code,
                message: e.message,
            }),
            other => Err(SyncError::Protocol(format!(
                "unexpected {} response to request {request_id}",
                other.kind()
            ))),
        }
    }
}
