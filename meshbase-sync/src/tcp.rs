//! TCP transport: one connection per request, framed by [`crate::codec`].

use crate::codec::{read_message, write_message};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ErrorMessage, MeshMessage};
use crate::transport::{stop_requested, MeshTransport, MessageHandler, NameServer};
use async_trait::async_trait;
use meshbase_types::NetMeshBaseIdentifier;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Static name server mapping identifiers to socket addresses.
#[derive(Debug, Default)]
pub struct AddressBook {
    entries: RwLock<HashMap<NetMeshBaseIdentifier, SocketAddr>>,
}

impl AddressBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identifier: NetMeshBaseIdentifier, addr: SocketAddr) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identifier, addr);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NameServer for AddressBook {
    type Handle = SocketAddr;

    fn find_by_identifier(&self, identifier: &NetMeshBaseIdentifier) -> Option<SocketAddr> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identifier)
            .copied()
    }
}

/// Client side of the TCP transport.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    book: Arc<AddressBook>,
}

impl TcpTransport {
    #[must_use]
    pub const fn new(book: Arc<AddressBook>) -> Self {
        Self { book }
    }

    #[must_use]
    pub fn address_book(&self) -> &Arc<AddressBook> {
        &self.book
    }
}

fn io_error(to: &NetMeshBaseIdentifier, e: &io::Error) -> SyncError {
    match e.kind() {
        io::ErrorKind::InvalidData => SyncError::Protocol(format!("bad frame from {to}: {e}")),
        _ => SyncError::Network(format!("i/o error talking to {to}: {e}")),
    }
}

#[async_trait]
impl MeshTransport for TcpTransport {
    async fn send_request(
        &self,
        to: &NetMeshBaseIdentifier,
        message: MeshMessage,
    ) -> SyncResult<MeshMessage> {
        let addr = self
            .book
            .find_by_identifier(to)
            .ok_or_else(|| SyncError::PeerNotFound(to.to_string()))?;
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SyncError::Network(format!("failed to connect to {to} at {addr}: {e}")))?;
        write_message(&mut stream, &message)
            .await
            .map_err(|e| io_error(to, &e))?;
        read_message(&mut stream).await.map_err(|e| io_error(to, &e))
    }
}

/// Accepts connections on `listener` and answers each request with
/// `handler` until `shutdown` turns true.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> SyncResult<()> {
    let local = listener
        .local_addr()
        .map_err(|e| SyncError::Network(format!("listener has no address: {e}")))?;
    info!("Serving Xpriso on {}", local);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted
                    .map_err(|e| SyncError::Network(format!("accept failed: {e}")))?;
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, handler).await {
                        debug!("Connection from {} ended: {}", peer, e);
                    }
                });
            }
            () = stop_requested(&mut shutdown) => break,
        }
    }
    info!("Stopped serving on {}", local);
    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<dyn MessageHandler>,
) -> io::Result<()> {
    loop {
        let request = match read_message(&mut stream).await {
            Ok(request) => request,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!("Rejecting malformed frame: {}", e);
                let reply = MeshMessage::Error(ErrorMessage::protocol_violation(e.to_string()));
                return write_message(&mut stream, &reply).await;
            }
            Err(e) => return Err(e),
        };
        let response = handler.handle_message(request).await;
        write_message(&mut stream, &response).await?;
    }
}
