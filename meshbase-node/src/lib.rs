//! Shared pieces of the `meshbase-node` binary.
//!
//! The binary is thin: it parses arguments, installs logging and calls into
//! this library, which owns the node configuration, the reports printed by
//! the `identifier` and `parse` subcommands, and the serving [`Node`].

use anyhow::{anyhow, Context, Result};
use meshbase_store::MeshObject;
use meshbase_sync::{
    serve, AddressBook, NetMeshBase, NetMeshBaseConfig, ProxyStore, SyncResult, TcpTransport,
};
use meshbase_types::{
    NetMeshBaseAccessSpecification, NetMeshBaseIdentifier, NetMeshBaseIdentifierFactory,
    NetMeshObjectAccessSpecification,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub const DEFAULT_IDENTIFIER: &str = "http://localhost:7070/";

/// Node configuration, read from a JSON file and overridden by flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier this node answers to. Guessed, so `localhost:7070` works.
    pub identifier: String,
    pub listen: SocketAddr,
    /// Partner identifiers and the TCP addresses they serve on.
    pub peers: BTreeMap<String, SocketAddr>,
    /// SQLite file for proxy state. Proxies are kept in memory only if unset.
    pub proxy_db: Option<PathBuf>,
    /// Properties set on the home object when serving starts.
    pub home_properties: BTreeMap<String, Value>,
    pub meshbase: NetMeshBaseConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identifier: DEFAULT_IDENTIFIER.to_string(),
            listen: SocketAddr::from(([127, 0, 0, 1], 7070)),
            peers: BTreeMap::new(),
            proxy_db: None,
            home_properties: BTreeMap::new(),
            meshbase: NetMeshBaseConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    /// Adds `id=addr` peer entries, replacing any with the same identifier.
    pub fn add_peers<S: AsRef<str>>(&mut self, entries: &[S]) -> Result<()> {
        for entry in entries {
            let (identifier, addr) = parse_peer(entry.as_ref())?;
            self.peers.insert(identifier.to_external_form(), addr);
        }
        Ok(())
    }

    pub fn identifier(&self) -> Result<NetMeshBaseIdentifier> {
        NetMeshBaseIdentifierFactory::default()
            .guess_from_external_form(&self.identifier)
            .with_context(|| format!("invalid node identifier {:?}", self.identifier))
    }

    pub fn address_book(&self) -> Result<AddressBook> {
        let factory = NetMeshBaseIdentifierFactory::default();
        let book = AddressBook::new();
        for (raw, addr) in &self.peers {
            let identifier = factory
                .guess_from_external_form(raw)
                .with_context(|| format!("invalid peer identifier {raw:?}"))?;
            book.insert(identifier, *addr);
        }
        Ok(book)
    }
}

/// Parses a `--peer` value of the form `identifier=host:port`.
pub fn parse_peer(raw: &str) -> Result<(NetMeshBaseIdentifier, SocketAddr)> {
    let (identifier, addr) = raw
        .rsplit_once('=')
        .ok_or_else(|| anyhow!("peer {raw:?} is not of the form ID=ADDR"))?;
    let identifier = NetMeshBaseIdentifierFactory::default()
        .guess_from_external_form(identifier)
        .with_context(|| format!("invalid peer identifier {identifier:?}"))?;
    let addr = addr
        .parse()
        .with_context(|| format!("invalid peer address {addr:?}"))?;
    Ok((identifier, addr))
}

// ── Reports ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierReport {
    pub canonical: String,
    pub uri: String,
    pub scheme: String,
    pub restfully_resolvable: bool,
    pub home_object: String,
}

impl From<&NetMeshBaseIdentifier> for IdentifierReport {
    fn from(identifier: &NetMeshBaseIdentifier) -> Self {
        Self {
            canonical: identifier.to_external_form(),
            uri: identifier.uri().to_string(),
            scheme: identifier.scheme().to_string(),
            restfully_resolvable: identifier.is_restfully_resolvable(),
            home_object: identifier.home_object().to_external_form(),
        }
    }
}

/// Parses `raw` strictly, or leniently with `guess`, optionally relative to
/// `context`.
pub fn describe_identifier(
    raw: &str,
    guess: bool,
    context: Option<&str>,
) -> Result<IdentifierReport> {
    let factory = NetMeshBaseIdentifierFactory::default();
    let identifier = match context {
        Some(context) => {
            let context = factory
                .from_external_form(context)
                .with_context(|| format!("invalid context identifier {context:?}"))?;
            factory.guess_from_external_form_in_context(&context, raw)
        }
        None if guess => factory.guess_from_external_form(raw),
        None => factory.from_external_form(raw),
    }
    .with_context(|| format!("cannot parse identifier {raw:?}"))?;
    Ok(IdentifierReport::from(&identifier))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopReport {
    pub identifier: String,
    pub coherence: Option<String>,
    pub scope: Option<u32>,
}

impl From<&NetMeshBaseAccessSpecification> for HopReport {
    fn from(hop: &NetMeshBaseAccessSpecification) -> Self {
        Self {
            identifier: hop.identifier().to_external_form(),
            coherence: hop.coherence().map(|c| c.to_external_form()),
            scope: hop.scope().map(|s| s.max_steps()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathReport {
    /// The path re-serialized in canonical form.
    pub external_form: String,
    pub local: bool,
    pub hops: Vec<HopReport>,
    pub target: Option<String>,
}

pub fn parse_path(raw: &str) -> Result<NetMeshObjectAccessSpecification> {
    NetMeshObjectAccessSpecification::from_external_form(raw)
        .with_context(|| format!("cannot parse access path {raw:?}"))?
        .ok_or_else(|| anyhow!("access path is empty"))
}

pub fn describe_path(raw: &str) -> Result<PathReport> {
    let path = parse_path(raw)?;
    Ok(PathReport {
        external_form: path.to_external_form(),
        local: path.is_local(),
        hops: path.hops().iter().map(HopReport::from).collect(),
        target: path.target().map(|t| t.to_external_form()),
    })
}

// ── Node ─────────────────────────────────────────────────────────

/// A NetMeshBase answering Xpriso requests on a TCP listener.
pub struct Node {
    base: Arc<NetMeshBase>,
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    server: JoinHandle<SyncResult<()>>,
    proxy_store: Option<ProxyStore>,
}

impl Node {
    /// Builds the NetMeshBase, restores persisted proxies, seeds the home
    /// object and starts serving.
    pub async fn start(config: &NodeConfig) -> Result<Self> {
        let base = build_base(config)?;

        let proxy_store = match &config.proxy_db {
            Some(path) => {
                let store = ProxyStore::new(path)
                    .with_context(|| format!("failed to open proxy store {}", path.display()))?;
                let restored = base.restore_proxies(&store).await?;
                info!("Restored {} proxies from {}", restored, path.display());
                Some(store)
            }
            None => None,
        };

        if !config.home_properties.is_empty() {
            let home = base.identifier().home_object();
            let mut tx = base.begin_transaction().await;
            for (name, value) in &config.home_properties {
                tx.set_property(&home, name, value.clone())?;
            }
            base.commit(tx).await?;
        }

        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let addr = listener.local_addr()?;
        let (stop, stop_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, base.clone(), stop_rx));
        base.start_background_refresh();
        info!("NetMeshBase {} listening on {}", base.identifier(), addr);

        Ok(Self {
            base,
            addr,
            stop,
            server,
            proxy_store,
        })
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub const fn base(&self) -> &Arc<NetMeshBase> {
        &self.base
    }

    /// Stops accepting requests, persists proxies and shuts the base down.
    pub async fn shutdown(self) -> Result<()> {
        self.stop.send_replace(true);
        self.server.await.context("server task panicked")??;
        if let Some(store) = &self.proxy_store {
            let saved = self.base.save_proxies(store).await?;
            info!("Saved {} proxies", saved);
        }
        self.base.shutdown().await;
        Ok(())
    }
}

fn build_base(config: &NodeConfig) -> Result<Arc<NetMeshBase>> {
    let identifier = config.identifier()?;
    let book = Arc::new(config.address_book()?);
    Ok(NetMeshBase::new(
        identifier,
        Arc::new(TcpTransport::new(book)),
        config.meshbase.clone(),
    ))
}

/// Resolves `raw` through the configured peers without serving.
pub async fn fetch(config: &NodeConfig, raw: &str) -> Result<MeshObject> {
    let path = parse_path(raw)?;
    let base = build_base(config)?;
    let result = base.access_locally(&path).await;
    base.shutdown().await;
    result.with_context(|| format!("cannot access {path}"))
}
