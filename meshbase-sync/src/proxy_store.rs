//! Persistent storage for externalized proxies.
//!
//! Uses its own SQLite file so proxy bookkeeping survives restarts of a
//! NetMeshBase whose objects live elsewhere.

use crate::error::SyncError;
use crate::proxy::{ExternalizedProxy, ReplicaEntry, ServedEntry};
use meshbase_types::{
    CoherenceSpecification, DefaultMeshObjectIdentifierFactory, MeshObjectIdentifier,
    MeshObjectIdentifierFactory, NetMeshBaseIdentifier,
};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const OBTAINED: &str = "obtained";
const SERVED: &str = "served";

/// Persistent store for proxy state backed by SQLite.
pub struct ProxyStore {
    conn: Arc<Mutex<Connection>>,
    object_ids: DefaultMeshObjectIdentifierFactory,
}

fn to_sql_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn from_sql_ms(ms: i64) -> u64 {
    u64::try_from(ms).unwrap_or_default()
}

impl ProxyStore {
    /// Opens (or creates) a proxy store at the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let conn = Connection::open(path)
            .map_err(|e| SyncError::Storage(format!("failed to open proxy store: {e}")))?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory proxy store (for testing).
    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            SyncError::Storage(format!("failed to open in-memory proxy store: {e}"))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, SyncError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            object_ids: DefaultMeshObjectIdentifierFactory::default(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), SyncError> {
        self.conn()
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS proxies (
                    partner TEXT PRIMARY KEY,
                    coherence TEXT NOT NULL,
                    created_ms INTEGER NOT NULL,
                    updated_ms INTEGER NOT NULL,
                    read_ms INTEGER NOT NULL,
                    expires_ms INTEGER
                );

                CREATE TABLE IF NOT EXISTS replicas (
                    partner TEXT NOT NULL,
                    object TEXT NOT NULL,
                    direction TEXT NOT NULL,
                    entry TEXT NOT NULL,
                    UNIQUE(partner, object, direction)
                );
                ",
            )
            .map_err(|e| SyncError::Storage(format!("failed to init proxy schema: {e}")))?;
        Ok(())
    }

    // ── Writing ──────────────────────────────────────────────────

    /// Saves a proxy, replacing whatever was stored for its partner.
    pub fn save(&self, proxy: &ExternalizedProxy) -> Result<(), SyncError> {
        let partner = proxy.partner.to_external_form();
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(|e| SyncError::Storage(format!("failed to begin proxy save: {e}")))?;

        tx.execute(
            "INSERT OR REPLACE INTO proxies (partner, coherence, created_ms, updated_ms, read_ms, expires_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                partner,
                proxy.coherence.to_external_form(),
                to_sql_ms(proxy.created_ms),
                to_sql_ms(proxy.updated_ms),
                to_sql_ms(proxy.read_ms),
                proxy.expires_ms.map(to_sql_ms),
            ],
        )
        .map_err(|e| SyncError::Storage(format!("failed to save proxy {partner}: {e}")))?;

        tx.execute("DELETE FROM replicas WHERE partner = ?1", params![partner])
            .map_err(|e| SyncError::Storage(format!("failed to clear replicas of {partner}: {e}")))?;

        for (id, entry) in &proxy.obtained {
            let json = serde_json::to_string(entry)?;
            tx.execute(
                "INSERT INTO replicas (partner, object, direction, entry) VALUES (?1, ?2, ?3, ?4)",
                params![partner, id.to_external_form(), OBTAINED, json],
            )
            .map_err(|e| SyncError::Storage(format!("failed to save replica {id}: {e}")))?;
        }
        for (id, entry) in &proxy.served {
            let json = serde_json::to_string(entry)?;
            tx.execute(
                "INSERT INTO replicas (partner, object, direction, entry) VALUES (?1, ?2, ?3, ?4)",
                params![partner, id.to_external_form(), SERVED, json],
            )
            .map_err(|e| SyncError::Storage(format!("failed to save replica {id}: {e}")))?;
        }

        tx.commit()
            .map_err(|e| SyncError::Storage(format!("failed to commit proxy {partner}: {e}")))
    }

    /// Deletes a stored proxy. Returns whether it existed.
    pub fn remove(&self, partner: &NetMeshBaseIdentifier) -> Result<bool, SyncError> {
        let partner = partner.to_external_form();
        let conn = self.conn();
        conn.execute("DELETE FROM replicas WHERE partner = ?1", params![partner])
            .map_err(|e| SyncError::Storage(format!("failed to delete replicas of {partner}: {e}")))?;
        let removed = conn
            .execute("DELETE FROM proxies WHERE partner = ?1", params![partner])
            .map_err(|e| SyncError::Storage(format!("failed to delete proxy {partner}: {e}")))?;
        Ok(removed > 0)
    }

    // ── Reading ──────────────────────────────────────────────────

    /// Loads every stored proxy, sorted by partner.
    pub fn load_all(&self) -> Result<Vec<ExternalizedProxy>, SyncError> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare("SELECT partner, coherence, created_ms, updated_ms, read_ms, expires_ms FROM proxies ORDER BY partner")
                .map_err(|e| SyncError::Storage(format!("failed to prepare proxy query: {e}")))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                    ))
                })
                .map_err(|e| SyncError::Storage(format!("failed to query proxies: {e}")))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| SyncError::Storage(format!("failed to read proxy row: {e}")))?;
            rows
        };

        let mut proxies = Vec::with_capacity(rows.len());
        for (partner_str, coherence, created, updated, read, expires) in rows {
            let partner: NetMeshBaseIdentifier = partner_str.parse()?;
            let coherence = CoherenceSpecification::from_external_form(&coherence).ok_or_else(
                || SyncError::Storage(format!("bad coherence stored for {partner}: {coherence}")),
            )?;
            let (obtained, served) = self.load_replicas(&partner_str)?;
            proxies.push(ExternalizedProxy {
                partner,
                coherence,
                created_ms: from_sql_ms(created),
                updated_ms: from_sql_ms(updated),
                read_ms: from_sql_ms(read),
                expires_ms: expires.map(from_sql_ms),
                obtained,
                served,
            });
        }
        Ok(proxies)
    }

    #[allow(clippy::type_complexity)]
    fn load_replicas(
        &self,
        partner: &str,
    ) -> Result<
        (
            Vec<(MeshObjectIdentifier, ReplicaEntry)>,
            Vec<(MeshObjectIdentifier, ServedEntry)>,
        ),
        SyncError,
    > {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare("SELECT object, direction, entry FROM replicas WHERE partner = ?1 ORDER BY object")
                .map_err(|e| SyncError::Storage(format!("failed to prepare replica query: {e}")))?;
            let rows = stmt
                .query_map(params![partner], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|e| SyncError::Storage(format!("failed to query replicas: {e}")))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| SyncError::Storage(format!("failed to read replica row: {e}")))?;
            rows
        };

        let mut obtained = Vec::new();
        let mut served = Vec::new();
        for (object, direction, entry) in rows {
            let id = self.object_ids.from_external_form(&object)?;
            match direction.as_str() {
                OBTAINED => obtained.push((id, serde_json::from_str(&entry)?)),
                SERVED => served.push((id, serde_json::from_str(&entry)?)),
                other => {
                    return Err(SyncError::Storage(format!(
                        "unknown replica direction {other:?} for {object}"
                    )));
                }
            }
        }
        Ok((obtained, served))
    }
}
