use async_trait::async_trait;
use meshbase_store::{Change, ChangeKind, ChangeSet, StoreError};
use meshbase_sync::{
    ErrorMessage, LocalNetwork, LockState, MeshMessage, MeshTransport, MessageHandler,
    NetMeshBase, NetMeshBaseConfig, RetryPolicy, SyncError, SyncResult, XprisoMessage,
};
use meshbase_types::{
    CoherenceSpecification, MeshObjectIdentifier, NetMeshBaseAccessSpecification,
    NetMeshBaseIdentifier, NetMeshObjectAccessSpecification, ScopeSpecification,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const A: &str = "http://a.example/";
const B: &str = "http://b.example/";
const C: &str = "http://c.example/";

fn id(s: &str) -> NetMeshBaseIdentifier {
    s.parse().unwrap()
}

fn local(s: &str) -> MeshObjectIdentifier {
    MeshObjectIdentifier::local(s).unwrap()
}

fn test_config() -> NetMeshBaseConfig {
    NetMeshBaseConfig {
        request_timeout_ms: 1_000,
        retry: RetryPolicy {
            attempts: 1,
            ..RetryPolicy::default()
        },
        lock_reclaim_delay_ms: None,
        ..NetMeshBaseConfig::default()
    }
}

fn spawn_base(net: &LocalNetwork, name: &str, config: NetMeshBaseConfig) -> Arc<NetMeshBase> {
    let base = NetMeshBase::new(id(name), Arc::new(net.clone()), config);
    net.register(id(name), &base);
    base
}

async fn create_object(base: &NetMeshBase, name: &str, title: &str) -> MeshObjectIdentifier {
    let mut tx = base.begin_transaction().await;
    let object = tx.create(local(name)).unwrap();
    tx.set_property(&object, "title", json!(title)).unwrap();
    base.commit(tx).await.unwrap();
    object
}

async fn set_title(base: &NetMeshBase, object: &MeshObjectIdentifier, title: &str) -> SyncResult<()> {
    let mut tx = base.begin_transaction().await;
    tx.set_property(object, "title", json!(title))?;
    base.commit(tx).await?;
    Ok(())
}

fn title(base: &NetMeshBase, object: &MeshObjectIdentifier) -> Option<serde_json::Value> {
    base.store().get(object)?.property("title").cloned()
}

fn raw_request(from: &str, to: &str, session: Uuid, request_id: u64) -> XprisoMessage {
    let mut request = XprisoMessage::new(id(from), id(to));
    request.session = session;
    request.request_id = request_id;
    request
}

fn error_code(response: &MeshMessage) -> Option<u32> {
    match response {
        MeshMessage::Error(e) => Some(e.code),
        _ => None,
    }
}

// ── Local access ─────────────────────────────────────────────────

#[tokio::test]
async fn empty_path_resolves_locally() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let x = create_object(&a, "x", "local").await;

    let home = a
        .access_locally(&NetMeshObjectAccessSpecification::from_hops(Vec::new(), None))
        .await
        .unwrap();
    assert_eq!(home.id, id(A).home_object());

    let path = NetMeshObjectAccessSpecification::create_to_local_object(local("x"));
    let object = a.access_locally(&path).await.unwrap();
    assert_eq!(object.id, x);
    assert_eq!(net.delivered(), 0);
}

#[tokio::test]
async fn missing_local_object_fails_without_hops() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());

    let path = NetMeshObjectAccessSpecification::create_to_local_object(local("nope"));
    let err = a.access_locally(&path).await.unwrap_err();
    assert!(err.partial.is_empty());
    assert!(err.failed.is_empty());
    assert!(matches!(err.cause, SyncError::Store(StoreError::NotFound(_))));
}

#[tokio::test]
async fn path_through_self_is_skipped() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "hello").await;

    let path = NetMeshObjectAccessSpecification::from_identifiers(&[id(A), id(B)], Some(x.clone()));
    let object = a.access_locally(&path).await.unwrap();
    assert_eq!(object.id, x);
    assert_eq!(object.proxy_towards_home, Some(id(B)));
}

// ── Obtaining replicas ───────────────────────────────────────────

#[tokio::test]
async fn obtained_replica_is_served_from_cache() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "hello").await;

    let path = NetMeshObjectAccessSpecification::create_with_target(id(B), x.clone());
    let replica = a.access_locally(&path).await.unwrap();
    assert_eq!(replica.property("title"), Some(&json!("hello")));
    assert_eq!(replica.proxy_towards_home, Some(id(B)));
    assert_eq!(replica.proxy_towards_lock, Some(id(B)));
    assert!(a.store().contains(&x));

    let delivered = net.delivered();
    let again = a.access_locally(&path).await.unwrap();
    assert_eq!(again, replica);
    assert_eq!(net.delivered(), delivered);

    let proxy = a.proxy_manager().get(&id(B)).await.unwrap();
    assert_eq!(proxy.obtained_ids(), vec![x.clone()]);
    let served = b.proxy_manager().get(&id(A)).await.unwrap();
    assert_eq!(served.served_ids(), vec![x]);
}

#[tokio::test]
async fn home_object_of_partner() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let _b = spawn_base(&net, B, test_config());

    let object = a
        .access_locally(&NetMeshObjectAccessSpecification::create(id(B)))
        .await
        .unwrap();
    assert_eq!(object.id, id(B).home_object());
    assert!(object.is_replica());
}

#[tokio::test]
async fn access_many_resolves_each_path() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "one").await;
    let y = create_object(&b, "y", "two").await;

    let paths = vec![
        NetMeshObjectAccessSpecification::create_with_target(id(B), x.clone()),
        NetMeshObjectAccessSpecification::create_with_target(id(B), local("missing")),
        NetMeshObjectAccessSpecification::create_with_target(id(B), y.clone()),
    ];
    let results = a.access_locally_many(&paths).await;
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap().id, x);
    assert!(results[1].is_err());
    assert_eq!(results[2].as_ref().unwrap().id, y);
}

#[tokio::test]
async fn unknown_object_reports_first_hop() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let _b = spawn_base(&net, B, test_config());

    let path = NetMeshObjectAccessSpecification::create_with_target(id(B), local("missing"));
    let err = a.access_locally(&path).await.unwrap_err();
    assert!(err.partial.is_empty());
    assert_eq!(err.failed, vec![NetMeshBaseAccessSpecification::new(id(B))]);
    match err.cause {
        SyncError::Peer { code, .. } => assert_eq!(code, ErrorMessage::UNKNOWN_OBJECT),
        other => panic!("expected peer error, got {other:?}"),
    }
}

#[tokio::test]
async fn scope_conveys_neighbors_within_steps() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "root").await;
    let y = create_object(&b, "y", "one step").await;
    let z = create_object(&b, "z", "two steps").await;
    let mut tx = b.begin_transaction().await;
    tx.relate(&x, &y).unwrap();
    tx.relate(&y, &z).unwrap();
    b.commit(tx).await.unwrap();

    let path = NetMeshObjectAccessSpecification::create_with_scope(
        id(B),
        Some(x.clone()),
        ScopeSpecification::new(1),
    );
    let replica = a.access_locally(&path).await.unwrap();
    assert_eq!(replica.id, x);
    assert_eq!(title(&a, &y), Some(json!("one step")));
    assert!(a.store().get(&z).is_none());

    let unscoped = NetMeshObjectAccessSpecification::create_with_target(id(B), z.clone());
    a.access_locally(&unscoped).await.unwrap();
    assert_eq!(title(&a, &z), Some(json!("two steps")));
}

// ── Multi-hop ────────────────────────────────────────────────────

#[tokio::test]
async fn two_hop_path_is_relayed() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let c = spawn_base(&net, C, test_config());
    let x = create_object(&c, "x", "far away").await;

    let path = NetMeshObjectAccessSpecification::from_identifiers(&[id(B), id(C)], Some(x.clone()));
    let replica = a.access_locally(&path).await.unwrap();
    assert_eq!(replica.property("title"), Some(&json!("far away")));
    assert_eq!(replica.proxy_towards_home, Some(id(B)));

    let relayed = b.store().get(&x).unwrap();
    assert_eq!(relayed.proxy_towards_home, Some(id(C)));
    assert!(a.proxy_manager().get(&id(C)).await.is_none());
}

#[tokio::test]
async fn failing_second_hop_keeps_partial_result() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let _b = spawn_base(&net, B, test_config());

    let path = NetMeshObjectAccessSpecification::from_identifiers(&[id(B), id(C)], None);
    let err = a.access_locally(&path).await.unwrap_err();

    let partial: Vec<_> = err.partial.iter().map(|o| o.id.clone()).collect();
    assert_eq!(partial, vec![id(B).home_object()]);
    assert_eq!(err.failed, vec![NetMeshBaseAccessSpecification::new(id(C))]);
    assert!(matches!(err.cause, SyncError::RelayFailed { .. }));
    assert!(a.store().contains(&id(B).home_object()));
}

#[tokio::test]
async fn unreachable_first_hop_fails_at_first_hop() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let _b = spawn_base(&net, B, test_config());
    net.set_unreachable(&id(B), true);

    let path = NetMeshObjectAccessSpecification::from_identifiers(&[id(B), id(C)], None);
    let err = a.access_locally(&path).await.unwrap_err();
    assert!(err.partial.is_empty());
    assert_eq!(err.failed, vec![NetMeshBaseAccessSpecification::new(id(B))]);
    assert!(matches!(err.cause, SyncError::Network(_)));
}

#[tokio::test]
async fn non_relaying_hop_is_bypassed() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(
        &net,
        B,
        NetMeshBaseConfig {
            relay_enabled: false,
            ..test_config()
        },
    );
    let c = spawn_base(&net, C, test_config());
    let x = create_object(&c, "x", "direct").await;

    let path = NetMeshObjectAccessSpecification::from_identifiers(&[id(B), id(C)], Some(x.clone()));
    let replica = a.access_locally(&path).await.unwrap();
    assert_eq!(replica.proxy_towards_home, Some(id(C)));
    assert!(!b.store().contains(&x));
    assert!(a.proxy_manager().get(&id(C)).await.is_some());
}

// ── Channel failures ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn slow_partner_times_out() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let _b = spawn_base(&net, B, test_config());
    net.set_delay(&id(B), Some(Duration::from_secs(5)));

    let err = a
        .access_locally(&NetMeshObjectAccessSpecification::create(id(B)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.failed, vec![NetMeshBaseAccessSpecification::new(id(B))]);
    assert_eq!(net.delivered(), 0);
}

#[tokio::test(start_paused = true)]
async fn network_errors_are_retried() {
    let net = LocalNetwork::new();
    let config = NetMeshBaseConfig {
        retry: RetryPolicy {
            attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            jitter_ms: 0,
        },
        ..test_config()
    };
    let a = spawn_base(&net, A, config);
    let _b = spawn_base(&net, B, test_config());
    net.set_unreachable(&id(B), true);

    let healer = {
        let net = net.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            net.set_unreachable(&id(B), false);
        })
    };

    let object = a
        .access_locally(&NetMeshObjectAccessSpecification::create(id(B)))
        .await
        .unwrap();
    assert_eq!(object.id, id(B).home_object());
    healer.await.unwrap();

    let proxy = a.proxy_manager().get(&id(B)).await.unwrap();
    assert_eq!(proxy.consecutive_failures(), 0);
}

#[tokio::test]
async fn repeated_failures_discard_proxy() {
    let net = LocalNetwork::new();
    let a = spawn_base(
        &net,
        A,
        NetMeshBaseConfig {
            max_consecutive_failures: 2,
            ..test_config()
        },
    );
    let path = NetMeshObjectAccessSpecification::create(id(B));

    assert!(a.access_locally(&path).await.is_err());
    assert!(a.proxy_manager().get(&id(B)).await.is_some());

    assert!(a.access_locally(&path).await.is_err());
    assert!(a.proxy_manager().get(&id(B)).await.is_none());
}

// ── Coherence ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn due_replica_is_refreshed() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "v1").await;

    let path = NetMeshObjectAccessSpecification::create_with_coherence(
        id(B),
        Some(x.clone()),
        CoherenceSpecification::Periodic { period_ms: 1_000 },
    );
    a.access_locally(&path).await.unwrap();
    let delivered = net.delivered();

    assert_eq!(a.refresh_due_replicas().await, 0);
    assert_eq!(net.delivered(), delivered);

    tokio::time::advance(Duration::from_millis(1_500)).await;
    assert_eq!(a.refresh_due_replicas().await, 1);
    assert_eq!(net.delivered(), delivered + 1);

    let proxy = a.proxy_manager().get(&id(B)).await.unwrap();
    let entry = proxy.replica(&x).unwrap();
    assert_eq!(entry.schedule.current_delay_ms(), 1_000);
    assert!(entry.schedule.next_check_ms().unwrap() > a.now_ms());
}

#[tokio::test(start_paused = true)]
async fn access_refreshes_due_replica_first() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "v1").await;

    let path = NetMeshObjectAccessSpecification::create_with_coherence(
        id(B),
        Some(x.clone()),
        CoherenceSpecification::Periodic { period_ms: 1_000 },
    );
    a.access_locally(&path).await.unwrap();
    let delivered = net.delivered();

    tokio::time::advance(Duration::from_millis(1_500)).await;
    a.access_locally(&path).await.unwrap();
    assert_eq!(net.delivered(), delivered + 1);

    a.access_locally(&path).await.unwrap();
    assert_eq!(net.delivered(), delivered + 1);
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_returns_stale_copy_as_partial() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "v1").await;

    let path = NetMeshObjectAccessSpecification::create_with_coherence(
        id(B),
        Some(x.clone()),
        CoherenceSpecification::Periodic { period_ms: 1_000 },
    );
    a.access_locally(&path).await.unwrap();

    net.set_unreachable(&id(B), true);
    tokio::time::advance(Duration::from_millis(1_500)).await;
    let err = a.access_locally(&path).await.unwrap_err();
    assert_eq!(err.partial.len(), 1);
    assert_eq!(err.partial[0].id, x);
    assert_eq!(err.partial[0].property("title"), Some(&json!("v1")));
}

#[tokio::test]
async fn one_time_only_replica_is_never_refreshed() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "v1").await;

    let path = NetMeshObjectAccessSpecification::create_with_coherence(
        id(B),
        Some(x.clone()),
        CoherenceSpecification::OneTimeOnly,
    );
    a.access_locally(&path).await.unwrap();
    let proxy = a.proxy_manager().get(&id(B)).await.unwrap();
    assert_eq!(proxy.replica(&x).unwrap().schedule.next_check_ms(), None);
    assert_eq!(proxy.time_expires(), None);
    assert!(proxy.due_replicas(u64::MAX).is_empty());
}

// ── Changes ──────────────────────────────────────────────────────

#[tokio::test]
async fn changes_reach_every_replica() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let c = spawn_base(&net, C, test_config());
    let x = create_object(&b, "x", "v1").await;

    a.access_locally(&NetMeshObjectAccessSpecification::create_with_target(id(B), x.clone()))
        .await
        .unwrap();
    c.access_locally(&NetMeshObjectAccessSpecification::create_with_target(id(B), x.clone()))
        .await
        .unwrap();

    set_title(&b, &x, "v2").await.unwrap();
    assert_eq!(title(&a, &x), Some(json!("v2")));
    assert_eq!(title(&c, &x), Some(json!("v2")));
    assert_eq!(a.store().get(&x).unwrap().version, b.store().get(&x).unwrap().version);
}

#[tokio::test]
async fn changes_are_forwarded_along_the_replication_chain() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let c = spawn_base(&net, C, test_config());
    let x = create_object(&b, "x", "v1").await;

    a.access_locally(&NetMeshObjectAccessSpecification::create_with_target(id(B), x.clone()))
        .await
        .unwrap();
    // C replicates A's replica.
    c.access_locally(&NetMeshObjectAccessSpecification::create_with_target(id(A), x.clone()))
        .await
        .unwrap();
    assert_eq!(c.store().get(&x).unwrap().proxy_towards_home, Some(id(A)));

    set_title(&b, &x, "v2").await.unwrap();
    assert_eq!(title(&c, &x), Some(json!("v2")));
}

#[tokio::test]
async fn unrelated_changes_are_not_pushed() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "v1").await;
    let y = create_object(&b, "y", "v1").await;

    a.access_locally(&NetMeshObjectAccessSpecification::create_with_target(id(B), x))
        .await
        .unwrap();
    let delivered = net.delivered();
    set_title(&b, &y, "v2").await.unwrap();
    assert_eq!(net.delivered(), delivered);
    assert!(!a.store().contains(&y));
}

#[tokio::test]
async fn deletion_purges_replicas() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "v1").await;

    a.access_locally(&NetMeshObjectAccessSpecification::create_with_target(id(B), x.clone()))
        .await
        .unwrap();
    let mut tx = b.begin_transaction().await;
    tx.delete(&x).unwrap();
    b.commit(tx).await.unwrap();

    assert!(!a.store().contains(&x));
    let served = b.proxy_manager().get(&id(A)).await.unwrap();
    assert!(served.served_ids().is_empty());
}

#[tokio::test]
async fn cancel_replicas_drops_both_sides() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "v1").await;

    a.access_locally(&NetMeshObjectAccessSpecification::create_with_target(id(B), x.clone()))
        .await
        .unwrap();
    a.cancel_replicas(std::slice::from_ref(&x)).await.unwrap();

    assert!(!a.store().contains(&x));
    assert!(a.proxy_manager().get(&id(B)).await.unwrap().obtained_ids().is_empty());
    assert!(b.proxy_manager().get(&id(A)).await.unwrap().served_ids().is_empty());
    assert!(b.store().contains(&x));
}

// ── Locks ────────────────────────────────────────────────────────

#[tokio::test]
async fn replica_cannot_be_written_without_lock() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "v1").await;

    a.access_locally(&NetMeshObjectAccessSpecification::create_with_target(id(B), x.clone()))
        .await
        .unwrap();
    let err = set_title(&a, &x, "mine").await.unwrap_err();
    assert!(matches!(err, SyncError::Store(StoreError::NotLockOwner { .. })));
    assert_eq!(title(&a, &x), Some(json!("v1")));
}

#[tokio::test]
async fn lock_handshake_moves_write_lock() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "v1").await;

    a.access_locally(&NetMeshObjectAccessSpecification::create_with_target(id(B), x.clone()))
        .await
        .unwrap();
    let obtained = a
        .try_to_obtain_locks(std::slice::from_ref(&x), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(obtained, vec![x.clone()]);

    assert!(a.store().get(&x).unwrap().has_lock());
    assert_eq!(b.store().get(&x).unwrap().proxy_towards_lock, Some(id(A)));
    let a_side = a.proxy_manager().get(&id(B)).await.unwrap();
    assert_eq!(a_side.replica(&x).unwrap().lock, LockState::HeldLocally);
    let b_side = b.proxy_manager().get(&id(A)).await.unwrap();
    assert_eq!(b_side.served(&x).unwrap().lock, LockState::HeldRemotely);

    set_title(&a, &x, "from a").await.unwrap();
    assert_eq!(title(&b, &x), Some(json!("from a")));

    let err = set_title(&b, &x, "from b").await.unwrap_err();
    assert!(matches!(err, SyncError::Store(StoreError::NotLockOwner { .. })));
}

#[tokio::test]
async fn locks_held_locally_need_no_exchange() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let x = create_object(&a, "x", "v1").await;

    let obtained = a
        .try_to_obtain_locks(std::slice::from_ref(&x), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(obtained, vec![x]);
    assert_eq!(net.delivered(), 0);
}

#[tokio::test]
async fn lock_is_fetched_through_relaying_partner() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let c = spawn_base(&net, C, test_config());
    let x = create_object(&c, "x", "v1").await;

    let path = NetMeshObjectAccessSpecification::from_identifiers(&[id(B), id(C)], Some(x.clone()));
    a.access_locally(&path).await.unwrap();
    a.try_to_obtain_locks(std::slice::from_ref(&x), Duration::from_secs(1))
        .await
        .unwrap();

    assert!(a.store().get(&x).unwrap().has_lock());
    assert_eq!(b.store().get(&x).unwrap().proxy_towards_lock, Some(id(A)));
    assert_eq!(c.store().get(&x).unwrap().proxy_towards_lock, Some(id(B)));

    set_title(&a, &x, "from a").await.unwrap();
    assert_eq!(title(&b, &x), Some(json!("from a")));
    assert_eq!(title(&c, &x), Some(json!("from a")));
}

/// Drops lock acknowledgements while armed.
struct DropAcknowledgements {
    inner: LocalNetwork,
    armed: AtomicBool,
}

#[async_trait]
impl MeshTransport for DropAcknowledgements {
    async fn send_request(
        &self,
        to: &NetMeshBaseIdentifier,
        message: MeshMessage,
    ) -> SyncResult<MeshMessage> {
        if let MeshMessage::Xpriso(request) = &message {
            if !request.lock_acknowledgements.is_empty() && self.armed.load(Ordering::SeqCst) {
                return Err(SyncError::Network("acknowledgement dropped".into()));
            }
        }
        self.inner.send_request(to, message).await
    }
}

#[tokio::test(start_paused = true)]
async fn lost_acknowledgement_leaves_lock_unconfirmed_until_reclaimed() {
    let net = LocalNetwork::new();
    let transport = Arc::new(DropAcknowledgements {
        inner: net.clone(),
        armed: AtomicBool::new(true),
    });
    let a = NetMeshBase::new(
        id(A),
        transport.clone(),
        NetMeshBaseConfig {
            lock_reclaim_delay_ms: Some(1_000),
            ..test_config()
        },
    );
    net.register(id(A), &a);
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "v1").await;

    a.access_locally(&NetMeshObjectAccessSpecification::create_with_target(id(B), x.clone()))
        .await
        .unwrap();
    let err = a
        .try_to_obtain_locks(std::slice::from_ref(&x), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));

    let proxy = a.proxy_manager().get(&id(B)).await.unwrap();
    assert!(proxy.replica(&x).unwrap().lock.is_unconfirmed());
    assert!(set_title(&a, &x, "too early").await.is_err());
    let b_side = b.proxy_manager().get(&id(A)).await.unwrap();
    assert_eq!(b_side.served(&x).unwrap().lock, LockState::ReleaseProposed);

    transport.armed.store(false, Ordering::SeqCst);
    tokio::time::advance(Duration::from_millis(1_500)).await;
    a.refresh_due_replicas().await;

    assert_eq!(proxy.replica(&x).unwrap().lock, LockState::HeldLocally);
    assert_eq!(b.store().get(&x).unwrap().proxy_towards_lock, Some(id(A)));
    assert_eq!(b_side.served(&x).unwrap().lock, LockState::HeldRemotely);
    set_title(&a, &x, "reclaimed").await.unwrap();
    assert_eq!(title(&b, &x), Some(json!("reclaimed")));
}

#[tokio::test]
async fn force_obtain_takes_lock_immediately() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "v1").await;

    a.access_locally(&NetMeshObjectAccessSpecification::create_with_target(id(B), x.clone()))
        .await
        .unwrap();
    a.force_obtain_locks(std::slice::from_ref(&x)).await.unwrap();

    assert!(a.store().get(&x).unwrap().has_lock());
    assert_eq!(b.store().get(&x).unwrap().proxy_towards_lock, Some(id(A)));
}

// ── Responder ────────────────────────────────────────────────────

#[tokio::test]
async fn ping_is_answered() {
    let net = LocalNetwork::new();
    let b = spawn_base(&net, B, test_config());
    assert_eq!(b.handle_message(MeshMessage::Ping(9)).await, MeshMessage::Pong(9));
}

#[tokio::test]
async fn version_and_receiver_are_checked() {
    let net = LocalNetwork::new();
    let b = spawn_base(&net, B, test_config());

    let mut request = raw_request(A, B, Uuid::new_v4(), 1);
    request.version = 99;
    let response = b.handle_message(MeshMessage::Xpriso(request)).await;
    assert_eq!(error_code(&response), Some(ErrorMessage::VERSION_MISMATCH));

    let misrouted = raw_request(A, C, Uuid::new_v4(), 1);
    let response = b.handle_message(MeshMessage::Xpriso(misrouted)).await;
    assert_eq!(error_code(&response), Some(ErrorMessage::INTERNAL));
}

#[tokio::test]
async fn retried_request_gets_same_response() {
    let net = LocalNetwork::new();
    let b = spawn_base(
        &net,
        B,
        NetMeshBaseConfig {
            response_cache_size: 1,
            ..test_config()
        },
    );
    let session = Uuid::new_v4();

    let mut first = raw_request(A, B, session, 1);
    first
        .requested_first_time
        .push(NetMeshObjectAccessSpecification::create_to_local_object(id(B).home_object()));
    let response = b.handle_message(MeshMessage::Xpriso(first.clone())).await;
    match &response {
        MeshMessage::Xpriso(reply) => {
            assert_eq!(reply.response_id, Some(1));
            assert_eq!(reply.conveyed.len(), 1);
        }
        other => panic!("expected Xpriso, got {other:?}"),
    }
    let replayed = b.handle_message(MeshMessage::Xpriso(first.clone())).await;
    assert_eq!(replayed, response);

    let second = raw_request(A, B, session, 2);
    b.handle_message(MeshMessage::Xpriso(second)).await;
    let stale = b.handle_message(MeshMessage::Xpriso(first.clone())).await;
    assert_eq!(error_code(&stale), Some(ErrorMessage::DUPLICATE));

    // A restarted channel starts a new numbering.
    first.session = Uuid::new_v4();
    let fresh = b.handle_message(MeshMessage::Xpriso(first)).await;
    assert!(matches!(fresh, MeshMessage::Xpriso(_)));
}

#[tokio::test]
async fn acknowledgement_without_proposal_quarantines_partner() {
    let net = LocalNetwork::new();
    let b = spawn_base(&net, B, test_config());
    let session = Uuid::new_v4();

    let mut bogus = raw_request(A, B, session, 1);
    bogus.lock_acknowledgements.push(id(B).home_object());
    let response = b.handle_message(MeshMessage::Xpriso(bogus)).await;
    assert_eq!(error_code(&response), Some(ErrorMessage::PROTOCOL_VIOLATION));
    assert!(b.store().home_object().unwrap().has_lock());

    let proxy = b.proxy_manager().get(&id(A)).await.unwrap();
    assert!(proxy.quarantine_reason().is_some());

    let next = b.handle_message(MeshMessage::Xpriso(raw_request(A, B, session, 2))).await;
    assert_eq!(error_code(&next), Some(ErrorMessage::QUARANTINED));

    assert!(b.release_quarantine(&id(A)).await);
    let after = b.handle_message(MeshMessage::Xpriso(raw_request(A, B, session, 3))).await;
    assert!(matches!(after, MeshMessage::Xpriso(_)));
}

#[tokio::test]
async fn quarantine_is_per_partner() {
    let net = LocalNetwork::new();
    let b = spawn_base(&net, B, test_config());

    let mut bogus = raw_request(A, B, Uuid::new_v4(), 1);
    bogus.lock_acknowledgements.push(id(B).home_object());
    b.handle_message(MeshMessage::Xpriso(bogus)).await;

    let other = b.handle_message(MeshMessage::Xpriso(raw_request(C, B, Uuid::new_v4(), 1))).await;
    assert!(matches!(other, MeshMessage::Xpriso(_)));
}

#[tokio::test]
async fn change_without_lock_is_rejected_and_quarantines_sender() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let x = create_object(&a, "x", "v1").await;
    let version = a.store().get(&x).unwrap().version;

    let mut forged = raw_request(B, A, Uuid::new_v4(), 1);
    forged.change_set = Some(ChangeSet {
        origin: id(B),
        transaction_seq: 1,
        changes: vec![Change {
            object: x.clone(),
            base_version: version,
            new_version: version + 1,
            kind: ChangeKind::PropertyChanged {
                name: "title".to_string(),
                old: Some(json!("v1")),
                new: Some(json!("overwritten")),
            },
        }],
    });
    let response = a.handle_message(MeshMessage::Xpriso(forged)).await;

    assert_eq!(error_code(&response), Some(ErrorMessage::PROTOCOL_VIOLATION));
    assert_eq!(title(&a, &x), Some(json!("v1")));
    assert_eq!(a.store().get(&x).unwrap().version, version);
    let proxy = a.proxy_manager().get(&id(B)).await.unwrap();
    assert!(proxy.quarantine_reason().is_some());
}

#[tokio::test]
async fn cease_communications_discards_partner_proxy() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());

    a.access_locally(&NetMeshObjectAccessSpecification::create(id(B)))
        .await
        .unwrap();
    assert!(b.proxy_manager().get(&id(A)).await.is_some());

    let proxy = a.proxy_manager().discard(&id(B)).await.unwrap();
    assert!(proxy.is_dead());
    let fresh = a
        .proxy_manager()
        .obtain_for(&id(B), CoherenceSpecification::OneTimeOnly)
        .await
        .unwrap();
    fresh.initiate_cease_communications().await.unwrap();

    assert!(fresh.is_dead());
    assert!(b.proxy_manager().get(&id(A)).await.is_none());
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_stops_everything() {
    let net = LocalNetwork::new();
    let a = spawn_base(&net, A, test_config());
    let b = spawn_base(&net, B, test_config());
    a.start_background_refresh();

    a.access_locally(&NetMeshObjectAccessSpecification::create(id(B)))
        .await
        .unwrap();
    assert_eq!(a.proxy_manager().len().await, 1);

    a.shutdown().await;
    assert!(a.is_shut_down());
    assert!(a.proxy_manager().is_empty().await);

    let response = a
        .handle_message(MeshMessage::Xpriso(raw_request(B, A, Uuid::new_v4(), 1)))
        .await;
    assert_eq!(error_code(&response), Some(ErrorMessage::INTERNAL));
    assert!(!b.is_shut_down());
}

#[tokio::test(start_paused = true)]
async fn background_refresh_runs_on_its_own() {
    let net = LocalNetwork::new();
    let a = spawn_base(
        &net,
        A,
        NetMeshBaseConfig {
            refresh_tick_ms: 100,
            ..test_config()
        },
    );
    let b = spawn_base(&net, B, test_config());
    let x = create_object(&b, "x", "v1").await;

    let path = NetMeshObjectAccessSpecification::create_with_coherence(
        id(B),
        Some(x.clone()),
        CoherenceSpecification::Periodic { period_ms: 1_000 },
    );
    a.access_locally(&path).await.unwrap();
    let delivered = net.delivered();

    a.start_background_refresh();
    tokio::time::sleep(Duration::from_millis(1_550)).await;
    assert!(net.delivered() > delivered);

    a.shutdown().await;
}
