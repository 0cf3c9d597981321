//! Property-based tests for external forms.
//!
//! Every value type must survive `to_external_form` / `from_external_form`
//! unchanged, parsing must be deterministic, and hop order must be
//! significant.

use meshbase_types::{
    CoherenceSpecification, MeshObjectIdentifier, NetMeshBaseAccessSpecification,
    NetMeshBaseIdentifier, NetMeshBaseIdentifierFactory, NetMeshObjectAccessSpecification,
    ScopeSpecification,
};
use proptest::prelude::*;

// =============================================================================
// HELPER STRATEGIES
// =============================================================================

fn identifier_strategy() -> impl Strategy<Value = NetMeshBaseIdentifier> {
    prop_oneof![
        ("[a-z]{1,10}", "[a-z0-9]{0,8}").prop_map(|(host, path)| format!("http://{host}.example/{path}")),
        ("[a-z]{1,10}", 1u16..9999).prop_map(|(host, port)| format!("https://{host}.example:{port}/mb")),
        "[a-z]{1,10}".prop_map(|path| format!("file:/var/{path}")),
        "[a-z]{1,10}".prop_map(|name| format!("={name}")),
    ]
    .prop_map(|raw| NetMeshBaseIdentifierFactory::default().from_external_form(&raw).unwrap())
}

fn coherence_strategy() -> impl Strategy<Value = CoherenceSpecification> {
    prop_oneof![
        Just(CoherenceSpecification::OneTimeOnly),
        any::<u64>().prop_map(|period_ms| CoherenceSpecification::Periodic { period_ms }),
        (any::<u64>(), any::<u64>(), 0.0f64..1000.0).prop_map(|(f, m, a)| {
            CoherenceSpecification::AdaptivePeriodic {
                fallback_delay_ms: f,
                max_delay_ms: m,
                adaptive_factor: a,
            }
        }),
    ]
}

fn access_strategy() -> impl Strategy<Value = NetMeshBaseAccessSpecification> {
    (
        identifier_strategy(),
        proptest::option::of(coherence_strategy()),
        proptest::option::of((0u32..100).prop_map(ScopeSpecification::new)),
    )
        .prop_map(|(id, c, s)| NetMeshBaseAccessSpecification::with_both(id, c, s))
}

fn local_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_#-]{1,12}"
}

fn object_access_strategy() -> impl Strategy<Value = NetMeshObjectAccessSpecification> {
    (
        prop::collection::vec(access_strategy(), 0..4),
        proptest::option::of(local_strategy()),
    )
        .prop_map(|(hops, target)| {
            let target = target.map(|t| MeshObjectIdentifier::local(t).unwrap());
            match (hops.is_empty(), target) {
                (true, Some(target)) => NetMeshObjectAccessSpecification::create_to_local_object(target),
                (true, None) => NetMeshObjectAccessSpecification::create_to_local_object(
                    MeshObjectIdentifier::local("home").unwrap(),
                ),
                (false, target) => NetMeshObjectAccessSpecification::from_hops(hops, target),
            }
        })
}

// =============================================================================
// ROUND TRIPS
// =============================================================================

proptest! {
    #[test]
    fn coherence_roundtrip(c in coherence_strategy()) {
        prop_assert_eq!(CoherenceSpecification::from_external_form(&c.to_external_form()), Some(c));
    }

    #[test]
    fn coherence_external_form_is_stable(c in coherence_strategy()) {
        prop_assert_eq!(c.to_external_form(), c.to_external_form());
    }

    #[test]
    fn access_roundtrip(spec in access_strategy()) {
        let parsed = NetMeshBaseAccessSpecification::from_external_form(&spec.to_external_form()).unwrap();
        prop_assert_eq!(parsed, spec);
    }

    #[test]
    fn access_coherence_key_iff_explicit(spec in access_strategy()) {
        prop_assert_eq!(
            spec.to_external_form().contains("lid-coherence="),
            spec.coherence().is_some()
        );
    }

    #[test]
    fn object_access_roundtrip(spec in object_access_strategy()) {
        let parsed = NetMeshObjectAccessSpecification::from_external_form(&spec.to_external_form())
            .unwrap()
            .unwrap();
        prop_assert_eq!(parsed, spec);
    }

    #[test]
    fn parsing_is_idempotent(spec in object_access_strategy()) {
        let ext = spec.to_external_form();
        let a = NetMeshObjectAccessSpecification::from_external_form(&ext).unwrap();
        let b = NetMeshObjectAccessSpecification::from_external_form(&ext).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn hop_permutations_differ(a in access_strategy(), b in access_strategy()) {
        prop_assume!(a != b);
        let ab = NetMeshObjectAccessSpecification::from_hops(vec![a.clone(), b.clone()], None);
        let ba = NetMeshObjectAccessSpecification::from_hops(vec![b, a], None);
        prop_assert_ne!(ab, ba);
    }

    #[test]
    fn port_80_is_redundant(host in "[a-z]{1,10}", path in "[a-z]{0,10}") {
        let f = NetMeshBaseIdentifierFactory::default();
        let with_port = f.from_external_form(&format!("http://{host}.example:80/{path}")).unwrap();
        let without = f.from_external_form(&format!("http://{host}.example/{path}")).unwrap();
        prop_assert_eq!(with_port, without);
    }
}
