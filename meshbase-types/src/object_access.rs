//! Multi-hop access paths to MeshObjects.
//!
//! A path `h0!h1!...!hn` says: ask the MeshBase at `h0`, which asks `h1`,
//! and so on, until `hn` yields the object. The object is the home object
//! of `hn` unless a target follows the `#`.

use crate::access::NetMeshBaseAccessSpecification;
use crate::coherence::CoherenceSpecification;
use crate::identifier::{NetMeshBaseIdentifier, NetMeshBaseIdentifierFactory};
use crate::object_id::{DefaultMeshObjectIdentifierFactory, MeshObjectIdentifier, MeshObjectIdentifierFactory};
use crate::scope::ScopeSpecification;
use crate::ParseResult;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Escaped form of `#` inside the object part of an external form.
pub const ESCAPED_HASH: &str = "&#35;";

const HOP_SEPARATOR: char = '!';

/// Ordered hop list plus an optional non-default target object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetMeshObjectAccessSpecification {
    hops: Vec<NetMeshBaseAccessSpecification>,
    target: Option<MeshObjectIdentifier>,
}

impl NetMeshObjectAccessSpecification {
    /// Builds a path. A relative target is qualified against the final
    /// hop; a target equal to the final hop's home object is dropped.
    #[must_use]
    pub fn from_hops(
        hops: Vec<NetMeshBaseAccessSpecification>,
        target: Option<MeshObjectIdentifier>,
    ) -> Self {
        let target = match (hops.last(), target) {
            (Some(last), Some(target)) => {
                let target = target.qualified_against(last.identifier());
                (target != last.identifier().home_object()).then_some(target)
            }
            (_, target) => target,
        };
        Self { hops, target }
    }

    /// Home object of a single MeshBase, default policies.
    #[must_use]
    pub fn create(identifier: NetMeshBaseIdentifier) -> Self {
        Self::from_hops(vec![NetMeshBaseAccessSpecification::new(identifier)], None)
    }

    #[must_use]
    pub fn create_with_target(identifier: NetMeshBaseIdentifier, target: MeshObjectIdentifier) -> Self {
        Self::from_hops(vec![NetMeshBaseAccessSpecification::new(identifier)], Some(target))
    }

    #[must_use]
    pub fn create_with_coherence(
        identifier: NetMeshBaseIdentifier,
        target: Option<MeshObjectIdentifier>,
        coherence: CoherenceSpecification,
    ) -> Self {
        Self::create_full(identifier, target, None, Some(coherence))
    }

    #[must_use]
    pub fn create_with_scope(
        identifier: NetMeshBaseIdentifier,
        target: Option<MeshObjectIdentifier>,
        scope: ScopeSpecification,
    ) -> Self {
        Self::create_full(identifier, target, Some(scope), None)
    }

    #[must_use]
    pub fn create_full(
        identifier: NetMeshBaseIdentifier,
        target: Option<MeshObjectIdentifier>,
        scope: Option<ScopeSpecification>,
        coherence: Option<CoherenceSpecification>,
    ) -> Self {
        let hop = NetMeshBaseAccessSpecification::with_both(identifier, coherence, scope);
        Self::from_hops(vec![hop], target)
    }

    /// One hop per identifier, default policies.
    #[must_use]
    pub fn from_identifiers(
        identifiers: &[NetMeshBaseIdentifier],
        target: Option<MeshObjectIdentifier>,
    ) -> Self {
        Self::from_hops(NetMeshBaseAccessSpecification::from_identifiers(identifiers), target)
    }

    /// An object already held locally: empty path.
    #[must_use]
    pub fn create_to_local_object(identifier: MeshObjectIdentifier) -> Self {
        Self {
            hops: Vec::new(),
            target: Some(identifier),
        }
    }

    /// Prepends `prefix` to each of `paths`.
    #[must_use]
    pub fn with_prefix(prefix: &NetMeshBaseAccessSpecification, paths: &[Self]) -> Vec<Self> {
        paths
            .iter()
            .map(|path| {
                let mut hops = Vec::with_capacity(path.hops.len() + 1);
                hops.push(prefix.clone());
                hops.extend(path.hops.iter().cloned());
                Self::from_hops(hops, path.object_identifier())
            })
            .collect()
    }

    // ── Accessors ──────────────────────────────────────────────────

    #[must_use]
    pub fn hops(&self) -> &[NetMeshBaseAccessSpecification] {
        &self.hops
    }

    /// The non-default target, if any.
    #[must_use]
    pub const fn target(&self) -> Option<&MeshObjectIdentifier> {
        self.target.as_ref()
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.hops.is_empty()
    }

    /// The object this path leads to: the target, or the final hop's home
    /// object. `None` only for an empty path without target.
    #[must_use]
    pub fn object_identifier(&self) -> Option<MeshObjectIdentifier> {
        match (&self.target, self.hops.last()) {
            (Some(target), _) => Some(target.clone()),
            (None, Some(last)) => Some(last.identifier().home_object()),
            (None, None) => None,
        }
    }

    #[must_use]
    pub fn first_hop(&self) -> Option<&NetMeshBaseAccessSpecification> {
        self.hops.first()
    }

    /// What the first hop is asked to resolve on our behalf.
    #[must_use]
    pub fn remainder(&self) -> Self {
        let hops = self.hops.get(1..).map(<[_]>::to_vec).unwrap_or_default();
        Self::from_hops(hops, self.object_identifier())
    }

    /// Scope requested at the final hop.
    #[must_use]
    pub fn scope(&self) -> Option<ScopeSpecification> {
        self.hops.last().and_then(NetMeshBaseAccessSpecification::scope)
    }

    // ── External form ──────────────────────────────────────────────

    /// Parses with the default factories. Empty input means "no
    /// constraint" and yields `Ok(None)`.
    pub fn from_external_form(raw: &str) -> ParseResult<Option<Self>> {
        let objects = DefaultMeshObjectIdentifierFactory::default();
        Self::from_external_form_with(objects.meshbase_identifiers(), &objects, raw)
    }

    pub fn from_external_form_with(
        meshbase_identifiers: &NetMeshBaseIdentifierFactory,
        object_identifiers: &dyn MeshObjectIdentifierFactory,
        raw: &str,
    ) -> ParseResult<Option<Self>> {
        if raw.is_empty() {
            return Ok(None);
        }

        // Encoded query values never contain a raw '#', so the first one
        // ends the path.
        let (path, object) = match raw.split_once('#') {
            Some((path, object)) => (path, Some(unescape_hash(object))),
            None if object_identifiers.treat_as_global_identifier(raw) => ("", Some(raw.to_string())),
            None => (raw, None),
        };

        let hops = if path.is_empty() {
            Vec::new()
        } else {
            path.split(HOP_SEPARATOR)
                .map(|hop| NetMeshBaseAccessSpecification::from_external_form_with(meshbase_identifiers, hop))
                .collect::<ParseResult<Vec<_>>>()?
        };

        let target = object
            .map(|o| object_identifiers.from_external_form(&o))
            .transpose()?;

        Ok(Some(Self::from_hops(hops, target)))
    }

    #[must_use]
    pub fn to_external_form(&self) -> String {
        let mut ret = self
            .hops
            .iter()
            .map(NetMeshBaseAccessSpecification::to_external_form)
            .collect::<Vec<_>>()
            .join("!");
        if let Some(target) = &self.target {
            let form = match self.hops.last() {
                Some(last) => target.to_external_form_relative_to(last.identifier()),
                None => target.to_external_form(),
            };
            ret.push('#');
            ret.push_str(&escape_hash(&form));
        }
        ret
    }
}

impl Hash for NetMeshObjectAccessSpecification {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Position-dependent shift so permuted paths hash differently.
        let mut mixed = 0u64;
        for (i, hop) in self.hops.iter().enumerate() {
            let mut h = DefaultHasher::new();
            hop.hash(&mut h);
            let shift = u32::try_from(i).unwrap_or(u32::MAX);
            mixed ^= h.finish().checked_shr(shift).unwrap_or(0);
        }
        mixed.hash(state);
        self.target.hash(state);
    }
}

impl fmt::Display for NetMeshObjectAccessSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_external_form())
    }
}

fn escape_hash(s: &str) -> String {
    s.replace('#', ESCAPED_HASH)
}

fn unescape_hash(s: &str) -> String {
    s.replace(ESCAPED_HASH, "#")
}
