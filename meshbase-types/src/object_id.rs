//! MeshObject identifiers.

use crate::identifier::{is_xri_global_context_symbol, NetMeshBaseIdentifier, NetMeshBaseIdentifierFactory};
use crate::{ParseError, ParseResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Separates the owning MeshBase from the local part: `base#local`.
pub const OBJECT_SEPARATOR: char = '#';

/// Identifies a MeshObject.
///
/// Three shapes exist:
/// - `base` only: the home object of that MeshBase
/// - `base#local`: an object owned by `base`
/// - `local` only: relative, resolved against whatever MeshBase holds it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeshObjectIdentifier {
    base: Option<NetMeshBaseIdentifier>,
    local: Option<String>,
}

impl MeshObjectIdentifier {
    /// The home object of `base`.
    #[must_use]
    pub const fn home_of(base: NetMeshBaseIdentifier) -> Self {
        Self {
            base: Some(base),
            local: None,
        }
    }

    /// An object owned by `base`. An empty `local` names the home object.
    pub fn new(base: NetMeshBaseIdentifier, local: impl Into<String>) -> ParseResult<Self> {
        let local = local.into();
        if local.is_empty() {
            return Ok(Self::home_of(base));
        }
        check_local(&local)?;
        Ok(Self {
            base: Some(base),
            local: Some(local),
        })
    }

    /// A relative identifier.
    pub fn local(local: impl Into<String>) -> ParseResult<Self> {
        let local = local.into();
        if local.is_empty() {
            return Err(ParseError::InvalidObjectIdentifier {
                input: local,
                reason: "relative identifier cannot be empty".into(),
            });
        }
        check_local(&local)?;
        Ok(Self {
            base: None,
            local: Some(local),
        })
    }

    /// A fresh relative identifier. Uses UUID v7 so identifiers created
    /// later sort later.
    #[must_use]
    pub fn new_local() -> Self {
        Self {
            base: None,
            local: Some(Uuid::now_v7().to_string()),
        }
    }

    #[must_use]
    pub const fn base(&self) -> Option<&NetMeshBaseIdentifier> {
        self.base.as_ref()
    }

    #[must_use]
    pub fn local_id(&self) -> Option<&str> {
        self.local.as_deref()
    }

    #[must_use]
    pub const fn is_home_object(&self) -> bool {
        self.base.is_some() && self.local.is_none()
    }

    #[must_use]
    pub const fn is_relative(&self) -> bool {
        self.base.is_none()
    }

    /// Fills in `base` if this identifier is relative.
    #[must_use]
    pub fn qualified_against(&self, base: &NetMeshBaseIdentifier) -> Self {
        match self.base {
            Some(_) => self.clone(),
            None => Self {
                base: Some(base.clone()),
                local: self.local.clone(),
            },
        }
    }

    /// Form relative to `base`: the local part if this object belongs to
    /// `base` and is not its home object, otherwise the full form.
    #[must_use]
    pub fn to_external_form_relative_to(&self, base: &NetMeshBaseIdentifier) -> String {
        match (&self.base, &self.local) {
            (Some(b), Some(local)) if b == base => local.clone(),
            _ => self.to_external_form(),
        }
    }

    #[must_use]
    pub fn to_external_form(&self) -> String {
        match (&self.base, &self.local) {
            (Some(base), None) => base.to_external_form(),
            (Some(base), Some(local)) => format!("{base}{OBJECT_SEPARATOR}{local}"),
            (None, Some(local)) => local.clone(),
            (None, None) => String::new(),
        }
    }
}

impl fmt::Display for MeshObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_external_form())
    }
}

/// Parses object identifiers and decides how bare access strings are read.
pub trait MeshObjectIdentifierFactory: Send + Sync {
    fn from_external_form(&self, raw: &str) -> ParseResult<MeshObjectIdentifier>;

    /// Whether an access string without `#` names an object directly
    /// (`true`) rather than a path of MeshBases (`false`).
    fn treat_as_global_identifier(&self, raw: &str) -> bool;
}

/// Object identifier factory backed by a [`NetMeshBaseIdentifierFactory`].
#[derive(Debug, Clone, Default)]
pub struct DefaultMeshObjectIdentifierFactory {
    meshbase_identifiers: NetMeshBaseIdentifierFactory,
}

impl DefaultMeshObjectIdentifierFactory {
    #[must_use]
    pub const fn new(meshbase_identifiers: NetMeshBaseIdentifierFactory) -> Self {
        Self { meshbase_identifiers }
    }

    #[must_use]
    pub const fn meshbase_identifiers(&self) -> &NetMeshBaseIdentifierFactory {
        &self.meshbase_identifiers
    }
}

impl MeshObjectIdentifierFactory for DefaultMeshObjectIdentifierFactory {
    fn from_external_form(&self, raw: &str) -> ParseResult<MeshObjectIdentifier> {
        if !looks_like_meshbase(raw) {
            return MeshObjectIdentifier::local(raw);
        }
        let (base, local) = match raw.split_once(OBJECT_SEPARATOR) {
            Some((base, local)) => (base, local),
            None => (raw, ""),
        };
        let base = self.meshbase_identifiers.from_external_form(base)?;
        MeshObjectIdentifier::new(base, local)
    }

    fn treat_as_global_identifier(&self, raw: &str) -> bool {
        !looks_like_meshbase(raw)
    }
}

/// `scheme://`, `file:`, XRI or anything with a dot is a MeshBase address.
fn looks_like_meshbase(s: &str) -> bool {
    s.contains("://")
        || s.starts_with("file:")
        || s.starts_with(is_xri_global_context_symbol)
        || s.contains('.')
}

fn check_local(local: &str) -> ParseResult<()> {
    if looks_like_meshbase(local) {
        return Err(ParseError::InvalidObjectIdentifier {
            input: local.to_string(),
            reason: "local part must not look like a MeshBase identifier".into(),
        });
    }
    Ok(())
}
