//! Single-hop access specifications.

use crate::coherence::CoherenceSpecification;
use crate::identifier::{NetMeshBaseIdentifier, NetMeshBaseIdentifierFactory};
use crate::scope::ScopeSpecification;
use crate::{ParseError, ParseResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Query keyword carrying the scope.
pub const SCOPE_KEYWORD: &str = "lid-scope";

/// Query keyword carrying the coherence.
pub const COHERENCE_KEYWORD: &str = "lid-coherence";

/// How to access one NetMeshBase: where it is, and optionally how fresh
/// the replicas must stay and how far a fetch may reach.
///
/// `None` means "whatever the accessing MeshBase uses by default". The
/// default is resolved by the engine at the point of use and is never
/// substituted here, so an unspecified coherence does not equal an
/// explicitly given one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetMeshBaseAccessSpecification {
    identifier: NetMeshBaseIdentifier,
    coherence: Option<CoherenceSpecification>,
    scope: Option<ScopeSpecification>,
}

impl NetMeshBaseAccessSpecification {
    #[must_use]
    pub const fn new(identifier: NetMeshBaseIdentifier) -> Self {
        Self {
            identifier,
            coherence: None,
            scope: None,
        }
    }

    #[must_use]
    pub const fn with_coherence(
        identifier: NetMeshBaseIdentifier,
        coherence: CoherenceSpecification,
    ) -> Self {
        Self {
            identifier,
            coherence: Some(coherence),
            scope: None,
        }
    }

    #[must_use]
    pub const fn with_scope(identifier: NetMeshBaseIdentifier, scope: ScopeSpecification) -> Self {
        Self {
            identifier,
            coherence: None,
            scope: Some(scope),
        }
    }

    #[must_use]
    pub const fn with_both(
        identifier: NetMeshBaseIdentifier,
        coherence: Option<CoherenceSpecification>,
        scope: Option<ScopeSpecification>,
    ) -> Self {
        Self {
            identifier,
            coherence,
            scope,
        }
    }

    /// One default access specification per identifier, order kept.
    #[must_use]
    pub fn from_identifiers(identifiers: &[NetMeshBaseIdentifier]) -> Vec<Self> {
        identifiers.iter().cloned().map(Self::new).collect()
    }

    #[must_use]
    pub const fn identifier(&self) -> &NetMeshBaseIdentifier {
        &self.identifier
    }

    #[must_use]
    pub const fn coherence(&self) -> Option<CoherenceSpecification> {
        self.coherence
    }

    #[must_use]
    pub const fn scope(&self) -> Option<ScopeSpecification> {
        self.scope
    }

    /// The requested coherence, or `default` if none was given.
    #[must_use]
    pub fn coherence_or(&self, default: CoherenceSpecification) -> CoherenceSpecification {
        self.coherence.unwrap_or(default)
    }

    pub fn from_external_form(raw: &str) -> ParseResult<Self> {
        Self::from_external_form_with(&NetMeshBaseIdentifierFactory::default(), raw)
    }

    /// Parses `identifier[?lid-scope=..][&lid-coherence=..]`.
    ///
    /// Only the first occurrence of each keyword is consumed; every other
    /// query parameter stays on the identifier, in order. A coherence value
    /// that does not parse is treated as absent.
    pub fn from_external_form_with(
        factory: &NetMeshBaseIdentifierFactory,
        raw: &str,
    ) -> ParseResult<Self> {
        let Some((base, query)) = raw.split_once('?') else {
            return Ok(Self::new(factory.from_external_form(raw)?));
        };

        let mut scope = None;
        let mut coherence = None;
        let mut remainder = String::with_capacity(raw.len());
        remainder.push_str(base);
        let mut sep = '?';

        for pair in query.split('&') {
            if let (None, Some(value)) = (&scope, keyword_value(pair, SCOPE_KEYWORD)) {
                scope = Some(ScopeSpecification::from_external_form(&decode(value)?)?);
            } else if let (None, Some(value)) = (&coherence, keyword_value(pair, COHERENCE_KEYWORD)) {
                coherence = Some(CoherenceSpecification::from_external_form(&decode(value)?));
            } else {
                remainder.push(sep);
                remainder.push_str(pair);
                sep = '&';
            }
        }

        Ok(Self {
            identifier: factory.from_external_form(&remainder)?,
            coherence: coherence.flatten(),
            scope,
        })
    }

    #[must_use]
    pub fn to_external_form(&self) -> String {
        let mut ret = self.identifier.to_external_form();
        let mut sep = if ret.contains('?') { '&' } else { '?' };
        if let Some(scope) = &self.scope {
            ret.push(sep);
            ret.push_str(SCOPE_KEYWORD);
            ret.push('=');
            ret.push_str(&urlencoding::encode(&scope.to_external_form()));
            sep = '&';
        }
        if let Some(coherence) = &self.coherence {
            ret.push(sep);
            ret.push_str(COHERENCE_KEYWORD);
            ret.push('=');
            ret.push_str(&urlencoding::encode(&coherence.to_external_form()));
        }
        ret
    }
}

impl fmt::Display for NetMeshBaseAccessSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_external_form())
    }
}

impl FromStr for NetMeshBaseAccessSpecification {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_external_form(s)
    }
}

impl From<NetMeshBaseIdentifier> for NetMeshBaseAccessSpecification {
    fn from(identifier: NetMeshBaseIdentifier) -> Self {
        Self::new(identifier)
    }
}

fn keyword_value<'a>(pair: &'a str, keyword: &str) -> Option<&'a str> {
    pair.strip_prefix(keyword)?.strip_prefix('=')
}

fn decode(value: &str) -> ParseResult<String> {
    urlencoding::decode(value)
        .map(|v| v.into_owned())
        .map_err(|e| ParseError::InvalidArgument(format!("{value}: {e}")))
}
