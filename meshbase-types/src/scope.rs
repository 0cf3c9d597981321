//! Traversal bounds for remote fetches.

use crate::{ParseError, ParseResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tag preceding the `{steps}` argument.
pub const SCOPE_TAG: &str = "org.infogrid.meshbase.net.ScopeSpecification";

/// Bounds how far from the requested object a fetch may pull in
/// neighbours, counted in relationship steps. A scope of 0 conveys the
/// requested object only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeSpecification {
    max_steps: u32,
}

impl ScopeSpecification {
    #[must_use]
    pub const fn new(max_steps: u32) -> Self {
        Self { max_steps }
    }

    #[must_use]
    pub const fn max_steps(&self) -> u32 {
        self.max_steps
    }

    /// Whether an object `candidate_steps` relationships away from the
    /// requested object falls inside this scope.
    #[must_use]
    pub const fn applies_to(&self, candidate_steps: u32) -> bool {
        candidate_steps <= self.max_steps
    }

    pub fn from_external_form(ext: &str) -> ParseResult<Self> {
        let steps = ext
            .strip_prefix(SCOPE_TAG)
            .and_then(|rest| rest.strip_prefix('{'))
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(|| ParseError::InvalidScope(ext.to_string()))?;
        if steps.is_empty() || !steps.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidScope(ext.to_string()));
        }
        let max_steps = steps
            .parse()
            .map_err(|_| ParseError::InvalidScope(ext.to_string()))?;
        Ok(Self { max_steps })
    }

    #[must_use]
    pub fn to_external_form(&self) -> String {
        format!("{SCOPE_TAG}{{{}}}", self.max_steps)
    }
}

impl fmt::Display for ScopeSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_external_form())
    }
}

impl FromStr for ScopeSpecification {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_external_form(s)
    }
}
