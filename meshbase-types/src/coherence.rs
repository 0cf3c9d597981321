//! Coherence policies: how fresh a replica has to stay.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// External form of [`CoherenceSpecification::OneTimeOnly`].
pub const ONE_TIME_ONLY_TAG: &str = "org.infogrid.meshbase.net.CoherenceSpecification.ONE_TIME_ONLY";

/// Tag preceding the `{period}` argument of a periodic policy.
pub const PERIODIC_TAG: &str = "org.infogrid.meshbase.net.CoherenceSpecification$Periodic";

/// Tag preceding the `{fallback,max,factor}` arguments of an adaptive policy.
pub const ADAPTIVE_PERIODIC_TAG: &str =
    "org.infogrid.meshbase.net.CoherenceSpecification$AdaptivePeriodic";

/// Refresh policy of a replica.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoherenceSpecification {
    /// Fetch once, never refresh.
    OneTimeOnly,
    /// Refresh every `period_ms` milliseconds.
    Periodic { period_ms: u64 },
    /// Refresh after `fallback_delay_ms` following a change; every check
    /// that finds nothing new multiplies the delay by `adaptive_factor`,
    /// capped at `max_delay_ms`.
    AdaptivePeriodic {
        fallback_delay_ms: u64,
        max_delay_ms: u64,
        adaptive_factor: f64,
    },
}

type Parser = fn(&str) -> Option<CoherenceSpecification>;

/// Tried in order, first hit wins.
const PARSERS: [Parser; 3] = [parse_one_time_only, parse_periodic, parse_adaptive_periodic];

impl CoherenceSpecification {
    /// Parses an external form. Returns `None` for anything unrecognised;
    /// the caller decides which default applies.
    #[must_use]
    pub fn from_external_form(ext: &str) -> Option<Self> {
        PARSERS.iter().find_map(|parse| parse(ext))
    }

    #[must_use]
    pub fn to_external_form(&self) -> String {
        match self {
            Self::OneTimeOnly => ONE_TIME_ONLY_TAG.to_string(),
            Self::Periodic { period_ms } => format!("{PERIODIC_TAG}{{{period_ms}}}"),
            Self::AdaptivePeriodic {
                fallback_delay_ms,
                max_delay_ms,
                adaptive_factor,
            } => format!(
                "{ADAPTIVE_PERIODIC_TAG}{{{fallback_delay_ms},{max_delay_ms},{}}}",
                format_factor(*adaptive_factor)
            ),
        }
    }

    /// Whether a replica under this policy is ever refreshed.
    #[must_use]
    pub const fn is_one_time_only(&self) -> bool {
        matches!(self, Self::OneTimeOnly)
    }
}

impl Default for CoherenceSpecification {
    fn default() -> Self {
        CoherenceDefaults::default().coherence()
    }
}

impl PartialEq for CoherenceSpecification {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::OneTimeOnly, Self::OneTimeOnly) => true,
            (Self::Periodic { period_ms: a }, Self::Periodic { period_ms: b }) => a == b,
            (
                Self::AdaptivePeriodic {
                    fallback_delay_ms: f1,
                    max_delay_ms: m1,
                    adaptive_factor: a1,
                },
                Self::AdaptivePeriodic {
                    fallback_delay_ms: f2,
                    max_delay_ms: m2,
                    adaptive_factor: a2,
                },
            ) => f1 == f2 && m1 == m2 && a1.to_bits() == a2.to_bits(),
            _ => false,
        }
    }
}

impl Eq for CoherenceSpecification {}

impl Hash for CoherenceSpecification {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::OneTimeOnly => {}
            Self::Periodic { period_ms } => period_ms.hash(state),
            Self::AdaptivePeriodic {
                fallback_delay_ms,
                max_delay_ms,
                adaptive_factor,
            } => {
                fallback_delay_ms.hash(state);
                max_delay_ms.hash(state);
                adaptive_factor.to_bits().hash(state);
            }
        }
    }
}

impl fmt::Display for CoherenceSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_external_form())
    }
}

impl FromStr for CoherenceSpecification {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_external_form(s)
            .ok_or_else(|| ParseError::InvalidArgument(format!("not a coherence specification: {s}")))
    }
}

/// Parameters of the default adaptive policy. Deployments override these
/// through configuration instead of hard-coding another default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoherenceDefaults {
    pub fallback_delay_ms: u64,
    pub max_delay_ms: u64,
    pub adaptive_factor: f64,
}

impl Default for CoherenceDefaults {
    fn default() -> Self {
        Self {
            fallback_delay_ms: 60 * 60 * 1000,
            max_delay_ms: 7 * 24 * 60 * 60 * 1000,
            adaptive_factor: 1.1,
        }
    }
}

impl CoherenceDefaults {
    #[must_use]
    pub const fn coherence(&self) -> CoherenceSpecification {
        CoherenceSpecification::AdaptivePeriodic {
            fallback_delay_ms: self.fallback_delay_ms,
            max_delay_ms: self.max_delay_ms,
            adaptive_factor: self.adaptive_factor,
        }
    }
}

// ── Parsers ────────────────────────────────────────────────────────

fn parse_one_time_only(ext: &str) -> Option<CoherenceSpecification> {
    (ext == ONE_TIME_ONLY_TAG).then_some(CoherenceSpecification::OneTimeOnly)
}

fn parse_periodic(ext: &str) -> Option<CoherenceSpecification> {
    let args = braced_args(ext, PERIODIC_TAG)?;
    Some(CoherenceSpecification::Periodic {
        period_ms: parse_millis(args)?,
    })
}

fn parse_adaptive_periodic(ext: &str) -> Option<CoherenceSpecification> {
    let args = braced_args(ext, ADAPTIVE_PERIODIC_TAG)?;
    let mut parts = args.split(',');
    let fallback_delay_ms = parse_millis(parts.next()?)?;
    let max_delay_ms = parse_millis(parts.next()?)?;
    let adaptive_factor = parse_factor(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some(CoherenceSpecification::AdaptivePeriodic {
        fallback_delay_ms,
        max_delay_ms,
        adaptive_factor,
    })
}

/// `TAG{args}` => `args`
fn braced_args<'a>(ext: &'a str, tag: &str) -> Option<&'a str> {
    ext.strip_prefix(tag)?.strip_prefix('{')?.strip_suffix('}')
}

fn parse_millis(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Digits, one decimal point, digits. No sign or exponent.
fn parse_factor(s: &str) -> Option<f64> {
    let (int, frac) = s.split_once('.')?;
    let digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
    if !digits(int) || !digits(frac) || (int.is_empty() && frac.is_empty()) {
        return None;
    }
    s.parse().ok()
}

fn format_factor(factor: f64) -> String {
    let mut s = factor.to_string();
    if factor.is_finite() && !s.contains('.') {
        s.push_str(".0");
    }
    s
}
