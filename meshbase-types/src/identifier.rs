//! NetMeshBase identifiers and the factory that parses them.
//!
//! An identifier is the canonical, protocol-validated address of a peer
//! MeshBase. Two identifiers are the same peer exactly when their canonical
//! strings are equal; the URI is carried alongside for resolution only.

use crate::object_id::MeshObjectIdentifier;
use crate::{ParseError, ParseResult};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;

/// Default location of the XRI resolver.
pub const DEFAULT_XRI_RESOLVER_PREFIX: &str = "http://xri.net/";

/// Returns true if `c` opens an XRI global context (`= @ + $ !`).
#[must_use]
pub const fn is_xri_global_context_symbol(c: char) -> bool {
    matches!(c, '=' | '@' | '+' | '$' | '!')
}

/// Canonical address of a NetMeshBase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetMeshBaseIdentifier {
    canonical: String,
    uri: String,
    restfully_resolvable: bool,
}

impl NetMeshBaseIdentifier {
    fn new(canonical: String, uri: String, restfully_resolvable: bool) -> Self {
        Self {
            canonical,
            uri,
            restfully_resolvable,
        }
    }

    /// The canonical form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The canonical form, suitable for [`NetMeshBaseIdentifierFactory::from_external_form`].
    #[must_use]
    pub fn to_external_form(&self) -> String {
        self.canonical.clone()
    }

    /// The URI this identifier resolves through. Equal to the canonical
    /// form except for XRI identifiers.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Scheme of the resolution URI, e.g. `http` or `file`.
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.uri.split(':').next().unwrap_or_default()
    }

    #[must_use]
    pub const fn is_restfully_resolvable(&self) -> bool {
        self.restfully_resolvable
    }

    /// Identifier of the home object of the MeshBase at this address.
    #[must_use]
    pub fn home_object(&self) -> MeshObjectIdentifier {
        MeshObjectIdentifier::home_of(self.clone())
    }
}

impl PartialEq for NetMeshBaseIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for NetMeshBaseIdentifier {}

impl Hash for NetMeshBaseIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for NetMeshBaseIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NetMeshBaseIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Display for NetMeshBaseIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for NetMeshBaseIdentifier {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NetMeshBaseIdentifierFactory::default().from_external_form(s)
    }
}

/// A protocol the factory accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    pub name: String,
    /// Whether identifiers with this protocol can be dereferenced into a stream.
    pub restfully_resolvable: bool,
}

impl Protocol {
    #[must_use]
    pub fn new(name: impl Into<String>, restfully_resolvable: bool) -> Self {
        Self {
            name: name.into(),
            restfully_resolvable,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Parses and guesses [`NetMeshBaseIdentifier`]s.
///
/// Holds only immutable configuration and can be shared freely between
/// threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetMeshBaseIdentifierFactory {
    protocols: Vec<Protocol>,
    xri_resolver_prefix: String,
}

impl Default for NetMeshBaseIdentifierFactory {
    fn default() -> Self {
        Self {
            protocols: vec![
                Protocol::new("http", true),
                Protocol::new("https", true),
                Protocol::new("file", true),
            ],
            xri_resolver_prefix: DEFAULT_XRI_RESOLVER_PREFIX.to_string(),
        }
    }
}

impl NetMeshBaseIdentifierFactory {
    /// Creates a factory with a custom protocol allow-list.
    #[must_use]
    pub fn new(protocols: Vec<Protocol>, xri_resolver_prefix: impl Into<String>) -> Self {
        Self {
            protocols,
            xri_resolver_prefix: xri_resolver_prefix.into(),
        }
    }

    #[must_use]
    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    #[must_use]
    pub fn xri_resolver_prefix(&self) -> &str {
        &self.xri_resolver_prefix
    }

    /// Strict parse: the protocol must be given explicitly.
    pub fn from_external_form(&self, raw: &str) -> ParseResult<NetMeshBaseIdentifier> {
        self.obtain(None, raw, false)
    }

    /// Lenient parse: a string without `://` is assumed to be `http://`.
    pub fn guess_from_external_form(&self, raw: &str) -> ParseResult<NetMeshBaseIdentifier> {
        self.obtain(None, raw, true)
    }

    /// Lenient parse relative to `context`: a string without `://` is
    /// resolved against the context's directory.
    pub fn guess_from_external_form_in_context(
        &self,
        context: &NetMeshBaseIdentifier,
        raw: &str,
    ) -> ParseResult<NetMeshBaseIdentifier> {
        self.obtain(Some(context), raw, true)
    }

    /// Identifier for a file on the local file system.
    pub fn from_path(&self, path: &Path) -> ParseResult<NetMeshBaseIdentifier> {
        let absolute = std::path::absolute(path).map_err(|e| {
            ParseError::identifier(path.to_string_lossy(), format!("cannot make path absolute: {e}"))
        })?;
        let lossy = absolute.to_string_lossy().replace('\\', "/");
        let encoded: Vec<Cow<'_, str>> = lossy.split('/').map(urlencoding::encode).collect();
        let mut joined = encoded.join("/");
        if !joined.starts_with('/') {
            joined.insert(0, '/');
        }
        self.obtain(None, &format!("file:{joined}"), false)
    }

    fn obtain(
        &self,
        context: Option<&NetMeshBaseIdentifier>,
        raw: &str,
        guess: bool,
    ) -> ParseResult<NetMeshBaseIdentifier> {
        let string = strip_default_port(raw.trim());

        if string.is_empty() {
            return Err(ParseError::identifier(raw, "identifier cannot be empty String"));
        }

        if string.starts_with(is_xri_global_context_symbol) {
            return self.xri(&string);
        }
        if let Some(rest) = string.strip_prefix(self.xri_resolver_prefix.as_str()) {
            if rest.is_empty() {
                return Err(ParseError::identifier(raw, "missing XRI after resolver prefix"));
            }
            return self.xri(rest);
        }

        let mut string = string.into_owned();
        if guess && !string.contains("://") {
            let prefix = context.and_then(|c| {
                let form = c.as_str();
                match form.rfind('/') {
                    Some(last_slash) if last_slash > 0 => Some(&form[..last_slash]),
                    _ => None,
                }
            });
            string = match prefix {
                Some(prefix) => format!("{prefix}/{string}"),
                None if string.contains('/') => format!("http://{string}"),
                // A bare host such as `cnn.com` names the site root.
                None => format!("http://{string}/"),
            };
        }

        check_uri_syntax(&string)?;

        let lower = string.to_ascii_lowercase();
        for protocol in &self.protocols {
            let name = protocol.name.to_ascii_lowercase();
            if lower.starts_with(&name) && lower[name.len()..].starts_with(':') {
                let uri = string.clone();
                return Ok(NetMeshBaseIdentifier::new(
                    string,
                    uri,
                    protocol.restfully_resolvable,
                ));
            }
        }

        let supported: Vec<&str> = self.protocols.iter().map(|p| p.name.as_str()).collect();
        Err(ParseError::UnsupportedProtocol {
            input: string,
            supported: supported.join(", "),
        })
    }

    fn xri(&self, xri: &str) -> ParseResult<NetMeshBaseIdentifier> {
        let uri = format!("{}{}", self.xri_resolver_prefix, xri);
        check_uri_syntax(&uri)?;
        Ok(NetMeshBaseIdentifier::new(xri.to_string(), uri, true))
    }
}

/// Removes the scheme's default port: `:80` from `http://host:80/...` and
/// `:443` from `https://host:443/...`.
fn strip_default_port(s: &str) -> Cow<'_, str> {
    let (scheme_len, default_port) = if s.starts_with("http://") {
        ("http://".len(), ":80")
    } else if s.starts_with("https://") {
        ("https://".len(), ":443")
    } else {
        return Cow::Borrowed(s);
    };

    let rest = &s[scheme_len..];
    let Some(host_len) = rest.find(['/', ':']) else {
        return Cow::Borrowed(s);
    };
    if host_len == 0 {
        return Cow::Borrowed(s);
    }
    match rest[host_len..].strip_prefix(default_port) {
        Some(tail) if tail.starts_with('/') => {
            Cow::Owned(format!("{}{}", &s[..scheme_len + host_len], tail))
        }
        _ => Cow::Borrowed(s),
    }
}

/// Minimal RFC 3986 check: a well-formed scheme, no whitespace or
/// delimiter characters that must be escaped, and valid percent escapes.
fn check_uri_syntax(s: &str) -> ParseResult<()> {
    let Some(colon) = s.find(':') else {
        return Err(ParseError::identifier(s, "missing scheme"));
    };
    let scheme = &s[..colon];
    let mut chars = scheme.chars();
    let scheme_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !scheme_ok {
        return Err(ParseError::identifier(s, "illegal character in scheme name"));
    }
    if colon + 1 == s.len() {
        return Err(ParseError::identifier(s, "expected scheme-specific part"));
    }

    let bytes = s.as_bytes();
    let mut i = 0;
    for c in s.chars() {
        if c.is_whitespace() || c.is_control() {
            return Err(ParseError::identifier(s, format!("illegal character at index {i}")));
        }
        if matches!(c, '"' | '<' | '>' | '\\' | '^' | '`' | '{' | '|' | '}') {
            return Err(ParseError::identifier(s, format!("illegal character at index {i}")));
        }
        if c == '%' {
            let valid = bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
                && bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit);
            if !valid {
                return Err(ParseError::identifier(s, format!("malformed escape pair at index {i}")));
            }
        }
        i += c.len_utf8();
    }
    Ok(())
}
