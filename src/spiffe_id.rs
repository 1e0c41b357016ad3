//! SPIFFE ID types and validation

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// URI scheme every SPIFFE ID must use (case-sensitive)
pub const SPIFFE_SCHEME: &str = "spiffe";

/// An administrative namespace for SPIFFE IDs and their signing authorities
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrustDomain(String);

impl TrustDomain {
    /// Create a trust domain from its name (for example `example.org`)
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let name = name.as_ref();
        let violations = trust_domain_violations(name);
        if !violations.is_empty() {
            return Err(Error::InvalidIdentityFormat {
                input: name.to_string(),
                violations,
            });
        }
        Ok(TrustDomain(name.to_string()))
    }

    /// Get the trust domain name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The SPIFFE ID naming the trust domain itself (empty path)
    pub fn id(&self) -> SpiffeId {
        SpiffeId {
            trust_domain: self.clone(),
            path: String::new(),
        }
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TrustDomain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for TrustDomain {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TrustDomain> for String {
    fn from(td: TrustDomain) -> Self {
        td.0
    }
}

/// A SPIFFE ID uniquely identifies a workload
///
/// Equality is structural and case-sensitive on both the trust domain and the path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    path: String,
}

impl SpiffeId {
    /// Create a new SPIFFE ID from trust domain and path
    ///
    /// A missing leading `/` is added; an empty path names the trust domain root.
    ///
    /// # Examples
    /// ```
    /// use spiffe_tls::SpiffeId;
    ///
    /// let id = SpiffeId::new("example.org", "/service/web").unwrap();
    /// assert_eq!(id.to_string(), "spiffe://example.org/service/web");
    /// ```
    pub fn new(trust_domain: impl AsRef<str>, path: impl AsRef<str>) -> Result<Self> {
        let trust_domain = TrustDomain::new(trust_domain)?;
        let path = path.as_ref();

        let path = if path.is_empty() || path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        Self::parse(format!("{}://{}{}", SPIFFE_SCHEME, trust_domain, path))
    }

    /// Parse a SPIFFE ID from a string
    ///
    /// All grammar rules are checked together and every violation is reported.
    ///
    /// # Examples
    /// ```
    /// use spiffe_tls::SpiffeId;
    ///
    /// let id = SpiffeId::parse("spiffe://example.org/service/web").unwrap();
    /// assert_eq!(id.trust_domain().as_str(), "example.org");
    /// assert_eq!(id.path(), "/service/web");
    /// ```
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let input = s.as_ref();
        let mut violations = Vec::new();

        // url lowercases schemes, so the case-sensitive check runs on the raw input
        match input.split_once("://") {
            Some((scheme, _)) if scheme == SPIFFE_SCHEME => {}
            Some((scheme, _)) => violations.push(format!(
                "scheme must be '{}', got '{}'",
                SPIFFE_SCHEME, scheme
            )),
            None => violations.push(format!("missing '{}://' prefix", SPIFFE_SCHEME)),
        }

        let url = match Url::parse(input) {
            Ok(url) => url,
            Err(e) => {
                violations.push(format!("not a valid URI: {}", e));
                return Err(Error::InvalidIdentityFormat {
                    input: input.to_string(),
                    violations,
                });
            }
        };

        if !url.username().is_empty() || url.password().is_some() {
            violations.push("user info is not allowed".to_string());
        }
        if url.port().is_some() {
            violations.push("port is not allowed".to_string());
        }
        if url.query().is_some() {
            violations.push("query is not allowed".to_string());
        }
        if url.fragment().is_some() {
            violations.push("fragment is not allowed".to_string());
        }

        let host = url.host_str().unwrap_or_default();
        violations.extend(trust_domain_violations(host));

        let path = url.path();
        violations.extend(path_violations(raw_path(input)));

        if violations.is_empty() {
            let canonical = format!("{}://{}{}", SPIFFE_SCHEME, host, path);
            if canonical != input {
                violations.push(format!("must be in canonical form '{}'", canonical));
            }
        }

        if !violations.is_empty() {
            return Err(Error::InvalidIdentityFormat {
                input: input.to_string(),
                violations,
            });
        }

        Ok(SpiffeId {
            trust_domain: TrustDomain(host.to_string()),
            path: path.to_string(),
        })
    }

    /// Get the trust domain
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Get the path component (empty for the trust domain root)
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check if this ID belongs to the specified trust domain
    pub fn is_member_of(&self, trust_domain: &TrustDomain) -> bool {
        &self.trust_domain == trust_domain
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", SPIFFE_SCHEME, self.trust_domain, self.path)
    }
}

impl FromStr for SpiffeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SpiffeId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<SpiffeId> for String {
    fn from(id: SpiffeId) -> Self {
        id.to_string()
    }
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')
}

fn trust_domain_violations(name: &str) -> Vec<String> {
    if name.is_empty() {
        return vec!["trust domain must not be empty".to_string()];
    }

    let mut bad: Vec<char> = name.chars().filter(|c| !is_id_char(*c)).collect();
    bad.dedup();
    bad.into_iter()
        .map(|c| format!("trust domain contains invalid character '{}'", c))
        .collect()
}

/// Path as written in the input, before any URL normalisation
fn raw_path(input: &str) -> &str {
    let rest = input.split_once("://").map(|(_, rest)| rest).unwrap_or(input);
    let rest = match rest.find(|c: char| matches!(c, '/' | '?' | '#')) {
        Some(i) => &rest[i..],
        None => "",
    };
    match rest.find(|c: char| matches!(c, '?' | '#')) {
        Some(i) => &rest[..i],
        None => rest,
    }
}

fn path_violations(path: &str) -> Vec<String> {
    let mut violations = Vec::new();
    if path.is_empty() {
        return violations;
    }
    if !path.starts_with('/') {
        violations.push("path must begin with '/'".to_string());
        return violations;
    }

    for segment in path[1..].split('/') {
        match segment {
            "" => {
                violations.push("path must not contain empty segments or a trailing '/'".into())
            }
            "." | ".." => violations.push("path must not contain '.' or '..' segments".into()),
            s => {
                if let Some(c) = s.chars().find(|c| !is_id_char(*c)) {
                    violations.push(format!("path contains invalid character '{}'", c));
                }
            }
        }
    }
    violations.dedup();
    violations
}
