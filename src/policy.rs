//! Peer identity verification policies

use crate::error::{Error, Result};
use crate::spiffe_id::{SpiffeId, TrustDomain};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rule deciding whether a verified peer identity is acceptable
///
/// Has no `Default`; every channel names its policy explicitly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPolicy {
    /// Accept any peer whose chain validates
    AcceptAny,
    /// Accept peers belonging to the given trust domain
    AcceptMemberOf(TrustDomain),
    /// Accept only this exact identity
    AcceptExact(SpiffeId),
    /// Accept any identity from the list
    AcceptOneOf(Vec<SpiffeId>),
}

/// Outcome of evaluating a policy against a peer identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The peer is acceptable
    Accept,
    /// The peer is not acceptable, with the reason
    Reject(String),
}

impl VerificationPolicy {
    /// Policy accepting members of `trust_domain`
    pub fn accept_member_of(trust_domain: TrustDomain) -> Self {
        VerificationPolicy::AcceptMemberOf(trust_domain)
    }

    /// Policy accepting exactly `id`
    pub fn accept_exact(id: SpiffeId) -> Self {
        VerificationPolicy::AcceptExact(id)
    }

    /// Evaluate the policy for a peer identity
    pub fn evaluate(&self, peer: &SpiffeId) -> PolicyDecision {
        match self {
            VerificationPolicy::AcceptAny => PolicyDecision::Accept,
            VerificationPolicy::AcceptMemberOf(td) if peer.is_member_of(td) => {
                PolicyDecision::Accept
            }
            VerificationPolicy::AcceptMemberOf(td) => PolicyDecision::Reject(format!(
                "{} is not a member of trust domain {}",
                peer, td
            )),
            VerificationPolicy::AcceptExact(expected) if expected == peer => PolicyDecision::Accept,
            VerificationPolicy::AcceptExact(expected) => {
                PolicyDecision::Reject(format!("{} is not {}", peer, expected))
            }
            VerificationPolicy::AcceptOneOf(allowed) if allowed.contains(peer) => {
                PolicyDecision::Accept
            }
            VerificationPolicy::AcceptOneOf(allowed) => PolicyDecision::Reject(format!(
                "{} is not one of the {} allowed identities",
                peer,
                allowed.len()
            )),
        }
    }

    /// Evaluate the policy, turning a rejection into [`Error::PolicyRejected`]
    pub fn verify(&self, peer: &SpiffeId) -> Result<()> {
        match self.evaluate(peer) {
            PolicyDecision::Accept => Ok(()),
            PolicyDecision::Reject(reason) => Err(Error::PolicyRejected(reason)),
        }
    }
}

impl fmt::Display for VerificationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationPolicy::AcceptAny => f.write_str("accept any"),
            VerificationPolicy::AcceptMemberOf(td) => write!(f, "accept members of {}", td),
            VerificationPolicy::AcceptExact(id) => write!(f, "accept exactly {}", id),
            VerificationPolicy::AcceptOneOf(ids) => write!(f, "accept one of {} ids", ids.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SpiffeId {
        SpiffeId::parse(s).unwrap()
    }

    #[test]
    fn test_accept_any() {
        let policy = VerificationPolicy::AcceptAny;
        assert_eq!(policy.evaluate(&id("spiffe://anything.org/x")), PolicyDecision::Accept);
    }

    #[test]
    fn test_accept_member_of() {
        let policy = VerificationPolicy::accept_member_of(TrustDomain::new("example.org").unwrap());

        assert!(policy.verify(&id("spiffe://example.org/server")).is_ok());
        assert!(policy.verify(&id("spiffe://example.org")).is_ok());
        assert!(matches!(
            policy.verify(&id("spiffe://other.org/server")),
            Err(Error::PolicyRejected(_))
        ));
        // membership is exact on the domain name
        assert!(policy.verify(&id("spiffe://sub.example.org/server")).is_err());
    }

    #[test]
    fn test_accept_exact() {
        let policy = VerificationPolicy::accept_exact(id("spiffe://example.org/db"));

        assert!(policy.verify(&id("spiffe://example.org/db")).is_ok());
        assert!(policy.verify(&id("spiffe://example.org/db/replica")).is_err());
        assert!(policy.verify(&id("spiffe://example.org/DB")).is_err());
    }

    #[test]
    fn test_accept_one_of() {
        let policy = VerificationPolicy::AcceptOneOf(vec![
            id("spiffe://example.org/a"),
            id("spiffe://example.org/b"),
        ]);

        assert!(policy.verify(&id("spiffe://example.org/b")).is_ok());
        assert!(matches!(
            policy.evaluate(&id("spiffe://example.org/c")),
            PolicyDecision::Reject(_)
        ));
        assert!(VerificationPolicy::AcceptOneOf(vec![])
            .verify(&id("spiffe://example.org/a"))
            .is_err());
    }

    #[test]
    fn test_policy_serde() {
        let policy: VerificationPolicy =
            serde_json::from_str(r#"{"accept_member_of":"example.org"}"#).unwrap();
        assert_eq!(
            policy,
            VerificationPolicy::AcceptMemberOf(TrustDomain::new("example.org").unwrap())
        );

        let policy: VerificationPolicy = serde_json::from_str(r#""accept_any""#).unwrap();
        assert_eq!(policy, VerificationPolicy::AcceptAny);

        let bad = serde_json::from_str::<VerificationPolicy>(r#"{"accept_exact":"http://x/y"}"#);
        assert!(bad.is_err());
    }
}
