//! Managed client configuration

use crate::error::{Error, Result};
use crate::policy::VerificationPolicy;
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::svid::RotationMargin;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff between failed rotation attempts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    /// Upper bound on the delay
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    /// Growth factor applied after each consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Check the values are consistent
    pub fn validate(&self) -> Result<()> {
        if self.initial.is_zero() {
            return Err(Error::config_error(
                "rotation_retry_backoff.initial must be greater than zero",
            ));
        }
        if self.initial > self.max {
            return Err(Error::config_error(format!(
                "rotation_retry_backoff.initial ({:?}) exceeds max ({:?})",
                self.initial, self.max
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::config_error(format!(
                "rotation_retry_backoff.multiplier must be at least 1, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Delay to use after a failure, given the delay used after the previous one
    pub fn next_delay(&self, previous: Option<Duration>) -> Duration {
        match previous {
            None => self.initial,
            Some(prev) => Duration::try_from_secs_f64(prev.as_secs_f64() * self.multiplier)
                .unwrap_or(self.max)
                .min(self.max),
        }
    }
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(300)
}

/// Configuration for a [`ManagedCredentialClient`](crate::ManagedCredentialClient)
///
/// `trust_domain` and `default_policy` are required; everything else has a default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManagedClientConfig {
    /// Trust domain whose bundle is kept fresh
    pub trust_domain: TrustDomain,
    /// Policy applied to peers when the caller does not name one
    pub default_policy: VerificationPolicy,
    /// Identity to request from the credential source
    #[serde(default)]
    pub identity_hint: Option<SpiffeId>,
    /// Additional trust domains whose bundles are fetched
    #[serde(default)]
    pub federated_trust_domains: Vec<TrustDomain>,
    /// How early before expiry to rotate
    #[serde(default)]
    pub rotation_margin: RotationMargin,
    /// Backoff between failed rotation attempts
    #[serde(default)]
    pub rotation_retry_backoff: BackoffConfig,
    /// Bound on each call to the credential source
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Longest wait between bundle refreshes
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl ManagedClientConfig {
    /// Create a configuration with defaults for everything optional
    pub fn new(trust_domain: TrustDomain, default_policy: VerificationPolicy) -> Self {
        ManagedClientConfig {
            trust_domain,
            default_policy,
            identity_hint: None,
            federated_trust_domains: Vec::new(),
            rotation_margin: RotationMargin::default(),
            rotation_retry_backoff: BackoffConfig::default(),
            fetch_timeout: default_fetch_timeout(),
            refresh_interval: default_refresh_interval(),
        }
    }

    /// Request a specific identity from the credential source
    pub fn with_identity_hint(mut self, hint: SpiffeId) -> Self {
        self.identity_hint = Some(hint);
        self
    }

    /// Also keep the bundle for `trust_domain`
    pub fn with_federated_trust_domain(mut self, trust_domain: TrustDomain) -> Self {
        self.federated_trust_domains.push(trust_domain);
        self
    }

    /// Set the rotation margin
    pub fn with_rotation_margin(mut self, margin: RotationMargin) -> Self {
        self.rotation_margin = margin;
        self
    }

    /// Set the retry backoff
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.rotation_retry_backoff = backoff;
        self
    }

    /// Set the timeout for each credential source call
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the longest wait between bundle refreshes
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ManagedClientConfig = serde_json::from_str(json)
            .map_err(|e| Error::config_error(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every option
    pub fn validate(&self) -> Result<()> {
        self.rotation_margin.validate()?;
        self.rotation_retry_backoff.validate()?;

        if self.fetch_timeout.is_zero() {
            return Err(Error::config_error("fetch_timeout must be greater than zero"));
        }
        if self.refresh_interval.is_zero() {
            return Err(Error::config_error("refresh_interval must be greater than zero"));
        }
        if self.federated_trust_domains.contains(&self.trust_domain) {
            return Err(Error::config_error(format!(
                "federated_trust_domains must not repeat the primary trust domain {}",
                self.trust_domain
            )));
        }

        Ok(())
    }

    /// Every trust domain whose bundle is fetched, primary first
    pub fn bundle_domains(&self) -> impl Iterator<Item = &TrustDomain> {
        std::iter::once(&self.trust_domain).chain(self.federated_trust_domains.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn td(name: &str) -> TrustDomain {
        TrustDomain::new(name).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = ManagedClientConfig::new(td("example.org"), VerificationPolicy::AcceptAny);
        assert!(config.validate().is_ok());
        assert_eq!(config.rotation_margin, RotationMargin::FractionOfLifetime(0.5));
        assert_eq!(config.rotation_retry_backoff.initial, Duration::from_secs(1));
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_from_json() {
        let config = ManagedClientConfig::from_json_str(
            r#"{
                "trust_domain": "example.org",
                "default_policy": {"accept_member_of": "example.org"},
                "rotation_margin": {"absolute": "5m"},
                "rotation_retry_backoff": {"initial": "500ms", "max": "30s"},
                "federated_trust_domains": ["partner.org"],
                "fetch_timeout": "3s"
            }"#,
        )
        .unwrap();

        assert_eq!(config.rotation_margin, RotationMargin::Absolute(Duration::from_secs(300)));
        assert_eq!(config.rotation_retry_backoff.initial, Duration::from_millis(500));
        assert_eq!(config.rotation_retry_backoff.multiplier, 2.0);
        assert_eq!(config.fetch_timeout, Duration::from_secs(3));
        assert_eq!(config.refresh_interval, Duration::from_secs(300));
        assert_eq!(config.bundle_domains().count(), 2);
    }

    #[test]
    fn test_policy_is_required() {
        let result = ManagedClientConfig::from_json_str(r#"{"trust_domain": "example.org"}"#);
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_validation_failures() {
        let base = ManagedClientConfig::new(td("example.org"), VerificationPolicy::AcceptAny);

        assert!(base.clone().with_fetch_timeout(Duration::ZERO).validate().is_err());
        assert!(base
            .clone()
            .with_federated_trust_domain(td("example.org"))
            .validate()
            .is_err());
        assert!(base
            .clone()
            .with_rotation_margin(RotationMargin::FractionOfLifetime(1.5))
            .validate()
            .is_err());

        let inverted = BackoffConfig {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        };
        assert!(base.clone().with_backoff(inverted).validate().is_err());

        let shrinking = BackoffConfig {
            multiplier: 0.5,
            ..BackoffConfig::default()
        };
        assert!(base.with_backoff(shrinking).validate().is_err());
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let backoff = BackoffConfig::default();
        let mut delay = None;
        let mut seen = Vec::new();
        for _ in 0..8 {
            let next = backoff.next_delay(delay);
            seen.push(next.as_secs());
            delay = Some(next);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_backoff_near_duration_max_saturates() {
        let backoff = BackoffConfig {
            initial: Duration::from_secs(1),
            max: Duration::MAX,
            multiplier: 2.0,
        };
        assert!(backoff.validate().is_ok());
        let past_half = Duration::MAX / 2 + Duration::from_secs(1);
        assert_eq!(backoff.next_delay(Some(past_half)), Duration::MAX);
        assert_eq!(backoff.next_delay(Some(Duration::MAX)), Duration::MAX);
    }
}
