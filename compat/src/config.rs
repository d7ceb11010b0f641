//! File-based configuration for a [Harness](crate::Harness).

use crate::{barrier, registry::Registry, Error};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bound on the duration of a single scenario.
const DEFAULT_SCENARIO_TIMEOUT: Duration = Duration::from_secs(600);

/// A version label and the flags its nodes are started with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub label: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// Harness configuration, usually read from YAML.
///
/// ```yaml
/// versions:
///   - label: "01140500"
///     flags: ["-minrelaytxfee=0.001", "-debug"]
/// barrier:
///   interval_ms: 250
///   max_rounds: 120
/// scenario_timeout_ms: 60000
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Versions, in registration order.
    pub versions: Vec<Version>,

    #[serde(default)]
    pub barrier: barrier::Config,

    #[serde(
        rename = "scenario_timeout_ms",
        with = "millis",
        default = "default_scenario_timeout"
    )]
    pub scenario_timeout: Duration,
}

fn default_scenario_timeout() -> Duration {
    DEFAULT_SCENARIO_TIMEOUT
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Register every version, in file order.
    pub fn registry(&self) -> Result<Registry, Error> {
        let mut registry = Registry::new();
        for version in &self.versions {
            registry.register(&version.label, version.flags.iter().cloned())?;
        }
        Ok(registry)
    }

    /// Build the [crate::Config] for a [Harness](crate::Harness).
    pub fn harness(&self) -> Result<crate::Config, Error> {
        Ok(crate::Config {
            registry: self.registry()?,
            barrier: self.barrier,
            scenario_timeout: self.scenario_timeout,
        })
    }
}

/// Serialize a [Duration] as whole milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEES: &str = include_str!("../fixtures/fees.yaml");
    const SPAM: &str = include_str!("../fixtures/spam.yaml");

    #[test]
    fn test_fees_fixture() {
        let config = Config::from_yaml(FEES).unwrap();
        let registry = config.registry().unwrap();
        assert_eq!(
            registry.labels().collect::<Vec<_>>(),
            ["01140300", "01140400", "01140500"]
        );
        let legacy = registry.resolve("01140300").unwrap();
        assert_eq!(legacy.flags()[1], "-minrelaytxfee=1");
        assert_eq!(
            registry.resolve("01140400").unwrap().flags(),
            ["-txindex", "-debug"]
        );
        assert_eq!(config.barrier.interval, Duration::from_millis(100));
        assert_eq!(config.barrier.max_rounds, 50);
        assert_eq!(config.scenario_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_spam_fixture() {
        let config = Config::from_yaml(SPAM).unwrap();
        let harness = config.harness().unwrap();
        assert_eq!(harness.registry.len(), 1);
        assert!(harness
            .registry
            .resolve("mempool-spam")
            .unwrap()
            .flags()
            .contains(&"-maxmempool=1".to_string()));
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml("versions: [{ label: a }]").unwrap();
        assert_eq!(config.barrier, barrier::Config::default());
        assert_eq!(config.scenario_timeout, DEFAULT_SCENARIO_TIMEOUT);
        assert!(config.versions[0].flags.is_empty());

        // Partial barrier settings keep the remaining defaults
        let config =
            Config::from_yaml("versions: []\nbarrier:\n  max_rounds: 3\n").unwrap();
        assert_eq!(config.barrier.max_rounds, 3);
        assert_eq!(config.barrier.interval, barrier::Config::default().interval);

        // Round trip
        let yaml = config.to_yaml().unwrap();
        assert_eq!(Config::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(
            Config::from_yaml("versions: 7"),
            Err(Error::Config(_))
        ));
        let config = Config::from_yaml("versions: [{ label: a }, { label: a }]").unwrap();
        assert!(matches!(
            config.registry(),
            Err(Error::DuplicateVersion(label)) if label == "a"
        ));
    }
}
