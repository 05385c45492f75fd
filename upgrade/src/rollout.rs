use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use crate::watcher::Error;

/// Grid network a node runs in. The OS repository publishes one tag link
/// per network, named after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Production,
    Testing,
    Qa,
    Development,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Network::Production => "production",
            Network::Testing => "testing",
            Network::Qa => "qa",
            Network::Development => "development",
        })
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" | "prod" | "main" => Ok(Network::Production),
            "testing" | "test" => Ok(Network::Testing),
            "qa" => Ok(Network::Qa),
            "development" | "dev" => Ok(Network::Development),
            other => Err(format!("unknown network {}", other)),
        }
    }
}

/// Whether nodes of a network may adopt a new version yet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct RolloutConfig {
    #[serde(default)]
    pub test_farms: HashSet<u32>,
    #[serde(default)]
    pub safe_to_upgrade: bool,
}

impl RolloutConfig {
    pub fn allows(&self, farm_id: u32) -> bool {
        self.safe_to_upgrade || self.test_farms.contains(&farm_id)
    }
}

/// Fetches the rollout document and returns the policy for `network`.
///
/// The whole document is rejected if it holds a key which is not a
/// [Network].
#[instrument(skip(client), fields(%url), err)]
pub async fn read_rollout_config(
    client: &reqwest::Client,
    url: &Url,
    network: Network,
) -> Result<RolloutConfig, Error> {
    let resp = client
        .get(url.clone())
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::Rollout(e.to_string()))?;
    let body = resp
        .bytes()
        .await
        .map_err(|e| Error::Rollout(e.to_string()))?;

    let mut doc: HashMap<Network, RolloutConfig> = serde_json::from_slice(&body)
        .map_err(|e| Error::Rollout(format!("invalid rollout document: {}", e)))?;
    debug!(networks = doc.len(), "rollout document");

    doc.remove(&network)
        .ok_or_else(|| Error::Rollout(format!("no rollout policy for {}", network)))
}
