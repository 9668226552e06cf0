//! Settings shared by an authority and its proxies.

use crate::authority::AuthorityConfig;
use crate::protocol::DEFAULT_CHANNEL_NAME;
use crate::proxy::ProxyConfig;
use crate::strategies::{Strategy, StrategyKind};
use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};

/// File-backed replication settings. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSettings {
    /// Channel connecting the authority with its proxies
    pub channel_name: String,
    /// Diff/patch strategy used on both ends
    pub strategy: StrategyKind,
    /// Number of proxies to start
    pub proxies: u32,
    /// Number of mutations each proxy sends
    pub mutations: u32,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            strategy: StrategyKind::default(),
            proxies: 2,
            mutations: 3,
        }
    }
}

impl ReplicationSettings {
    pub fn validate(&self) -> Result<()> {
        if self.channel_name.is_empty() {
            return Err(Error::invalid_config("channel_name must not be empty"));
        }
        Ok(())
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy.into()
    }

    pub fn authority_config(&self) -> AuthorityConfig {
        AuthorityConfig::new(self.channel_name.clone()).with_strategy(&self.strategy())
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig::new(self.channel_name.clone()).with_strategy(&self.strategy())
    }
}
