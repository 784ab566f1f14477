use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::LedgerGateway;
use crate::error::SweepError;

/// Everything the sweeper knows about one network
#[derive(Clone)]
pub struct NetworkProfile {
    pub name: String,
    pub gateway: Arc<dyn LedgerGateway>,
    /// Owner address that receives swept funds
    pub destination: Option<String>,
    pub confirmation_timeout: Duration,
    /// How long an unseen settlement stays claimed before it is rebuilt
    pub pending_expiry: Duration,
}

impl NetworkProfile {
    pub fn new(name: impl Into<String>, gateway: Arc<dyn LedgerGateway>) -> Self {
        Self {
            name: name.into(),
            gateway,
            destination: None,
            confirmation_timeout: Duration::from_secs(60),
            pending_expiry: Duration::from_secs(180),
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    pub fn with_pending_expiry(mut self, expiry: Duration) -> Self {
        self.pending_expiry = expiry;
        self
    }

    /// Signer and destination needed to sweep on this network.
    ///
    /// Missing pieces are configuration errors, never claim defects.
    pub fn transfer_identity(&self) -> Result<(String, String), SweepError> {
        let signer = self.gateway.signer_address().ok_or_else(|| {
            SweepError::Configuration(format!("network {} has no delegate signing identity", self.name))
        })?;
        let destination = self.destination.clone().ok_or_else(|| {
            SweepError::Configuration(format!("network {} has no destination address", self.name))
        })?;
        Ok((signer, destination))
    }
}

/// NetworkRegistry - resolves a record's symbolic network to its gateway
pub struct NetworkRegistry {
    networks: HashMap<String, NetworkProfile>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self {
            networks: HashMap::new(),
        }
    }

    /// SECURITY: Only call this during system initialization
    pub fn register(&mut self, profile: NetworkProfile) {
        info!("Registering ledger gateway for network: {}", profile.name);
        self.networks.insert(profile.name.clone(), profile);
    }

    pub fn get(&self, network: &str) -> Option<&NetworkProfile> {
        self.networks.get(network)
    }

    pub fn resolve(&self, network: &str) -> Result<&NetworkProfile, SweepError> {
        self.get(network)
            .ok_or_else(|| SweepError::Configuration(format!("unknown network: {}", network)))
    }

    pub fn registered_networks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.networks.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for NetworkRegistry {
    fn default() -> Self {
        Self::new()
    }
}
