//! Family → adapter lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use zapflow_core::config::HttpConfig;
use zapflow_core::traits::Gateway;
use zapflow_core::types::ChannelFamily;

use crate::evolution::EvolutionGateway;
use crate::telegram::TelegramGateway;
use crate::waha::WahaGateway;

/// One adapter per channel family.
#[derive(Clone, Default)]
pub struct Gateways {
    adapters: HashMap<ChannelFamily, Arc<dyn Gateway>>,
}

impl Gateways {
    pub fn new() -> Self {
        Self::default()
    }

    /// All three HTTP adapters sharing the configured timeout.
    pub fn from_config(http: &HttpConfig) -> Self {
        let timeout = Duration::from_secs(http.timeout_secs);
        let mut gateways = Self::new();
        gateways.register(Arc::new(WahaGateway::new(timeout)));
        gateways.register(Arc::new(EvolutionGateway::new(timeout)));
        gateways.register(Arc::new(TelegramGateway::new(timeout)));
        gateways
    }

    /// Register (or replace) the adapter for its family.
    pub fn register(&mut self, gateway: Arc<dyn Gateway>) {
        self.adapters.insert(gateway.family(), gateway);
    }

    pub fn get(&self, family: ChannelFamily) -> Option<Arc<dyn Gateway>> {
        self.adapters.get(&family).cloned()
    }
}
