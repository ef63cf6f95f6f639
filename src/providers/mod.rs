//! Named provider factories and capability descriptors (C5 —
//! ProviderRegistry).

pub mod adapter;
pub mod gateway;

use std::collections::HashMap;
use std::sync::Arc;

pub use adapter::{InvokeOptions, InvokeResult, ProviderAdapter};

pub const DEFAULT_PROVIDER_ID: &str = "openclaw";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Cli,
    Http,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderCapabilities {
    pub agent: bool,
    pub model: bool,
    pub auth: bool,
    pub passthrough: bool,
    pub reportees: bool,
    pub agent_create: bool,
    pub agent_delete: bool,
}

#[derive(Clone)]
pub struct Provider {
    pub id: String,
    pub kind: ProviderKind,
    pub capabilities: ProviderCapabilities,
    pub adapter: Arc<ProviderAdapter>,
}

/// Holds the set of providers known to this process, keyed by id.
pub struct ProviderRegistry {
    providers: HashMap<String, Provider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Provider) {
        self.providers.insert(provider.id.clone(), provider);
    }

    pub fn get(&self, id: &str) -> Option<&Provider> {
        self.providers.get(id)
    }

    pub fn default_provider(&self) -> Option<&Provider> {
        self.providers.get(DEFAULT_PROVIDER_ID)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
