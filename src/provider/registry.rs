use super::{PaymentProvider, ProviderConfig, ProviderType};
use crate::error::{PaymentError, Result, codes};
use std::collections::HashMap;
use std::sync::Arc;

/// Collects and initializes providers before they are shared.
#[derive(Default)]
pub struct ProviderRegistryBuilder {
    providers: HashMap<ProviderType, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes `provider` with `config` and registers it under
    /// `provider_type`, replacing any earlier registration.
    pub fn register<P>(
        mut self,
        provider_type: ProviderType,
        mut provider: P,
        config: &ProviderConfig,
    ) -> Result<Self>
    where
        P: PaymentProvider + 'static,
    {
        provider.initialize(config).map_err(|e| {
            tracing::error!(provider = %provider_type, error = %e, "Failed to initialize provider");
            e
        })?;
        self.providers.insert(provider_type, Arc::new(provider));
        Ok(self)
    }

    pub fn build(self) -> ProviderRegistry {
        tracing::info!(providers = self.providers.len(), "Provider registry built");
        ProviderRegistry {
            providers: self.providers,
        }
    }
}

/// Immutable lookup of initialized providers by type.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderType, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::new()
    }

    pub fn get(&self, provider_type: &ProviderType) -> Result<Arc<dyn PaymentProvider>> {
        self.providers.get(provider_type).cloned().ok_or_else(|| {
            PaymentError::validation(
                codes::UNSUPPORTED_PROVIDER,
                format!("Unsupported payment provider: {provider_type}"),
            )
        })
    }

    /// Registered provider types, sorted.
    pub fn supported(&self) -> Vec<ProviderType> {
        let mut types: Vec<ProviderType> = self.providers.keys().cloned().collect();
        types.sort();
        types
    }
}
