use std::collections::HashMap;
use std::sync::Arc;

use sacco_ledger::PaymentMethod;

use super::provider::{PaymentProvider, ProviderError};

/// Payment providers by the method they serve.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<PaymentMethod, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` for its method, replacing any earlier one.
    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) -> &mut Self {
        self.providers.insert(provider.method(), provider);
        self
    }

    pub fn get(&self, method: PaymentMethod) -> Result<Arc<dyn PaymentProvider>, ProviderError> {
        self.providers
            .get(&method)
            .cloned()
            .ok_or(ProviderError::Unsupported(method.as_str()))
    }

    pub fn methods(&self) -> impl Iterator<Item = PaymentMethod> + '_ {
        self.providers.keys().copied()
    }
}
