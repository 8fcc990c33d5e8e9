//! Payment manager builder

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use paykit_common::database::DynDatabase;
use paykit_common::payment::PluginFactory;
use paykit_common::transport::DynTransport;
use paykit_common::Error;

use super::{NotificationSink, PaymentManager};
use crate::store::MemoryDatabase;

/// Builder wiring the store, transport, plugin table and notification sink
pub struct PaymentManagerBuilder {
    db: Option<DynDatabase>,
    transport: Option<DynTransport>,
    plugins: HashMap<String, Arc<dyn PluginFactory>>,
    notifier: Option<NotificationSink>,
}

impl fmt::Debug for PaymentManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentManagerBuilder")
            .field("plugins", &self.plugins.keys())
            .finish_non_exhaustive()
    }
}

impl Default for PaymentManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PaymentManagerBuilder {
    /// New builder
    pub fn new() -> Self {
        Self {
            db: None,
            transport: None,
            plugins: HashMap::new(),
            notifier: None,
        }
    }

    /// Set the store backend; defaults to the in-memory store
    pub fn with_store(mut self, db: DynDatabase) -> Self {
        self.db = Some(db);
        self
    }

    /// Set the endpoint-catalogue transport (required)
    pub fn with_transport(mut self, transport: DynTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Register a payment plugin under `name`
    pub fn with_plugin(mut self, name: impl Into<String>, factory: Arc<dyn PluginFactory>) -> Self {
        self.plugins.insert(name.into(), factory);
        self
    }

    /// Set the application notification sink; defaults to a tracing sink
    pub fn with_notifier(mut self, notifier: NotificationSink) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Build the engine
    pub fn build(self) -> Result<Arc<PaymentManager>, Error> {
        let transport = self
            .transport
            .ok_or_else(|| Error::Custom("a transport is required".to_string()))?;
        let db = self
            .db
            .unwrap_or_else(|| Arc::new(MemoryDatabase::new()) as DynDatabase);
        let notifier = self.notifier.unwrap_or_else(|| {
            Arc::new(|notification| {
                Box::pin(async move {
                    tracing::info!("Notification: {notification:?}");
                })
            })
        });
        Ok(PaymentManager::new(db, transport, self.plugins, notifier))
    }
}
