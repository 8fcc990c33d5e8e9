//! Shared harness for engine integration tests
#![allow(clippy::unwrap_used)]
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use paykit::common::database::{DynDatabase, OutgoingPaymentFilter};
use paykit::common::OutgoingPayment;
use paykit::store::MemoryDatabase;
use paykit::{Notification, NotificationSink, PaymentManager};
use paykit_fake_plugin::{FakePluginFactory, MemoryTransport};
use serde_json::json;

/// Engine wired to fake plugins, a memory store and a memory transport
pub struct Harness {
    pub manager: Arc<PaymentManager>,
    pub db: DynDatabase,
    pub transport: MemoryTransport,
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl Harness {
    pub async fn new(factories: Vec<Arc<FakePluginFactory>>) -> Self {
        let db: DynDatabase = Arc::new(MemoryDatabase::new());
        let transport = MemoryTransport::new("slash://alice");
        let notifications = Arc::new(Mutex::new(Vec::new()));

        let sink_notifications = notifications.clone();
        let sink: NotificationSink = Arc::new(move |notification| {
            let notifications = sink_notifications.clone();
            Box::pin(async move {
                notifications.lock().unwrap().push(notification);
            })
        });

        let mut builder = PaymentManager::builder()
            .with_store(db.clone())
            .with_transport(Arc::new(transport.clone()))
            .with_notifier(sink);
        for factory in &factories {
            builder = builder.with_plugin(factory.name().to_string(), factory.clone());
        }
        let manager = builder.build().unwrap();
        manager.init().await.unwrap();

        Self {
            manager,
            db,
            transport,
            notifications,
        }
    }

    /// Seed a counterparty catalogue rooted at `base` with one endpoint per
    /// plugin name, returning the catalogue url
    pub async fn seed_counterparty(&self, base: &str, plugins: &[&str]) -> String {
        let mut endpoints = serde_json::Map::new();
        for name in plugins {
            let url = format!("{base}/public/slashpay/{name}/slashpay.json");
            self.transport
                .put_remote(&url, json!({ "address": format!("{name}-endpoint") }))
                .await;
            endpoints.insert(name.to_string(), json!(url));
        }
        let index_url = format!("{base}/public/slashpay.json");
        self.transport
            .put_remote(&index_url, json!({ "paymentEndpoints": endpoints }))
            .await;
        index_url
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    pub async fn payments_of(&self, order_id: &str) -> Vec<OutgoingPayment> {
        self.db
            .get_outgoing_payments(OutgoingPaymentFilter {
                order_id: Some(order_id.to_string()),
                ..Default::default()
            })
            .await
            .unwrap()
    }
}
