//! Payment manager facade
//!
//! Top-level surface of the engine: creating and sending payment orders,
//! publishing the receive catalogue, creating invoices, and the entry points
//! plugin payloads and user updates are routed through.

mod builder;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use paykit_common::database::DynDatabase;
use paykit_common::payment::{
    NotificationCallback, PluginFactory, PluginPayload, ReadyToReceivePayload,
};
use paykit_common::transport::{
    private_plugin_path, public_plugin_path, CreateOptions, DynTransport,
};
use paykit_common::{Amount, Error, IncomingPayment, Order, OrderParams};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::order::PaymentOrder;
use crate::plugins::PluginManager;
use crate::receiver::{IncomingPaymentCallback, PaymentReceiver};
use crate::sender::PaymentSender;

pub use builder::PaymentManagerBuilder;

/// Notification delivered to the embedding application
#[derive(Debug, Clone)]
pub enum Notification {
    /// Payload forwarded from a plugin or the engine
    Payload(PluginPayload),
    /// A reconciled incoming payment
    IncomingPayment(IncomingPayment),
}

/// Application-side notification callback
pub type NotificationSink =
    Arc<dyn Fn(Notification) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Top-level payment engine facade
pub struct PaymentManager {
    weak: Weak<PaymentManager>,
    db: DynDatabase,
    transport: DynTransport,
    plugins: Arc<PluginManager>,
    plugin_names: Vec<String>,
    senders: Mutex<HashMap<String, Arc<PaymentSender>>>,
    receiver: Mutex<Option<Arc<PaymentReceiver>>>,
    notifier: NotificationSink,
    ready: AtomicBool,
}

impl fmt::Debug for PaymentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentManager")
            .field("plugin_names", &self.plugin_names)
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserEntry {
    #[serde(default)]
    plugin_name: Option<String>,
    #[serde(default)]
    payment_id: Option<String>,
}

impl PaymentManager {
    /// Start configuring a new engine
    pub fn builder() -> PaymentManagerBuilder {
        PaymentManagerBuilder::new()
    }

    pub(crate) fn new(
        db: DynDatabase,
        transport: DynTransport,
        factories: HashMap<String, Arc<dyn PluginFactory>>,
        notifier: NotificationSink,
    ) -> Arc<Self> {
        let mut plugin_names: Vec<String> = factories.keys().cloned().collect();
        plugin_names.sort();
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            db,
            transport,
            plugins: Arc::new(PluginManager::new(factories)),
            plugin_names,
            senders: Mutex::new(HashMap::new()),
            receiver: Mutex::new(None),
            notifier,
            ready: AtomicBool::new(false),
        })
    }

    /// Initialise the store; other operations refuse until this has run
    pub async fn init(&self) -> Result<(), Error> {
        self.db.init().await?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// The plugin manager
    pub fn plugin_manager(&self) -> Arc<PluginManager> {
        self.plugins.clone()
    }

    /// The engine store
    pub fn db(&self) -> DynDatabase {
        self.db.clone()
    }

    fn ensure_ready(&self) -> Result<(), Error> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    /// Create, persist and materialise a payment order
    pub async fn create_payment_order(&self, params: OrderParams) -> Result<Order, Error> {
        self.ensure_ready()?;
        let mut order = PaymentOrder::new(params, self.db.clone())?;
        order.init().await?;
        Ok(order.order().clone())
    }

    /// Start sending the payments of an order
    pub async fn send_payment(&self, order_id: &str) -> Result<(), Error> {
        self.ensure_ready()?;
        let order = PaymentOrder::find(order_id, self.db.clone()).await?;
        let sender = Arc::new(PaymentSender::new(
            order,
            self.plugins.clone(),
            self.transport.clone(),
            self.report_callback(),
        ));
        self.senders
            .lock()
            .await
            .insert(order_id.to_string(), sender.clone());
        sender.submit().await
    }

    /// Cancel an order and its outstanding payments
    pub async fn cancel_order(&self, order_id: &str) -> Result<Order, Error> {
        self.ensure_ready()?;
        let mut order = PaymentOrder::find(order_id, self.db.clone()).await?;
        let cancelled = order.cancel().await?;
        self.senders.lock().await.remove(order_id);
        Ok(cancelled)
    }

    /// Publish the public receive catalogue and subscribe plugins
    ///
    /// Loads every configured plugin first; a plugin that fails to load
    /// stops the already-loaded ones before the error surfaces.
    pub async fn receive_payments(&self) -> Result<String, Error> {
        self.ensure_ready()?;
        self.load_configured_plugins().await?;
        let receiver = self.ensure_receiver().await;
        receiver.init().await
    }

    /// Publish an encrypted invoice for `client_order_id`
    pub async fn create_invoice(
        &self,
        client_order_id: &str,
        amount: Amount,
    ) -> Result<String, Error> {
        self.ensure_ready()?;
        self.load_configured_plugins().await?;
        let receiver = self.ensure_receiver().await;
        receiver.create_invoice(client_order_id, amount).await
    }

    /// Entry point for payloads delivered by plugins
    pub async fn entry_point_for_plugin(&self, payload: PluginPayload) -> Result<(), Error> {
        match payload {
            PluginPayload::PaymentNew(payload) => {
                let receiver = self
                    .receiver
                    .lock()
                    .await
                    .clone()
                    .ok_or(Error::ReceiverNotReady)?;
                receiver.handle_new_payment(payload, true).await?;
                Ok(())
            }
            PluginPayload::PaymentUpdate(update) => self.handle_payment_update(update).await,
            PluginPayload::ReadyToReceive(payload) => {
                self.create_payment_file(&payload).await?;
                Ok(())
            }
            other => {
                self.notify(Notification::Payload(other)).await;
                Ok(())
            }
        }
    }

    /// Entry point for user-originated updates to in-flight payments
    ///
    /// The update must name a plugin; it is routed to the sender currently
    /// driving the payment when one is active, otherwise straight to the
    /// plugin.
    pub async fn entry_point_for_user(&self, data: Value) -> Result<(), Error> {
        self.ensure_ready()?;
        let entry: UserEntry = serde_json::from_value(data.clone())?;
        let plugin_name = entry.plugin_name.ok_or(Error::PluginNameRequired)?;

        if let Some(payment_id) = &entry.payment_id {
            let senders: Vec<Arc<PaymentSender>> =
                self.senders.lock().await.values().cloned().collect();
            for sender in senders {
                if sender.has_in_progress_payment(payment_id).await {
                    return sender.update_payment(data).await;
                }
            }
        }

        let plugin = match self.plugins.get_plugin(&plugin_name).await {
            Some(entry) => entry,
            None => {
                self.plugins
                    .load_plugin(&plugin_name, self.db.clone())
                    .await?
            }
        };
        plugin
            .plugin
            .update_payment(entry.payment_id.as_deref(), data)
            .await?;
        Ok(())
    }

    /// Write a plugin-provisioned payment file into the transport
    ///
    /// Files provisioned for a specific expected amount belong to an invoice
    /// and are written encrypted under the invoice's private prefix, which
    /// requires the payload to carry the invoice id.
    pub async fn create_payment_file(
        &self,
        payload: &ReadyToReceivePayload,
    ) -> Result<String, Error> {
        let (path, encrypt) = if payload.amount_was_specified {
            let client_order_id = payload
                .client_order_id
                .as_deref()
                .ok_or(Error::ClientOrderIdMissing)?;
            (
                private_plugin_path(client_order_id, &payload.plugin_name),
                true,
            )
        } else {
            (public_plugin_path(&payload.plugin_name), false)
        };
        self.transport
            .create(
                &path,
                payload.data.clone(),
                CreateOptions {
                    await_relay_sync: true,
                    encrypt,
                },
            )
            .await
            .map_err(Error::from)
    }

    /// Stop every plugin and close the transport
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.plugins.stop_all().await;
        self.transport.close().await?;
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_payment_update(
        &self,
        update: paykit_common::payment::PaymentUpdatePayload,
    ) -> Result<(), Error> {
        let sender = self.senders.lock().await.get(&update.order_id).cloned();
        match sender {
            Some(sender) => sender.state_update_callback(update).await,
            None => {
                self.notify(Notification::Payload(PluginPayload::PaymentUpdate(update)))
                    .await;
                Ok(())
            }
        }
    }

    async fn load_configured_plugins(&self) -> Result<(), Error> {
        for name in &self.plugin_names {
            if self.plugins.get_plugin(name).await.is_some() {
                continue;
            }
            if let Err(e) = self.plugins.load_plugin(name, self.db.clone()).await {
                return Err(self.plugins.graceful_throw(Error::from(e)).await);
            }
        }
        Ok(())
    }

    async fn ensure_receiver(&self) -> Arc<PaymentReceiver> {
        let mut guard = self.receiver.lock().await;
        if let Some(receiver) = guard.as_ref() {
            return receiver.clone();
        }
        let receiver = Arc::new(PaymentReceiver::new(
            self.db.clone(),
            self.plugins.clone(),
            self.transport.clone(),
            self.entry_point_callback(),
            self.incoming_notifier(),
        ));
        *guard = Some(receiver.clone());
        receiver
    }

    async fn notify(&self, notification: Notification) {
        (self.notifier)(notification).await;
    }

    /// Callback handed to plugins: routes payloads into the engine
    fn entry_point_callback(&self) -> NotificationCallback {
        let weak = self.weak.clone();
        Arc::new(move |payload| {
            let weak: Weak<PaymentManager> = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(manager) => manager.entry_point_for_plugin(payload).await,
                    None => {
                        tracing::warn!("Dropping plugin payload, engine is gone");
                        Ok(())
                    }
                }
            })
        })
    }

    /// Callback handed to senders: reports progress to the application
    fn report_callback(&self) -> NotificationCallback {
        let weak = self.weak.clone();
        Arc::new(move |payload| {
            let weak: Weak<PaymentManager> = weak.clone();
            Box::pin(async move {
                if let Some(manager) = weak.upgrade() {
                    manager.notify(Notification::Payload(payload)).await;
                }
                Ok(())
            })
        })
    }

    /// Callback handed to the receiver: reports reconciled payments
    fn incoming_notifier(&self) -> IncomingPaymentCallback {
        let weak = self.weak.clone();
        Arc::new(move |payment| {
            let weak: Weak<PaymentManager> = weak.clone();
            Box::pin(async move {
                if let Some(manager) = weak.upgrade() {
                    manager
                        .notify(Notification::IncomingPayment(payment))
                        .await;
                }
                Ok(())
            })
        })
    }
}
