//! Payment sender
//!
//! Short-lived driver for one order: resolves the counterparty endpoint for
//! the currently selected plugin, invokes its `pay` and reacts to the
//! asynchronous plugin callbacks by advancing, retrying with the next plugin
//! or completing the order. Callbacks are serialised through the order lock
//! so all mutation happens on a single-writer path, and every store write
//! precedes the outgoing notification.

use std::fmt;
use std::sync::Arc;

use paykit_common::database::DynDatabase;
use paykit_common::payment::{
    self, NotificationCallback, PayArgs, PaymentUpdatePayload, PluginPaymentState, PluginPayload,
};
use paykit_common::transport::{DynTransport, PaymentEndpoints};
use paykit_common::util::unix_time_ms;
use paykit_common::{Error, OutgoingPayment};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::order::PaymentOrder;
use crate::plugins::PluginManager;

/// Drives the payments of one order through its sending priority
pub struct PaymentSender {
    order: Mutex<PaymentOrder>,
    plugins: Arc<PluginManager>,
    transport: DynTransport,
    db: DynDatabase,
    report: NotificationCallback,
}

impl fmt::Debug for PaymentSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentSender").finish_non_exhaustive()
    }
}

impl PaymentSender {
    /// New sender for `order`, reporting progress through `report`
    pub fn new(
        order: PaymentOrder,
        plugins: Arc<PluginManager>,
        transport: DynTransport,
        report: NotificationCallback,
    ) -> Self {
        let db = order.db();
        Self {
            order: Mutex::new(order),
            plugins,
            transport,
            db,
            report,
        }
    }

    /// Whether this sender is driving `payment_id` right now
    pub async fn has_in_progress_payment(&self, payment_id: &str) -> bool {
        self.order
            .lock()
            .await
            .in_progress_payment()
            .is_some_and(|payment| payment.id == payment_id)
    }

    /// Obtain the next actionable payment and hand it to its plugin
    ///
    /// Returns without paying when the next payment is scheduled in the
    /// future; the caller re-polls. Progress arrives through the plugin
    /// callback, not the return value.
    pub async fn submit(self: Arc<Self>) -> Result<(), Error> {
        let payment = {
            let mut order = self.order.lock().await;
            order.process().await?
        };
        if !payment.is_due(unix_time_ms()) {
            tracing::debug!(
                "Payment `{}` of order `{}` is not due yet",
                payment.id,
                payment.order_id
            );
            return Ok(());
        }
        let plugin_name = match payment.current_plugin() {
            Some(run) => run.name.clone(),
            None => return Err(Error::NoPluginsAvailable),
        };

        let entry = match self.plugins.get_plugin(&plugin_name).await {
            Some(entry) => entry,
            None => {
                self.plugins
                    .load_plugin(&plugin_name, self.db.clone())
                    .await?
            }
        };
        if !entry.active {
            return Err(payment::Error::NotActive(plugin_name).into());
        }

        let Some(target) = self.resolve_target(&payment, &plugin_name).await? else {
            tracing::warn!(
                "No payment target for plugin `{plugin_name}` at `{}`",
                payment.counterparty_url
            );
            let update = PaymentUpdatePayload {
                plugin_name,
                order_id: payment.order_id.clone(),
                plugin_state: PluginPaymentState::Failed,
                data: Some(json!({ "error": Error::PaymentTargetNotFound.to_string() })),
            };
            // Boxed: handle_failure re-enters submit for the next plugin
            return Box::pin(self.handle_failure(update)).await;
        };

        let args = PayArgs {
            target,
            payload: payment.to_payload(),
            notification_callback: self.clone().notification_callback(),
        };
        entry.plugin.pay(args).await?;
        Ok(())
    }

    /// Resolve the counterparty's endpoint payload for `plugin_name`
    ///
    /// Reads the catalogue at the payment's counterparty url, follows the
    /// plugin's endpoint url and returns the payload published there. Any
    /// missing step resolves to `None`.
    async fn resolve_target(
        &self,
        payment: &OutgoingPayment,
        plugin_name: &str,
    ) -> Result<Option<Value>, Error> {
        let Some(index) = self.transport.read_remote(&payment.counterparty_url).await? else {
            return Ok(None);
        };
        // A malformed catalogue is indistinguishable from a missing endpoint
        let Ok(endpoints) = serde_json::from_value::<PaymentEndpoints>(index) else {
            return Ok(None);
        };
        let Some(url) = endpoints.payment_endpoints.get(plugin_name) else {
            return Ok(None);
        };
        self.transport.read_remote(url).await.map_err(Error::from)
    }

    /// Callback handed to plugins with `pay`
    ///
    /// Routes progress updates back into this sender; anything else goes to
    /// the report callback.
    fn notification_callback(self: Arc<Self>) -> NotificationCallback {
        Arc::new(move |payload| {
            let sender = self.clone();
            Box::pin(async move {
                match payload {
                    PluginPayload::PaymentUpdate(update) => {
                        sender.state_update_callback(update).await
                    }
                    other => (sender.report)(other).await,
                }
            })
        })
    }

    /// Process an asynchronous plugin update for the in-flight payment
    ///
    /// Updates for a payment that already reached a terminal state are
    /// logged and dropped.
    pub async fn state_update_callback(
        self: Arc<Self>,
        update: PaymentUpdatePayload,
    ) -> Result<(), Error> {
        {
            let mut order = self.order.lock().await;
            let Some(payment) = order.in_progress_payment_mut() else {
                tracing::warn!(
                    "Dropping `{}` update from `{}`: order `{}` has no payment in flight",
                    update.plugin_state,
                    update.plugin_name,
                    update.order_id
                );
                return Ok(());
            };
            payment
                .mark_plugin_update(serde_json::to_value(&update)?)
                .await?;
        }
        match update.plugin_state {
            PluginPaymentState::Failed => self.handle_failure(update).await,
            PluginPaymentState::Success => self.handle_success(update).await,
            _ => (self.report)(PluginPayload::PaymentUpdate(update)).await,
        }
    }

    /// Record the failed attempt and retry with the next plugin in priority
    async fn handle_failure(self: Arc<Self>, update: PaymentUpdatePayload) -> Result<(), Error> {
        {
            let mut order = self.order.lock().await;
            if let Some(payment) = order.in_progress_payment_mut() {
                payment.fail_current_plugin().await?;
            }
        }
        (self.report)(PluginPayload::PaymentUpdate(update.clone())).await?;
        match self.clone().submit().await {
            Err(Error::NoPluginsAvailable) => {
                tracing::warn!(
                    "Order `{}` exhausted its sending priority",
                    update.order_id
                );
                (self.report)(PluginPayload::PaymentUpdate(PaymentUpdatePayload {
                    plugin_name: update.plugin_name,
                    order_id: update.order_id,
                    plugin_state: PluginPaymentState::Failed,
                    data: Some(json!({ "error": Error::NoPluginsAvailable.to_string() })),
                }))
                .await
            }
            result => result,
        }
    }

    /// Complete the payment, then the order once nothing is outstanding
    async fn handle_success(self: Arc<Self>, update: PaymentUpdatePayload) -> Result<(), Error> {
        {
            let mut order = self.order.lock().await;
            if let Some(payment) = order.in_progress_payment_mut() {
                payment.complete().await?;
            }
        }
        (self.report)(PluginPayload::PaymentUpdate(update.clone())).await?;
        let completion = {
            let mut order = self.order.lock().await;
            order.complete().await
        };
        match completion {
            Ok(order) => {
                (self.report)(PluginPayload::PaymentOrderCompleted {
                    order_id: order.id,
                    data: None,
                })
                .await
            }
            Err(Error::OutstandingPayments) => {
                self.clone().submit().await?;
                (self.report)(PluginPayload::PaymentOrderPartiallyCompleted {
                    order_id: update.order_id,
                    data: None,
                })
                .await
            }
            Err(e) => Err(e),
        }
    }

    /// Forward an out-of-band user update to the in-flight payment's plugin
    pub async fn update_payment(&self, data: Value) -> Result<(), Error> {
        let (payment_id, plugin_name) = {
            let order = self.order.lock().await;
            let payment = order
                .in_progress_payment()
                .ok_or(paykit_common::state::Error::NoPluginInProgress)?;
            let run = payment
                .current_plugin()
                .ok_or(paykit_common::state::Error::NoPluginInProgress)?;
            (payment.id.clone(), run.name.clone())
        };
        let entry = self
            .plugins
            .get_plugin(&plugin_name)
            .await
            .ok_or(payment::Error::FailedToLoad(plugin_name))?;
        entry
            .plugin
            .update_payment(Some(&payment_id), data)
            .await?;
        Ok(())
    }
}
