//! Payment receiver
//!
//! Publishes the per-receiver catalogue of payment endpoints into the
//! transport, subscribes plugins to incoming payments and reconciles
//! plugin-reported receipts against the expected amount of an invoice.
//! The catalogue is regenerated after use so endpoints are not reused.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use paykit_common::database::{DynDatabase, IncomingPaymentFilter, IncomingPaymentUpdate};
use paykit_common::payment::{
    NotificationCallback, PaymentNewPayload, PluginEvent, ReceivePaymentEvent,
};
use paykit_common::transport::{
    private_index_path, private_plugin_path, public_plugin_path, CreateOptions, DynTransport,
    PaymentEndpoints, SLASHPAY_PATH,
};
use paykit_common::util::unix_time_ms;
use paykit_common::{
    Amount, Error, IncomingPayment, InternalState, PluginReceipt, PluginRunState,
};

use crate::plugins::PluginManager;

/// Callback notifying the embedding application of a reconciled payment
pub type IncomingPaymentCallback =
    Arc<dyn Fn(IncomingPayment) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Publishes endpoint catalogues and reconciles incoming payments
pub struct PaymentReceiver {
    db: DynDatabase,
    plugins: Arc<PluginManager>,
    transport: DynTransport,
    entry_point: NotificationCallback,
    notify: IncomingPaymentCallback,
}

impl fmt::Debug for PaymentReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentReceiver").finish_non_exhaustive()
    }
}

impl PaymentReceiver {
    /// New receiver
    ///
    /// `entry_point` is handed to plugins for delivering payloads back into
    /// the engine; `notify` reports each reconciled payment to the
    /// application.
    pub fn new(
        db: DynDatabase,
        plugins: Arc<PluginManager>,
        transport: DynTransport,
        entry_point: NotificationCallback,
        notify: IncomingPaymentCallback,
    ) -> Self {
        Self {
            db,
            plugins,
            transport,
            entry_point,
            notify,
        }
    }

    /// Publish the public endpoint catalogue and subscribe plugins
    ///
    /// Returns the url of the public index.
    pub async fn init(&self) -> Result<String, Error> {
        let endpoints = self.plugin_endpoints(None).await?;
        let url = self
            .transport
            .create(
                SLASHPAY_PATH,
                serde_json::to_value(&endpoints)?,
                CreateOptions {
                    await_relay_sync: true,
                    encrypt: false,
                },
            )
            .await?;
        self.plugins
            .dispatch_event(PluginEvent::ReceivePayment(ReceivePaymentEvent {
                id: None,
                client_order_id: None,
                expected_amount: None,
                notification_callback: self.entry_point.clone(),
            }))
            .await;
        tracing::info!("Published payment endpoints at `{url}`");
        Ok(url)
    }

    /// Publish an encrypted invoice catalogue for `client_order_id`
    ///
    /// Creates the initial incoming payment when none is open for the
    /// invoice yet, and dispatches the receive event enriched with the
    /// expected amount. Returns the url of the encrypted index.
    pub async fn create_invoice(
        &self,
        client_order_id: &str,
        expected_amount: Amount,
    ) -> Result<String, Error> {
        if client_order_id.trim().is_empty() {
            return Err(Error::ClientOrderIdMissing);
        }
        let payment = match self.open_invoice_payment(client_order_id).await? {
            Some(payment) => payment,
            None => {
                let payment =
                    IncomingPayment::new_invoice(client_order_id, expected_amount.clone(), "");
                self.db.save_incoming_payment(&payment).await?;
                payment
            }
        };

        let endpoints = self.plugin_endpoints(Some(client_order_id)).await?;
        let url = self
            .transport
            .create(
                &private_index_path(client_order_id),
                serde_json::to_value(&endpoints)?,
                CreateOptions {
                    await_relay_sync: true,
                    encrypt: true,
                },
            )
            .await?;
        self.plugins
            .dispatch_event(PluginEvent::ReceivePayment(ReceivePaymentEvent {
                id: Some(payment.id.clone()),
                client_order_id: Some(client_order_id.to_string()),
                expected_amount: Some(expected_amount),
                notification_callback: self.entry_point.clone(),
            }))
            .await;
        tracing::info!("Published invoice `{client_order_id}` at `{url}`");
        Ok(url)
    }

    /// Route a plugin-reported incoming payment into the unified record
    ///
    /// Personal payments reconcile against the expected amount of their
    /// invoice; anything else is recorded as a completed spontaneous
    /// payment. The catalogue is refreshed afterwards unless `regenerate`
    /// is unset, and the application is notified last.
    pub async fn handle_new_payment(
        &self,
        payload: PaymentNewPayload,
        regenerate: bool,
    ) -> Result<IncomingPayment, Error> {
        let payment = if payload.is_personal_payment {
            self.reconcile_personal(&payload).await?
        } else {
            self.record_spontaneous(&payload).await?
        };
        if regenerate {
            self.init().await?;
        }
        (self.notify)(payment.clone()).await?;
        Ok(payment)
    }

    /// Per-plugin endpoint urls for every active payment plugin
    async fn plugin_endpoints(
        &self,
        client_order_id: Option<&str>,
    ) -> Result<PaymentEndpoints, Error> {
        let mut endpoints = PaymentEndpoints::default();
        for entry in self.plugins.get_plugins(Some(true)).await {
            if !entry.manifest.is_payment() {
                continue;
            }
            let name = &entry.manifest.name;
            let path = match client_order_id {
                Some(client_order_id) => private_plugin_path(client_order_id, name),
                None => public_plugin_path(name),
            };
            let url = self.transport.get_url(&path).await?;
            endpoints.payment_endpoints.insert(name.clone(), url);
        }
        Ok(endpoints)
    }

    /// The open (in-progress, live) payment of an invoice, if any
    async fn open_invoice_payment(
        &self,
        client_order_id: &str,
    ) -> Result<Option<IncomingPayment>, Error> {
        let payments = self
            .db
            .get_incoming_payments(IncomingPaymentFilter {
                client_order_id: Some(client_order_id.to_string()),
                internal_state: Some(InternalState::InProgress),
                ..Default::default()
            })
            .await?;
        Ok(payments.into_iter().next())
    }

    /// Reconcile a receipt against its invoice
    ///
    /// Refuses on currency or denomination mismatch without mutating state.
    /// A remaining shortfall publishes a continuation invoice for the
    /// missing amount and attaches its url to the payment.
    async fn reconcile_personal(
        &self,
        payload: &PaymentNewPayload,
    ) -> Result<IncomingPayment, Error> {
        let payment = self.find_personal_payment(payload).await?;
        let expected = payment.expected_amount.clone().ok_or_else(|| {
            Error::Custom(format!(
                "incoming payment `{}` has no expected amount",
                payment.id
            ))
        })?;
        let received = Amount::new(&payload.amount, payload.currency.as_deref(), payload.denomination)?;
        if received.currency() != expected.currency() {
            return Err(Error::PaymentCurrencyMismatch {
                expected: expected.currency().to_string(),
                actual: received.currency().to_string(),
            });
        }
        if received.denomination() != expected.denomination() {
            return Err(Error::PaymentDenominationMismatch {
                expected: expected.denomination(),
                actual: received.denomination(),
            });
        }

        let mut draft = payment.clone();
        draft.received_by_plugins.push(PluginReceipt {
            name: payload.plugin_name.clone(),
            state: PluginRunState::Success,
            amount: received,
            raw_data: payload.raw_data.clone(),
            received_at: unix_time_ms(),
        });
        let missing = draft.missing_amount()?;

        let mut update = IncomingPaymentUpdate {
            received_by_plugins: Some(draft.received_by_plugins.clone()),
            ..Default::default()
        };
        match &missing {
            None => {
                update.internal_state = Some(InternalState::Completed);
                update.amount = draft.total_received()?;
            }
            Some(missing) => {
                tracing::info!(
                    "Invoice `{}` still missing {missing}",
                    payment.client_order_id.as_deref().unwrap_or(&payment.id)
                );
                update.internal_state = Some(InternalState::InProgress);
            }
        }
        let mut updated = self.db.update_incoming_payment(&payment.id, update).await?;

        if let Some(missing) = missing {
            let client_order_id = payment
                .client_order_id
                .clone()
                .ok_or(Error::ClientOrderIdMissing)?;
            let url = self.create_invoice(&client_order_id, missing).await?;
            updated = self
                .db
                .update_incoming_payment(
                    &payment.id,
                    IncomingPaymentUpdate {
                        continuation_url: Some(url),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(updated)
    }

    /// Locate the invoice payment a personal payload settles
    async fn find_personal_payment(
        &self,
        payload: &PaymentNewPayload,
    ) -> Result<IncomingPayment, Error> {
        if let Some(id) = &payload.id {
            return self
                .db
                .get_incoming_payment(id, Default::default())
                .await?
                .ok_or_else(|| Error::PaymentObjectNotFound(id.clone()));
        }
        if let Some(client_order_id) = &payload.client_order_id {
            return self
                .open_invoice_payment(client_order_id)
                .await?
                .ok_or_else(|| Error::PaymentObjectNotFound(client_order_id.clone()));
        }
        Err(Error::PaymentObjectNotFound(payload.plugin_name.clone()))
    }

    /// Record a spontaneous receipt as a completed payment
    async fn record_spontaneous(
        &self,
        payload: &PaymentNewPayload,
    ) -> Result<IncomingPayment, Error> {
        let amount = Amount::new(&payload.amount, payload.currency.as_deref(), payload.denomination)?;
        let receipt = PluginReceipt {
            name: payload.plugin_name.clone(),
            state: PluginRunState::Success,
            amount,
            raw_data: payload.raw_data.clone(),
            received_at: unix_time_ms(),
        };
        let payment = IncomingPayment::new_received(
            receipt,
            payload.memo.as_deref().unwrap_or_default(),
            payload.client_order_id.clone(),
        );
        self.db.save_incoming_payment(&payment).await?;
        Ok(payment)
    }
}
