//! Paykit fake payment plugin
//!
//! Used for testing where payment outcomes are scripted per call.

#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use paykit_common::database::DynDatabase;
use paykit_common::payment::{
    Error, PayArgs, PaymentNewPayload, PaymentPayload, PaymentPlugin, PaymentUpdatePayload,
    PluginEvent, PluginFactory, PluginManifest, PluginPayload, PluginPaymentState,
    ReceivePaymentEvent, PLUGIN_TYPE_PAYMENT, RECEIVE_PAYMENT_EVENT,
};
use serde_json::{json, Value};
use tokio::sync::Mutex;

pub mod transport;

pub use transport::MemoryTransport;

/// Factory producing [`FakePlugin`] instances
///
/// Keeps a handle to the created instance so tests can reach the plugin
/// after the engine loads it.
pub struct FakePluginFactory {
    name: String,
    outcomes: Vec<PluginPaymentState>,
    emit_submitted: bool,
    fail_on_stop: bool,
    instance: Mutex<Option<Arc<FakePlugin>>>,
}

impl std::fmt::Debug for FakePluginFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakePluginFactory")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl FakePluginFactory {
    /// New factory for a plugin called `name`; payments succeed by default
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            outcomes: Vec::new(),
            emit_submitted: false,
            fail_on_stop: false,
            instance: Mutex::new(None),
        }
    }

    /// Script the outcome of successive `pay` calls
    ///
    /// Outcomes are consumed in order; once exhausted, payments succeed.
    /// A scripted `Submitted` emits only the intermediate update and leaves
    /// the payment in flight.
    pub fn with_outcomes(mut self, outcomes: Vec<PluginPaymentState>) -> Self {
        self.outcomes = outcomes;
        self
    }

    /// Emit a `submitted` update before each terminal outcome
    pub fn with_submitted_updates(mut self) -> Self {
        self.emit_submitted = true;
        self
    }

    /// Make `stop` fail
    pub fn with_failing_stop(mut self) -> Self {
        self.fail_on_stop = true;
        self
    }

    /// Plugin name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instance created by the last `init`
    pub async fn instance(&self) -> Option<Arc<FakePlugin>> {
        self.instance.lock().await.clone()
    }
}

#[async_trait]
impl PluginFactory for FakePluginFactory {
    async fn init(&self, _storage: DynDatabase) -> Result<Arc<dyn PaymentPlugin>, Error> {
        let plugin = Arc::new(FakePlugin {
            name: self.name.clone(),
            outcomes: Mutex::new(self.outcomes.clone().into()),
            emit_submitted: self.emit_submitted,
            fail_on_stop: self.fail_on_stop,
            pay_calls: Mutex::new(Vec::new()),
            receive_events: Mutex::new(Vec::new()),
            update_calls: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });
        *self.instance.lock().await = Some(plugin.clone());
        Ok(plugin)
    }
}

/// Fake payment plugin with scripted `pay` outcomes
pub struct FakePlugin {
    name: String,
    outcomes: Mutex<VecDeque<PluginPaymentState>>,
    emit_submitted: bool,
    fail_on_stop: bool,
    pay_calls: Mutex<Vec<PayArgs>>,
    receive_events: Mutex<Vec<ReceivePaymentEvent>>,
    update_calls: Mutex<Vec<Value>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for FakePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakePlugin")
            .field("name", &self.name)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl FakePlugin {
    /// Payloads of every `pay` call, oldest first
    pub async fn pay_calls(&self) -> Vec<PaymentPayload> {
        self.pay_calls
            .lock()
            .await
            .iter()
            .map(|args| args.payload.clone())
            .collect()
    }

    /// Targets of every `pay` call, oldest first
    pub async fn pay_targets(&self) -> Vec<Value> {
        self.pay_calls
            .lock()
            .await
            .iter()
            .map(|args| args.target.clone())
            .collect()
    }

    /// Receive subscriptions delivered so far
    pub async fn receive_events(&self) -> Vec<ReceivePaymentEvent> {
        self.receive_events.lock().await.clone()
    }

    /// The latest receive subscription
    pub async fn last_receive_event(&self) -> Option<ReceivePaymentEvent> {
        self.receive_events.lock().await.last().cloned()
    }

    /// The latest invoice-bound receive subscription
    pub async fn last_personal_receive_event(&self) -> Option<ReceivePaymentEvent> {
        self.receive_events
            .lock()
            .await
            .iter()
            .rev()
            .find(|event| event.client_order_id.is_some())
            .cloned()
    }

    /// Updates forwarded through `updatePayment`
    pub async fn update_calls(&self) -> Vec<Value> {
        self.update_calls.lock().await.clone()
    }

    /// Whether `stop` ran
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Deliver an incoming-payment observation through the latest receive
    /// subscription
    pub async fn simulate_incoming_payment(
        &self,
        amount: &str,
        is_personal: bool,
    ) -> Result<(), paykit_common::Error> {
        let event = if is_personal {
            self.last_personal_receive_event().await
        } else {
            self.last_receive_event().await
        };
        let event = event.ok_or_else(|| {
            paykit_common::Error::Custom("no receive subscription delivered yet".to_string())
        })?;
        let payload = PaymentNewPayload {
            plugin_name: self.name.clone(),
            id: event.id.clone(),
            client_order_id: event.client_order_id.clone(),
            is_personal_payment: is_personal,
            amount: amount.to_string(),
            currency: None,
            denomination: None,
            memo: None,
            raw_data: Some(json!({ "provider": self.name })),
        };
        self.deliver_payment_new(payload).await
    }

    /// Deliver an arbitrary `payment_new` payload through the latest receive
    /// subscription
    pub async fn deliver_payment_new(
        &self,
        payload: PaymentNewPayload,
    ) -> Result<(), paykit_common::Error> {
        let event = self.last_receive_event().await.ok_or_else(|| {
            paykit_common::Error::Custom("no receive subscription delivered yet".to_string())
        })?;
        (event.notification_callback)(PluginPayload::PaymentNew(payload)).await
    }
}

#[async_trait]
impl PaymentPlugin for FakePlugin {
    async fn manifest(&self) -> Result<PluginManifest, Error> {
        Ok(PluginManifest {
            name: self.name.clone(),
            kind: PLUGIN_TYPE_PAYMENT.to_string(),
            rpc: vec!["pay".to_string(), "updatePayment".to_string()],
            events: vec![RECEIVE_PAYMENT_EVENT.to_string()],
            version: Some("0.1.0".to_string()),
            description: Some("Scripted fake payment plugin".to_string()),
        })
    }

    async fn pay(&self, args: PayArgs) -> Result<(), Error> {
        let callback = args.notification_callback.clone();
        let order_id = args.payload.order_id.clone();
        let outcome = self
            .outcomes
            .lock()
            .await
            .pop_front()
            .unwrap_or(PluginPaymentState::Success);
        tracing::debug!(
            "Fake plugin `{}` paying order `{order_id}` with outcome `{outcome}`",
            self.name
        );
        self.pay_calls.lock().await.push(args);

        if self.emit_submitted && outcome != PluginPaymentState::Submitted {
            callback(PluginPayload::PaymentUpdate(PaymentUpdatePayload {
                plugin_name: self.name.clone(),
                order_id: order_id.clone(),
                plugin_state: PluginPaymentState::Submitted,
                data: None,
            }))
            .await
            .map_err(|e| Error::Plugin(Box::new(e)))?;
        }

        callback(PluginPayload::PaymentUpdate(PaymentUpdatePayload {
            plugin_name: self.name.clone(),
            order_id,
            plugin_state: outcome,
            data: Some(json!({ "provider": self.name })),
        }))
        .await
        .map_err(|e| Error::Plugin(Box::new(e)))?;
        Ok(())
    }

    async fn handle_event(&self, event: PluginEvent) -> Result<(), Error> {
        match event {
            PluginEvent::ReceivePayment(event) => {
                self.receive_events.lock().await.push(event.clone());
                let payload = PluginPayload::ReadyToReceive(
                    paykit_common::payment::ReadyToReceivePayload {
                        plugin_name: self.name.clone(),
                        id: event.id.clone(),
                        client_order_id: event.client_order_id.clone(),
                        amount_was_specified: event.expected_amount.is_some(),
                        data: json!({
                            "method": self.name,
                            "address": format!("{}-address", self.name),
                        }),
                    },
                );
                (event.notification_callback)(payload)
                    .await
                    .map_err(|e| Error::Plugin(Box::new(e)))?;
                Ok(())
            }
            PluginEvent::Custom { name, .. } => {
                tracing::debug!("Fake plugin `{}` ignoring event `{name}`", self.name);
                Ok(())
            }
        }
    }

    async fn update_payment(&self, payment_id: Option<&str>, data: Value) -> Result<(), Error> {
        self.update_calls
            .lock()
            .await
            .push(json!({ "paymentId": payment_id, "data": data }));
        Ok(())
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, Error> {
        match method {
            "pay" | "updatePayment" => Ok(json!({ "method": method, "params": params })),
            _ => Err(Error::MethodNotSupported(method.to_string())),
        }
    }

    async fn stop(&self) -> Result<(), Error> {
        if self.fail_on_stop {
            return Err(Error::Stop("scripted stop failure".to_string()));
        }
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}
