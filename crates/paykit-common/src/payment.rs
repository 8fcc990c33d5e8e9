//! Plugin contract
//!
//! A payment method is an external plugin: a module that constructs an
//! instance bound to the engine storage, describes itself through a
//! [`PluginManifest`], executes payments via [`PaymentPlugin::pay`] and
//! reports progress asynchronously through a [`NotificationCallback`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::amount::{Amount, Denomination};
use crate::database::DynDatabase;

/// Plugin error
#[derive(Debug, Error)]
pub enum Error {
    /// Plugin failed to initialise
    #[error("Failed to initialize plugin: {0}")]
    Init(String),
    /// Plugin failed to produce its manifest
    #[error("Failed to get manifest: {0}")]
    GetManifest(String),
    /// Plugin failed to stop cleanly
    #[error("Failed to stop plugin: {0}")]
    Stop(String),
    /// A plugin with the same name is already registered
    #[error("Plugin `{0}` is already registered")]
    Conflict(String),
    /// Plugin could not be resolved from the configured plugin table
    #[error("Failed to load plugin by entry point `{0}`")]
    FailedToLoad(String),
    /// Plugin is registered but stopped
    #[error("Plugin `{0}` is not active")]
    NotActive(String),
    /// Manifest failed validation
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),
    /// Method is not exposed by the plugin
    #[error("Plugin does not support method `{0}`")]
    MethodNotSupported(String),
    /// Payment backend error
    #[error(transparent)]
    Plugin(Box<dyn std::error::Error + Send + Sync>),
    /// Serde error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Custom
    #[error("`{0}`")]
    Custom(String),
}

/// Plugin type implementing a payment method
pub const PLUGIN_TYPE_PAYMENT: &str = "payment";

/// Event dispatched when the engine subscribes plugins to incoming payments
pub const RECEIVE_PAYMENT_EVENT: &str = "receivePayment";

/// A plugin's self-description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Unique plugin name
    pub name: String,
    /// Plugin type, `"payment"` for payment plugins
    #[serde(rename = "type")]
    pub kind: String,
    /// RPC method names exposed by the plugin
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rpc: Vec<String>,
    /// Event names the plugin subscribes to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
    /// Plugin version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Human description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PluginManifest {
    /// Whether this is a payment-method plugin
    pub fn is_payment(&self) -> bool {
        self.kind == PLUGIN_TYPE_PAYMENT
    }

    /// Whether the manifest subscribes the plugin to `event`
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }

    /// Validate the manifest
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidManifest("name must not be empty".to_string()));
        }
        let mut rpc = HashSet::new();
        for method in &self.rpc {
            if method.trim().is_empty() {
                return Err(Error::InvalidManifest(format!(
                    "plugin `{}` declares an empty rpc method name",
                    self.name
                )));
            }
            if !rpc.insert(method.as_str()) {
                return Err(Error::InvalidManifest(format!(
                    "plugin `{}` declares duplicate rpc method `{}`",
                    self.name, method
                )));
            }
        }
        let mut events = HashSet::new();
        for event in &self.events {
            if !events.insert(event.as_str()) {
                return Err(Error::InvalidManifest(format!(
                    "plugin `{}` declares duplicate event `{}`",
                    self.name, event
                )));
            }
        }
        if self.is_payment() {
            if !rpc.contains("pay") {
                return Err(Error::InvalidManifest(format!(
                    "payment plugin `{}` must declare `pay` in rpc",
                    self.name
                )));
            }
            if !events.contains(RECEIVE_PAYMENT_EVENT) {
                return Err(Error::InvalidManifest(format!(
                    "payment plugin `{}` must subscribe to `{RECEIVE_PAYMENT_EVENT}`",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// State reported by a plugin for an outgoing payment attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginPaymentState {
    /// Attempt accepted by the payment backend
    Submitted,
    /// Attempt failed
    Failed,
    /// Attempt succeeded
    Success,
    /// Method-specific intermediate state, forwarded to the user
    #[serde(untagged)]
    Other(String),
}

impl fmt::Display for PluginPaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginPaymentState::Submitted => write!(f, "submitted"),
            PluginPaymentState::Failed => write!(f, "failed"),
            PluginPaymentState::Success => write!(f, "success"),
            PluginPaymentState::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Payment payload handed to a plugin's `pay`
///
/// A restriction of the outgoing payment record to the fields a payment
/// backend needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Payment id
    pub id: String,
    /// Owning order id
    pub order_id: String,
    /// Free-form note
    #[serde(default)]
    pub memo: String,
    /// Decimal-string amount
    pub amount: String,
    /// Currency tag
    pub currency: String,
    /// Amount denomination
    pub denomination: Denomination,
}

/// `payment_new` notification: a plugin observed an incoming payment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentNewPayload {
    /// Reporting plugin
    pub plugin_name: String,
    /// Incoming payment id, present for personal payments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Invoice id the payment settles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    /// Whether the payment settles a previously created invoice
    #[serde(default)]
    pub is_personal_payment: bool,
    /// Received decimal-string amount
    pub amount: String,
    /// Currency tag, defaults to `BTC`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Denomination, defaults to `BASE`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denomination: Option<Denomination>,
    /// Free-form note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    /// Method-specific raw payment data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Value>,
}

/// `payment_update` notification: progress of an outgoing payment attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentUpdatePayload {
    /// Reporting plugin
    pub plugin_name: String,
    /// Order the attempt belongs to
    pub order_id: String,
    /// Reported attempt state
    pub plugin_state: PluginPaymentState,
    /// Method-specific update data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// `ready_to_receive` notification: a plugin provisioned its payment file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyToReceivePayload {
    /// Reporting plugin
    pub plugin_name: String,
    /// Incoming payment id the file belongs to, when invoice-bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Invoice id for private payment files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    /// Whether the file was provisioned for a specific expected amount
    #[serde(default)]
    pub amount_was_specified: bool,
    /// Payment file body
    pub data: Value,
}

/// Notification payloads delivered by plugins and the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginPayload {
    /// An incoming payment was observed
    PaymentNew(PaymentNewPayload),
    /// Progress update for an outgoing payment
    PaymentUpdate(PaymentUpdatePayload),
    /// A plugin provisioned data for its payment file
    ReadyToReceive(ReadyToReceivePayload),
    /// A payment order completed
    #[serde(rename_all = "camelCase")]
    PaymentOrderCompleted {
        /// Completed order id
        order_id: String,
        /// Supplementary data
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// A recurring order completed one payment with more outstanding
    #[serde(rename_all = "camelCase")]
    PaymentOrderPartiallyCompleted {
        /// Order id
        order_id: String,
        /// Supplementary data
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

/// Callback plugins use to deliver [`PluginPayload`]s to the engine
pub type NotificationCallback =
    Arc<dyn Fn(PluginPayload) -> BoxFuture<'static, Result<(), crate::error::Error>> + Send + Sync>;

/// Arguments to a plugin's `pay`
#[derive(Clone)]
pub struct PayArgs {
    /// Payment-method endpoint read from the counterparty catalogue
    pub target: Value,
    /// Restricted payment payload
    pub payload: PaymentPayload,
    /// Progress callback
    pub notification_callback: NotificationCallback,
}

impl fmt::Debug for PayArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayArgs")
            .field("target", &self.target)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// Context for the receive-payment event
#[derive(Clone)]
pub struct ReceivePaymentEvent {
    /// Incoming payment id, present once an invoice exists
    pub id: Option<String>,
    /// Invoice id for personal invoices
    pub client_order_id: Option<String>,
    /// Amount a personal invoice expects
    pub expected_amount: Option<Amount>,
    /// Callback for delivering payloads back to the engine
    pub notification_callback: NotificationCallback,
}

impl fmt::Debug for ReceivePaymentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivePaymentEvent")
            .field("id", &self.id)
            .field("client_order_id", &self.client_order_id)
            .field("expected_amount", &self.expected_amount)
            .finish_non_exhaustive()
    }
}

/// Event dispatched to subscribed plugins
#[derive(Debug, Clone)]
pub enum PluginEvent {
    /// The engine is ready to route incoming payments
    ReceivePayment(ReceivePaymentEvent),
    /// Free-form event
    Custom {
        /// Event name matched against manifest subscriptions
        name: String,
        /// Event payload
        data: Value,
    },
}

impl PluginEvent {
    /// Name matched against manifest `events`
    pub fn name(&self) -> &str {
        match self {
            PluginEvent::ReceivePayment(_) => RECEIVE_PAYMENT_EVENT,
            PluginEvent::Custom { name, .. } => name,
        }
    }
}

/// A payment plugin instance
#[async_trait]
pub trait PaymentPlugin: Send + Sync {
    /// Plugin self-description
    async fn manifest(&self) -> Result<PluginManifest, Error>;

    /// Execute an outgoing payment
    ///
    /// The call returns once the attempt is handed to the backend; progress
    /// arrives through `args.notification_callback`.
    async fn pay(&self, args: PayArgs) -> Result<(), Error>;

    /// Handle an event the manifest subscribes to
    async fn handle_event(&self, event: PluginEvent) -> Result<(), Error>;

    /// Forward a user-originated update to an in-flight payment
    async fn update_payment(&self, _payment_id: Option<&str>, _data: Value) -> Result<(), Error> {
        Err(Error::MethodNotSupported("updatePayment".to_string()))
    }

    /// Invoke a manifest-declared RPC method
    async fn rpc(&self, method: &str, _params: Value) -> Result<Value, Error> {
        Err(Error::MethodNotSupported(method.to_string()))
    }

    /// Stop the plugin
    async fn stop(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Constructor for plugin instances
#[async_trait]
pub trait PluginFactory: Send + Sync {
    /// Create a plugin instance bound to the engine storage
    async fn init(&self, storage: DynDatabase) -> Result<Arc<dyn PaymentPlugin>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> PluginManifest {
        PluginManifest {
            name: "p2sh".to_string(),
            kind: PLUGIN_TYPE_PAYMENT.to_string(),
            rpc: vec!["pay".to_string(), "updatePayment".to_string()],
            events: vec![RECEIVE_PAYMENT_EVENT.to_string()],
            version: Some("1.0.0".to_string()),
            description: None,
        }
    }

    #[test]
    fn test_valid_manifest() {
        manifest().validate().unwrap();
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut m = manifest();
        m.name = " ".to_string();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_duplicate_rpc_rejected() {
        let mut m = manifest();
        m.rpc.push("pay".to_string());
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_payment_plugin_requires_pay() {
        let mut m = manifest();
        m.rpc = vec!["updatePayment".to_string()];
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_payment_plugin_requires_receive_event() {
        let mut m = manifest();
        m.events = Vec::new();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_payload_type_tagging() {
        let payload = PluginPayload::PaymentUpdate(PaymentUpdatePayload {
            plugin_name: "p2sh".to_string(),
            order_id: "o-1".to_string(),
            plugin_state: PluginPaymentState::Success,
            data: None,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "payment_update");
        assert_eq!(json["pluginState"], "success");
    }

    #[test]
    fn test_intermediate_plugin_state() {
        let state: PluginPaymentState =
            serde_json::from_value(serde_json::json!("action_required")).unwrap();
        assert_eq!(
            state,
            PluginPaymentState::Other("action_required".to_string())
        );
    }
}
