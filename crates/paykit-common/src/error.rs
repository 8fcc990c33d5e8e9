//! Errors

use thiserror::Error;

use crate::amount::Denomination;
use crate::{amount, database, payment, state, transport};

/// Engine error
#[derive(Debug, Error)]
pub enum Error {
    /// Order parameters missing entirely
    #[error("No order parameters provided")]
    NoOrderParams,
    /// Orders require a counterparty
    #[error("Counterparty is required")]
    CounterpartyRequired,
    /// Recurrence settings are inconsistent
    #[error("Invalid frequency: `{0}`")]
    InvalidFrequency(u64),
    /// Timestamp out of range
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
    /// User entries must name a plugin
    #[error("Plugin name is required")]
    PluginNameRequired,

    /// Order was cancelled
    #[error("Order is cancelled")]
    OrderCancelled,
    /// Order already completed
    #[error("Order is completed")]
    OrderCompleted,
    /// Not every payment reached a terminal state
    #[error("Order has outstanding payments")]
    OutstandingPayments,
    /// A failed payment blocks the order
    #[error("Can not process order")]
    CanNotProcessOrder,
    /// Order not found
    #[error("Order `{0}` not found")]
    OrderNotFound(String),

    /// Sending priority exhausted
    #[error("No plugins available for payment")]
    NoPluginsAvailable,
    /// Counterparty catalogue holds no endpoint for the selected plugin
    #[error("Payment target not found")]
    PaymentTargetNotFound,

    /// Incoming payment record not found
    #[error("Payment object `{0}` not found")]
    PaymentObjectNotFound(String),
    /// Received currency does not match the expected currency
    #[error("Payment currency mismatch: expected `{expected}` got `{actual}`")]
    PaymentCurrencyMismatch {
        /// Currency the invoice expects
        expected: String,
        /// Currency the plugin reported
        actual: String,
    },
    /// Received denomination does not match the expected denomination
    #[error("Payment denomination mismatch: expected `{expected}` got `{actual}`")]
    PaymentDenominationMismatch {
        /// Denomination the invoice expects
        expected: Denomination,
        /// Denomination the plugin reported
        actual: Denomination,
    },
    /// Private payment files require an invoice id
    #[error("Payload client order id is missing")]
    ClientOrderIdMissing,

    /// Engine has not completed initialisation
    #[error("Engine is not ready")]
    NotReady,
    /// No receiver has been initialised for incoming payments
    #[error("Receiver is not ready")]
    ReceiverNotReady,

    /// Amount error
    #[error(transparent)]
    Amount(#[from] amount::Error),
    /// State machine error
    #[error(transparent)]
    State(#[from] state::Error),
    /// Store error
    #[error(transparent)]
    Database(#[from] database::Error),
    /// Plugin error
    #[error(transparent)]
    Plugin(#[from] payment::Error),
    /// Transport error
    #[error(transparent)]
    Transport(#[from] transport::Error),
    /// Serde error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Custom
    #[error("`{0}`")]
    Custom(String),
}
