//! Engine store contract
//!
//! Durable CRUD over orders and payments. Records are never physically
//! deleted: `removed = true` tombstones a record and default reads skip it.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::amount::Amount;
use crate::incoming::{IncomingPayment, PluginReceipt};
use crate::order::{Order, OrderState};
use crate::outgoing::OutgoingPayment;
use crate::state::{InternalState, PaymentState};

/// Store error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Store has not completed initialisation
    #[error("Store is not ready")]
    NotReady,
    /// Record not found
    #[error("Record `{0}` not found")]
    NotFound(String),
    /// A record with the same id already exists
    #[error("Record `{0}` already exists")]
    DuplicateId(String),
    /// Patch carries no fields to apply
    #[error("Invalid patch")]
    InvalidPatch,
    /// Backend error
    #[error(transparent)]
    Database(Box<dyn std::error::Error + Send + Sync>),
    /// Serde error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Tombstone visibility for reads
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Removed {
    /// Only records that are not tombstoned
    #[default]
    Exclude,
    /// Only tombstoned records
    Only,
    /// Both live and tombstoned records
    Any,
}

impl Removed {
    /// Whether a record with the given tombstone flag is visible
    pub fn matches(&self, removed: bool) -> bool {
        match self {
            Removed::Exclude => !removed,
            Removed::Only => removed,
            Removed::Any => true,
        }
    }
}

/// Shallow merge patch for an order
#[derive(Debug, Default, Clone)]
pub struct OrderUpdate {
    /// Replacement order state
    pub state: Option<OrderState>,
    /// Extend the recurrence bound
    pub last_payment_at: Option<u64>,
    /// Tombstone flag
    pub removed: Option<bool>,
}

impl OrderUpdate {
    /// Whether the patch carries no fields
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.last_payment_at.is_none() && self.removed.is_none()
    }
}

/// Shallow merge patch for an outgoing payment
#[derive(Debug, Default, Clone)]
pub struct OutgoingPaymentUpdate {
    /// Replacement state machine snapshot
    pub state: Option<PaymentState>,
    /// Reschedule the payment
    pub execute_at: Option<u64>,
    /// Latest raw plugin update
    pub plugin_update: Option<Value>,
    /// Tombstone flag
    pub removed: Option<bool>,
}

impl OutgoingPaymentUpdate {
    /// Whether the patch carries no fields
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.execute_at.is_none()
            && self.plugin_update.is_none()
            && self.removed.is_none()
    }
}

/// Shallow merge patch for an incoming payment
#[derive(Debug, Default, Clone)]
pub struct IncomingPaymentUpdate {
    /// Reconciled amount
    pub amount: Option<Amount>,
    /// Replacement lifecycle state
    pub internal_state: Option<InternalState>,
    /// Replacement receipt log
    pub received_by_plugins: Option<Vec<PluginReceipt>>,
    /// Continuation invoice url after a shortfall
    pub continuation_url: Option<String>,
    /// Tombstone flag
    pub removed: Option<bool>,
}

impl IncomingPaymentUpdate {
    /// Whether the patch carries no fields
    pub fn is_empty(&self) -> bool {
        self.amount.is_none()
            && self.internal_state.is_none()
            && self.received_by_plugins.is_none()
            && self.continuation_url.is_none()
            && self.removed.is_none()
    }
}

/// Scalar-equality filter over outgoing payments
#[derive(Debug, Default, Clone)]
pub struct OutgoingPaymentFilter {
    /// Owning order id
    pub order_id: Option<String>,
    /// Caller-supplied order id
    pub client_order_id: Option<String>,
    /// Lifecycle state
    pub state: Option<InternalState>,
    /// Tombstone visibility
    pub removed: Removed,
}

/// Scalar-equality filter over incoming payments
#[derive(Debug, Default, Clone)]
pub struct IncomingPaymentFilter {
    /// Invoice id
    pub client_order_id: Option<String>,
    /// Lifecycle state
    pub internal_state: Option<InternalState>,
    /// Tombstone visibility
    pub removed: Removed,
}

/// Payment engine database
///
/// All operations are asynchronous but serialisable with respect to a single
/// logical engine; saves are idempotent on id and refuse duplicates.
#[async_trait]
pub trait Database: Debug + Send + Sync {
    /// Database error
    type Err: Into<Error> + From<Error> + Send + Sync;

    /// Complete initialisation; operations before this return [`Error::NotReady`]
    async fn init(&self) -> Result<(), Self::Err>;

    /// Persist a new order
    async fn save_order(&self, order: &Order) -> Result<(), Self::Err>;

    /// Read an order by id
    async fn get_order(&self, id: &str, removed: Removed) -> Result<Option<Order>, Self::Err>;

    /// Apply a patch to an order and return the updated record
    async fn update_order(&self, id: &str, update: OrderUpdate) -> Result<Order, Self::Err>;

    /// Persist a new outgoing payment
    async fn save_outgoing_payment(&self, payment: &OutgoingPayment) -> Result<(), Self::Err>;

    /// Read an outgoing payment by id
    async fn get_outgoing_payment(
        &self,
        id: &str,
        removed: Removed,
    ) -> Result<Option<OutgoingPayment>, Self::Err>;

    /// Apply a patch to an outgoing payment and return the updated record
    async fn update_outgoing_payment(
        &self,
        id: &str,
        update: OutgoingPaymentUpdate,
    ) -> Result<OutgoingPayment, Self::Err>;

    /// All outgoing payments matching the conjunction of filter fields
    async fn get_outgoing_payments(
        &self,
        filter: OutgoingPaymentFilter,
    ) -> Result<Vec<OutgoingPayment>, Self::Err>;

    /// Persist a new incoming payment
    async fn save_incoming_payment(&self, payment: &IncomingPayment) -> Result<(), Self::Err>;

    /// Read an incoming payment by id
    async fn get_incoming_payment(
        &self,
        id: &str,
        removed: Removed,
    ) -> Result<Option<IncomingPayment>, Self::Err>;

    /// Apply a patch to an incoming payment and return the updated record
    async fn update_incoming_payment(
        &self,
        id: &str,
        update: IncomingPaymentUpdate,
    ) -> Result<IncomingPayment, Self::Err>;

    /// All incoming payments matching the conjunction of filter fields
    async fn get_incoming_payments(
        &self,
        filter: IncomingPaymentFilter,
    ) -> Result<Vec<IncomingPayment>, Self::Err>;
}

/// Shared handle to the engine database
pub type DynDatabase = Arc<dyn Database<Err = Error> + Send + Sync>;
