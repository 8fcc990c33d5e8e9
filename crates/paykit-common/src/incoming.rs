//! Incoming payment records

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::amount::{self, Amount};
use crate::state::{InternalState, PaymentDirection, PluginRunState};
use crate::util::unix_time_ms;

/// One plugin-reported receipt against an incoming payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginReceipt {
    /// Reporting plugin
    pub name: String,
    /// Receipt state
    pub state: PluginRunState,
    /// Received amount
    pub amount: Amount,
    /// Method-specific raw payment data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Value>,
    /// Receipt time, milliseconds since epoch
    pub received_at: u64,
}

/// An incoming payment, reconciled from plugin receipts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingPayment {
    /// Payment id
    pub id: String,
    /// Invoice id for personal payments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    /// Free-form note
    #[serde(default)]
    pub memo: String,
    /// Reconciled amount, set once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,
    /// Amount a personal invoice expects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_amount: Option<Amount>,
    /// Payment direction, always `IN`
    pub direction: PaymentDirection,
    /// Lifecycle state, `IN_PROGRESS` until the expectation is met
    pub internal_state: InternalState,
    /// Receipts reported by plugins
    #[serde(default)]
    pub received_by_plugins: Vec<PluginReceipt>,
    /// Continuation invoice url published after a shortfall
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_url: Option<String>,
    /// Creation time, milliseconds since epoch
    pub created_at: u64,
    /// Tombstone flag
    #[serde(default)]
    pub removed: bool,
}

impl IncomingPayment {
    /// New payment awaiting receipts against a personal invoice
    pub fn new_invoice(client_order_id: &str, expected_amount: Amount, memo: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            client_order_id: Some(client_order_id.to_string()),
            memo: memo.to_string(),
            amount: None,
            expected_amount: Some(expected_amount),
            direction: PaymentDirection::In,
            internal_state: InternalState::InProgress,
            received_by_plugins: Vec::new(),
            continuation_url: None,
            created_at: unix_time_ms(),
            removed: false,
        }
    }

    /// New completed payment for a spontaneous (non-personal) receipt
    pub fn new_received(receipt: PluginReceipt, memo: &str, client_order_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            client_order_id,
            memo: memo.to_string(),
            amount: Some(receipt.amount.clone()),
            expected_amount: None,
            direction: PaymentDirection::In,
            internal_state: InternalState::Completed,
            received_by_plugins: vec![receipt],
            continuation_url: None,
            created_at: unix_time_ms(),
            removed: false,
        }
    }

    /// Sum of all plugin receipts
    pub fn total_received(&self) -> Result<Option<Amount>, amount::Error> {
        let mut receipts = self.received_by_plugins.iter();
        let Some(first) = receipts.next() else {
            return Ok(None);
        };
        let mut total = first.amount.clone();
        for receipt in receipts {
            total = total.checked_add(&receipt.amount)?;
        }
        Ok(Some(total))
    }

    /// Shortfall against the expected amount, `None` once covered
    pub fn missing_amount(&self) -> Result<Option<Amount>, amount::Error> {
        let Some(expected) = &self.expected_amount else {
            return Ok(None);
        };
        let Some(total) = self.total_received()? else {
            return Ok(Some(expected.clone()));
        };
        if total.meets(expected)? {
            return Ok(None);
        }
        expected.checked_sub(&total).map(Some)
    }
}
