//! Outgoing payment records

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::amount::Amount;
use crate::order::Order;
use crate::payment::PaymentPayload;
use crate::state::{self, PaymentDirection, PaymentState, PluginRun};
use crate::util::unix_time_ms;

/// A single outgoing payment of a payment order
///
/// Owns the per-payment [`PaymentState`] driving plugin attempts. Mutated
/// exclusively through state transitions; never physically deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingPayment {
    /// Payment id
    pub id: String,
    /// Owning order id
    pub order_id: String,
    /// Caller-supplied external order id
    pub client_order_id: String,
    /// Counterparty catalogue url
    pub counterparty_url: String,
    /// Free-form note forwarded to plugins
    #[serde(default)]
    pub memo: String,
    /// Plugin names in retry order
    pub sending_priority: Vec<String>,
    /// Payment amount
    pub amount: Amount,
    /// Payment direction, always `OUT`
    pub direction: PaymentDirection,
    /// Creation time, milliseconds since epoch
    pub created_at: u64,
    /// Earliest execution time
    pub execute_at: u64,
    /// Plugin attempt state machine
    pub state: PaymentState,
    /// Latest raw update reported by a plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_update: Option<Value>,
    /// Tombstone flag
    #[serde(default)]
    pub removed: bool,
}

impl OutgoingPayment {
    /// Materialise the payment of `order` scheduled at `execute_at`
    pub fn new(order: &Order, execute_at: u64) -> Result<Self, state::Error> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            order_id: order.id.clone(),
            client_order_id: order.client_order_id.clone(),
            counterparty_url: order.counterparty_url.clone(),
            memo: order.memo.clone(),
            sending_priority: order.sending_priority.clone(),
            amount: order.amount.clone(),
            direction: PaymentDirection::Out,
            created_at: unix_time_ms(),
            execute_at,
            state: PaymentState::new(&order.sending_priority)?,
            plugin_update: None,
            removed: false,
        })
    }

    /// Attempt currently underway
    pub fn current_plugin(&self) -> Option<&PluginRun> {
        self.state.current_plugin()
    }

    /// Whether the payment reached a terminal state
    pub fn is_final(&self) -> bool {
        self.state.is_final()
    }

    /// Whether every plugin attempt failed
    pub fn is_failed(&self) -> bool {
        self.state.is_failed()
    }

    /// Whether a plugin attempt is underway or pending
    pub fn is_in_progress(&self) -> bool {
        self.state.is_in_progress()
    }

    /// Whether the payment is due for execution
    pub fn is_due(&self, now: u64) -> bool {
        self.execute_at <= now
    }

    /// Restriction of the record handed to a plugin's `pay`
    pub fn to_payload(&self) -> PaymentPayload {
        PaymentPayload {
            id: self.id.clone(),
            order_id: self.order_id.clone(),
            memo: self.memo.clone(),
            amount: self.amount.value().to_string(),
            currency: self.amount.currency().to_string(),
            denomination: self.amount.denomination(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderParams;

    fn order() -> Order {
        Order::new(OrderParams {
            client_order_id: "co-1".to_string(),
            amount: "100".to_string(),
            counterparty_url: "slash:xyz".to_string(),
            sending_priority: vec!["p2sh".to_string(), "p2tr".to_string()],
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_payment_from_order() {
        let order = order();
        let payment = OutgoingPayment::new(&order, order.first_payment_at).unwrap();
        assert_eq!(payment.order_id, order.id);
        assert_eq!(payment.direction, PaymentDirection::Out);
        assert_eq!(payment.state.pending_plugins(), order.sending_priority);
        assert!(!payment.is_final());
    }

    #[test]
    fn test_payload_restriction() {
        let order = order();
        let payment = OutgoingPayment::new(&order, 0).unwrap();
        let payload = payment.to_payload();
        assert_eq!(payload.id, payment.id);
        assert_eq!(payload.order_id, order.id);
        assert_eq!(payload.amount, "100");
        assert_eq!(payload.currency, "BTC");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["orderId"], order.id);
        assert!(json.get("counterpartyUrl").is_none());
    }
}
