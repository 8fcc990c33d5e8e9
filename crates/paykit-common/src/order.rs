//! Payment order records

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::{Amount, Denomination};
use crate::error::Error;
use crate::state;
use crate::util::unix_time_ms;

/// Smallest supported recurrence interval, in milliseconds
pub const MIN_FREQUENCY_MS: u64 = 1;

/// Number of payments materialised per batch for unbounded recurring orders
pub const BATCH_SIZE: usize = 100;

/// Lifecycle state of a payment order
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    /// Constructed but not yet persisted
    Created,
    /// Persisted with its payments materialised
    Initialized,
    /// At least one payment has been driven
    Processing,
    /// Every payment resolved
    Completed,
    /// Cancelled before completion
    Cancelled,
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderState::Created => write!(f, "CREATED"),
            OrderState::Initialized => write!(f, "INITIALIZED"),
            OrderState::Processing => write!(f, "PROCESSING"),
            OrderState::Completed => write!(f, "COMPLETED"),
            OrderState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Parameters for creating a payment order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderParams {
    /// Caller-supplied external order id
    #[serde(default)]
    pub client_order_id: String,
    /// Decimal-string amount of each payment
    #[serde(default)]
    pub amount: String,
    /// Currency tag, defaults to `BTC`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Denomination, defaults to `BASE`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denomination: Option<Denomination>,
    /// Counterparty catalogue url
    #[serde(default)]
    pub counterparty_url: String,
    /// Free-form note forwarded to plugins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    /// Plugin names in retry order
    #[serde(default)]
    pub sending_priority: Vec<String>,
    /// Recurrence interval in milliseconds, `0` for one-time orders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u64>,
    /// Execution time of the first payment, defaults to now
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_payment_at: Option<u64>,
    /// Exclusive upper bound on recurring payment execution times
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_payment_at: Option<u64>,
}

/// A payment order: one one-time payment or a recurring series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Order id
    pub id: String,
    /// Caller-supplied external order id
    pub client_order_id: String,
    /// Lifecycle state
    pub state: OrderState,
    /// Recurrence interval in milliseconds, `0` for one-time orders
    pub frequency: u64,
    /// Amount of each payment
    pub amount: Amount,
    /// Counterparty catalogue url
    pub counterparty_url: String,
    /// Free-form note forwarded to plugins
    #[serde(default)]
    pub memo: String,
    /// Plugin names in retry order
    pub sending_priority: Vec<String>,
    /// Creation time, milliseconds since epoch
    pub created_at: u64,
    /// Execution time of the first payment
    pub first_payment_at: u64,
    /// Exclusive upper bound on recurring payment execution times
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_payment_at: Option<u64>,
    /// Tombstone flag
    #[serde(default)]
    pub removed: bool,
}

impl Order {
    /// Validate order parameters and construct a `CREATED` order
    pub fn new(params: OrderParams) -> Result<Self, Error> {
        if params.counterparty_url.is_empty()
            && params.amount.is_empty()
            && params.sending_priority.is_empty()
        {
            return Err(Error::NoOrderParams);
        }
        if params.counterparty_url.trim().is_empty() {
            return Err(Error::CounterpartyRequired);
        }
        if params.sending_priority.is_empty() {
            return Err(Error::State(state::Error::NoPluginsProvided));
        }

        let frequency = params.frequency.unwrap_or(0);
        let now = unix_time_ms();
        let first_payment_at = params.first_payment_at.unwrap_or(now);
        if let Some(last_payment_at) = params.last_payment_at {
            if frequency < MIN_FREQUENCY_MS {
                return Err(Error::InvalidFrequency(frequency));
            }
            if last_payment_at <= first_payment_at {
                return Err(Error::InvalidTimestamp(
                    "lastPaymentAt must be after firstPaymentAt".to_string(),
                ));
            }
        }

        let amount = Amount::new(
            &params.amount,
            params.currency.as_deref(),
            params.denomination,
        )?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            client_order_id: params.client_order_id,
            state: OrderState::Created,
            frequency,
            amount,
            counterparty_url: params.counterparty_url,
            memo: params.memo.unwrap_or_default(),
            sending_priority: params.sending_priority,
            created_at: now,
            first_payment_at,
            last_payment_at: params.last_payment_at,
            removed: false,
        })
    }

    /// Whether the order materialises more than one payment
    pub fn is_recurring(&self) -> bool {
        self.frequency > 0
    }

    /// Number of payments the next batch materialises
    ///
    /// One-time orders hold exactly one payment. A bounded recurring order
    /// holds `floor((last - first) / frequency)` payments, treating
    /// `last_payment_at` as an exclusive upper bound; an unbounded one is
    /// extended [`BATCH_SIZE`] payments at a time.
    pub fn batch_size(&self) -> usize {
        if !self.is_recurring() {
            return 1;
        }
        match self.last_payment_at {
            Some(last) => ((last - self.first_payment_at) / self.frequency) as usize,
            None => BATCH_SIZE,
        }
    }

    /// Execution time of the payment at `index` in the series
    pub fn execute_at(&self, index: usize) -> u64 {
        self.first_payment_at + index as u64 * self.frequency
    }
}
