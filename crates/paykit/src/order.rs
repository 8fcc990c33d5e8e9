//! Payment order orchestration
//!
//! A [`PaymentOrder`] materialises its payments (one for a one-time order, a
//! batch for a recurring one), hands out the next actionable payment and
//! coordinates completion and cancellation. At most one payment of an order
//! is in flight at a time.

use paykit_common::database::{DynDatabase, OrderUpdate, OutgoingPaymentFilter, Removed};
use paykit_common::order::BATCH_SIZE;
use paykit_common::util::unix_time_ms;
use paykit_common::{Error, Order, OrderParams, OrderState, OutgoingPayment};

use crate::payment_object::PaymentObject;

/// A payment order and its materialised payments
#[derive(Debug)]
pub struct PaymentOrder {
    order: Order,
    payments: Vec<PaymentObject>,
    db: DynDatabase,
}

impl PaymentOrder {
    /// Validate parameters and construct a `CREATED` order
    pub fn new(params: OrderParams, db: DynDatabase) -> Result<Self, Error> {
        Ok(Self {
            order: Order::new(params)?,
            payments: Vec::new(),
            db,
        })
    }

    /// The order record
    pub fn order(&self) -> &Order {
        &self.order
    }

    /// Order id
    pub fn id(&self) -> &str {
        &self.order.id
    }

    /// Snapshots of the materialised payments, in execution order
    pub fn payment_records(&self) -> Vec<OutgoingPayment> {
        self.payments
            .iter()
            .map(|payment| payment.record().clone())
            .collect()
    }

    /// The payment currently in flight
    pub fn in_progress_payment(&self) -> Option<&OutgoingPayment> {
        self.payments
            .iter()
            .find(|payment| payment.is_in_progress())
            .map(|payment| payment.record())
    }

    pub(crate) fn in_progress_payment_mut(&mut self) -> Option<&mut PaymentObject> {
        self.payments.iter_mut().find(|payment| payment.is_in_progress())
    }

    pub(crate) fn db(&self) -> DynDatabase {
        self.db.clone()
    }

    /// Persist the order and materialise its first batch of payments
    pub async fn init(&mut self) -> Result<(), Error> {
        self.order.state = OrderState::Initialized;
        self.db.save_order(&self.order).await?;
        for index in 0..self.order.batch_size() {
            let mut payment = PaymentObject::from_order(
                &self.order,
                self.order.execute_at(index),
                self.db.clone(),
            )?;
            payment.init().await?;
            self.payments.push(payment);
        }
        tracing::info!(
            "Initialized order `{}` with {} payment(s)",
            self.order.id,
            self.payments.len()
        );
        Ok(())
    }

    /// The next actionable payment
    ///
    /// Returns the in-flight payment when one exists, otherwise drives the
    /// first non-terminal payment; recurring orders are extended by another
    /// batch once the current one is exhausted. A payment scheduled in the
    /// future is returned unchanged and the caller must re-poll.
    pub async fn process(&mut self) -> Result<OutgoingPayment, Error> {
        if self.payments.iter().any(|payment| payment.is_failed()) {
            return Err(Error::CanNotProcessOrder);
        }
        if let Some(payment) = self.in_progress_payment_mut() {
            return payment.process().await;
        }

        let index = match self.payments.iter().position(|payment| !payment.is_final()) {
            Some(index) => index,
            None => match self.extend_batch().await? {
                Some(index) => index,
                None => {
                    self.complete().await?;
                    return Err(Error::OrderCompleted);
                }
            },
        };

        if !self.payments[index].record().is_due(unix_time_ms()) {
            return Ok(self.payments[index].record().clone());
        }

        if self.order.state != OrderState::Processing {
            self.order = self
                .db
                .update_order(
                    &self.order.id,
                    OrderUpdate {
                        state: Some(OrderState::Processing),
                        ..Default::default()
                    },
                )
                .await?;
        }
        self.payments[index].process().await
    }

    /// Materialise the next batch of a recurring order
    ///
    /// Returns the index of the first new payment, or `None` when the order
    /// is not extendable.
    async fn extend_batch(&mut self) -> Result<Option<usize>, Error> {
        if !self.order.is_recurring() {
            return Ok(None);
        }
        let start = self.payments.len();
        for index in start..start + BATCH_SIZE {
            let execute_at = self.order.execute_at(index);
            if let Some(last_payment_at) = self.order.last_payment_at {
                // lastPaymentAt is an exclusive upper bound
                if execute_at >= last_payment_at {
                    break;
                }
            }
            let mut payment =
                PaymentObject::from_order(&self.order, execute_at, self.db.clone())?;
            payment.init().await?;
            self.payments.push(payment);
        }
        if self.payments.len() == start {
            Ok(None)
        } else {
            tracing::info!(
                "Extended order `{}` by {} payment(s)",
                self.order.id,
                self.payments.len() - start
            );
            Ok(Some(start))
        }
    }

    /// Mark the order completed
    ///
    /// Requires every payment terminal and at least one completed by a
    /// plugin; refuses from `CANCELLED` and `COMPLETED`.
    pub async fn complete(&mut self) -> Result<Order, Error> {
        match self.order.state {
            OrderState::Cancelled => Err(Error::OrderCancelled),
            OrderState::Completed => Err(Error::OrderCompleted),
            _ => {
                if self.payments.iter().any(|payment| !payment.is_final()) {
                    return Err(Error::OutstandingPayments);
                }
                if !self
                    .payments
                    .iter()
                    .any(|payment| payment.record().state.completed_by_plugin().is_some())
                {
                    return Err(Error::OutstandingPayments);
                }
                self.order = self
                    .db
                    .update_order(
                        &self.order.id,
                        OrderUpdate {
                            state: Some(OrderState::Completed),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(self.order.clone())
            }
        }
    }

    /// Cancel the order and every non-terminal payment
    pub async fn cancel(&mut self) -> Result<Order, Error> {
        if self.order.state == OrderState::Completed {
            return Err(Error::OrderCompleted);
        }
        for payment in &mut self.payments {
            if !payment.is_final() {
                payment.cancel().await?;
            }
        }
        self.order = self
            .db
            .update_order(
                &self.order.id,
                OrderUpdate {
                    state: Some(OrderState::Cancelled),
                    ..Default::default()
                },
            )
            .await?;
        Ok(self.order.clone())
    }

    /// Load an order and its live payments from the store
    pub async fn find(id: &str, db: DynDatabase) -> Result<Self, Error> {
        let order = db
            .get_order(id, Removed::Exclude)
            .await?
            .ok_or_else(|| Error::OrderNotFound(id.to_string()))?;
        let records = db
            .get_outgoing_payments(OutgoingPaymentFilter {
                order_id: Some(id.to_string()),
                ..Default::default()
            })
            .await?;
        let payments = records
            .into_iter()
            .map(|record| PaymentObject::new(record, db.clone()))
            .collect();
        Ok(Self {
            order,
            payments,
            db,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use paykit_common::InternalState;
    use paykit_common::util::unix_time_ms;

    use super::*;
    use crate::store::MemoryDatabase;

    fn params() -> OrderParams {
        OrderParams {
            client_order_id: "co-1".to_string(),
            amount: "100".to_string(),
            counterparty_url: "slash:xyz".to_string(),
            sending_priority: vec!["p2sh".to_string(), "p2tr".to_string()],
            ..Default::default()
        }
    }

    async fn db() -> DynDatabase {
        let db: DynDatabase = Arc::new(MemoryDatabase::new());
        db.init().await.expect("init");
        db
    }

    #[tokio::test]
    async fn test_one_time_order_materialises_one_payment() {
        let db = db().await;
        let mut order = PaymentOrder::new(params(), db.clone()).expect("valid params");
        order.init().await.expect("init");

        let found = PaymentOrder::find(order.id(), db).await.expect("found");
        assert_eq!(found.order().state, OrderState::Initialized);
        assert_eq!(found.payment_records().len(), 1);
        assert_eq!(
            found.payment_records()[0].execute_at,
            order.order().first_payment_at
        );
    }

    #[tokio::test]
    async fn test_recurring_order_materialises_batch() {
        let db = db().await;
        let first_payment_at = unix_time_ms();
        let mut p = params();
        p.frequency = Some(1000);
        p.first_payment_at = Some(first_payment_at);
        p.last_payment_at = Some(first_payment_at + 5000);
        let mut order = PaymentOrder::new(p, db).expect("valid params");
        order.init().await.expect("init");

        let records = order.payment_records();
        assert_eq!(records.len(), 5);
        for (index, record) in records.iter().enumerate() {
            assert_eq!(record.execute_at, first_payment_at + index as u64 * 1000);
        }
    }

    #[tokio::test]
    async fn test_process_engages_first_plugin() {
        let db = db().await;
        let mut order = PaymentOrder::new(params(), db).expect("valid params");
        order.init().await.expect("init");

        let payment = order.process().await.expect("processed");
        assert_eq!(payment.state.internal_state(), InternalState::InProgress);
        assert_eq!(payment.current_plugin().expect("engaged").name, "p2sh");
        assert_eq!(order.order().state, OrderState::Processing);
    }

    #[tokio::test]
    async fn test_process_defers_future_payment() {
        let db = db().await;
        let mut p = params();
        p.first_payment_at = Some(unix_time_ms() + 60_000);
        let mut order = PaymentOrder::new(p, db).expect("valid params");
        order.init().await.expect("init");

        let payment = order.process().await.expect("processed");
        assert_eq!(payment.state.internal_state(), InternalState::Initial);
        assert!(payment.current_plugin().is_none());
        // A deferred payment leaves the order untouched
        assert_eq!(order.order().state, OrderState::Initialized);
    }

    #[tokio::test]
    async fn test_cancel_cancels_non_final_payments() {
        let db = db().await;
        let mut order = PaymentOrder::new(params(), db.clone()).expect("valid params");
        order.init().await.expect("init");
        order.process().await.expect("processed");

        order.cancel().await.expect("cancelled");
        assert_eq!(order.order().state, OrderState::Cancelled);
        let found = PaymentOrder::find(order.id(), db).await.expect("found");
        // order state change persisted before reload
        assert_eq!(found.order().state, OrderState::Cancelled);
        assert!(found
            .payment_records()
            .iter()
            .all(|payment| payment.state.internal_state() == InternalState::Cancelled));
    }

    #[tokio::test]
    async fn test_complete_requires_terminal_payments() {
        let db = db().await;
        let mut order = PaymentOrder::new(params(), db).expect("valid params");
        order.init().await.expect("init");
        order.process().await.expect("processed");

        assert!(matches!(
            order.complete().await,
            Err(Error::OutstandingPayments)
        ));
    }
}
