//! Outgoing payment bound to the store that persists it
//!
//! Every state transition is written through before control returns, so a
//! restart resumes from the last persisted state.

use paykit_common::database::{DynDatabase, OutgoingPaymentUpdate};
use paykit_common::order::Order;
use paykit_common::util::unix_time_ms;
use paykit_common::{Error, OutgoingPayment, PluginRun};
use serde_json::Value;

/// An outgoing payment together with its store handle
#[derive(Debug, Clone)]
pub struct PaymentObject {
    payment: OutgoingPayment,
    db: DynDatabase,
}

impl PaymentObject {
    /// Wrap an existing payment record
    pub fn new(payment: OutgoingPayment, db: DynDatabase) -> Self {
        Self { payment, db }
    }

    /// Materialise the payment of `order` scheduled at `execute_at`
    pub fn from_order(order: &Order, execute_at: u64, db: DynDatabase) -> Result<Self, Error> {
        Ok(Self {
            payment: OutgoingPayment::new(order, execute_at)?,
            db,
        })
    }

    /// The underlying record
    pub fn record(&self) -> &OutgoingPayment {
        &self.payment
    }

    /// Consume into the underlying record
    pub fn into_record(self) -> OutgoingPayment {
        self.payment
    }

    /// Persist the freshly created payment
    pub async fn init(&mut self) -> Result<(), Error> {
        self.db.save_outgoing_payment(&self.payment).await?;
        Ok(())
    }

    /// Drive the payment forward and return its resulting snapshot
    ///
    /// A payment scheduled in the future, or one with a plugin attempt
    /// already engaged, is returned unchanged; otherwise the next pending
    /// plugin is engaged, or the payment fails once the queue is exhausted.
    pub async fn process(&mut self) -> Result<OutgoingPayment, Error> {
        if !self.payment.is_due(unix_time_ms()) {
            tracing::debug!(
                "Payment `{}` is not due until {}",
                self.payment.id,
                self.payment.execute_at
            );
            return Ok(self.payment.clone());
        }
        if self.payment.current_plugin().is_some() {
            return Ok(self.payment.clone());
        }
        self.payment.state.process()?;
        self.persist_state().await?;
        Ok(self.payment.clone())
    }

    /// Resolve the current plugin attempt as the completing one
    pub async fn complete(&mut self) -> Result<OutgoingPayment, Error> {
        self.payment.state.complete()?;
        self.persist_state().await?;
        Ok(self.payment.clone())
    }

    /// Resolve the current plugin attempt as failed
    pub async fn fail_current_plugin(&mut self) -> Result<(), Error> {
        self.payment.state.fail_current_plugin()?;
        self.persist_state().await
    }

    /// Cancel the payment
    pub async fn cancel(&mut self) -> Result<(), Error> {
        self.payment.state.cancel()?;
        self.persist_state().await
    }

    /// Apply a patch to the persisted record
    pub async fn update(&mut self, update: OutgoingPaymentUpdate) -> Result<(), Error> {
        self.payment = self
            .db
            .update_outgoing_payment(&self.payment.id, update)
            .await?;
        Ok(())
    }

    /// Record the latest raw plugin update
    pub async fn mark_plugin_update(&mut self, update: Value) -> Result<(), Error> {
        self.update(OutgoingPaymentUpdate {
            plugin_update: Some(update),
            ..Default::default()
        })
        .await
    }

    /// Attempt currently underway
    pub fn current_plugin(&self) -> Option<&PluginRun> {
        self.payment.current_plugin()
    }

    /// Whether every plugin attempt failed
    pub fn is_failed(&self) -> bool {
        self.payment.is_failed()
    }

    /// Whether a plugin attempt is underway or pending
    pub fn is_in_progress(&self) -> bool {
        self.payment.is_in_progress()
    }

    /// Whether the payment reached a terminal state
    pub fn is_final(&self) -> bool {
        self.payment.is_final()
    }

    async fn persist_state(&mut self) -> Result<(), Error> {
        self.payment = self
            .db
            .update_outgoing_payment(
                &self.payment.id,
                OutgoingPaymentUpdate {
                    state: Some(self.payment.state.clone()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}
