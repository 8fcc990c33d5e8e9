//! Memory Database

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use paykit_common::database::{
    Database, Error, IncomingPaymentFilter, IncomingPaymentUpdate, OrderUpdate,
    OutgoingPaymentFilter, OutgoingPaymentUpdate, Removed,
};
use paykit_common::{IncomingPayment, Order, OutgoingPayment};
use tokio::sync::RwLock;

/// In-memory [`Database`] implementation
///
/// Backs tests and embeddings that do not need on-disk durability. Writes are
/// serialised per map and visible to the next read in the same process.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    ready: Arc<AtomicBool>,
    orders: Arc<RwLock<HashMap<String, Order>>>,
    outgoing: Arc<RwLock<HashMap<String, OutgoingPayment>>>,
    incoming: Arc<RwLock<HashMap<String, IncomingPayment>>>,
}

impl MemoryDatabase {
    /// New empty store; [`Database::init`] must run before use
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_ready(&self) -> Result<(), Error> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    type Err = Error;

    async fn init(&self) -> Result<(), Error> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn save_order(&self, order: &Order) -> Result<(), Error> {
        self.ensure_ready()?;
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(Error::DuplicateId(order.id.clone()));
        }
        orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn get_order(&self, id: &str, removed: Removed) -> Result<Option<Order>, Error> {
        self.ensure_ready()?;
        Ok(self
            .orders
            .read()
            .await
            .get(id)
            .filter(|order| removed.matches(order.removed))
            .cloned())
    }

    async fn update_order(&self, id: &str, update: OrderUpdate) -> Result<Order, Error> {
        self.ensure_ready()?;
        if update.is_empty() {
            return Err(Error::InvalidPatch);
        }
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(state) = update.state {
            order.state = state;
        }
        if let Some(last_payment_at) = update.last_payment_at {
            order.last_payment_at = Some(last_payment_at);
        }
        if let Some(removed) = update.removed {
            order.removed = removed;
        }
        Ok(order.clone())
    }

    async fn save_outgoing_payment(&self, payment: &OutgoingPayment) -> Result<(), Error> {
        self.ensure_ready()?;
        let mut payments = self.outgoing.write().await;
        if payments.contains_key(&payment.id) {
            return Err(Error::DuplicateId(payment.id.clone()));
        }
        payments.insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    async fn get_outgoing_payment(
        &self,
        id: &str,
        removed: Removed,
    ) -> Result<Option<OutgoingPayment>, Error> {
        self.ensure_ready()?;
        Ok(self
            .outgoing
            .read()
            .await
            .get(id)
            .filter(|payment| removed.matches(payment.removed))
            .cloned())
    }

    async fn update_outgoing_payment(
        &self,
        id: &str,
        update: OutgoingPaymentUpdate,
    ) -> Result<OutgoingPayment, Error> {
        self.ensure_ready()?;
        if update.is_empty() {
            return Err(Error::InvalidPatch);
        }
        let mut payments = self.outgoing.write().await;
        let payment = payments
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(state) = update.state {
            payment.state = state;
        }
        if let Some(execute_at) = update.execute_at {
            payment.execute_at = execute_at;
        }
        if let Some(plugin_update) = update.plugin_update {
            payment.plugin_update = Some(plugin_update);
        }
        if let Some(removed) = update.removed {
            payment.removed = removed;
        }
        Ok(payment.clone())
    }

    async fn get_outgoing_payments(
        &self,
        filter: OutgoingPaymentFilter,
    ) -> Result<Vec<OutgoingPayment>, Error> {
        self.ensure_ready()?;
        let mut matches: Vec<OutgoingPayment> = self
            .outgoing
            .read()
            .await
            .values()
            .filter(|payment| filter.removed.matches(payment.removed))
            .filter(|payment| {
                filter
                    .order_id
                    .as_ref()
                    .is_none_or(|order_id| &payment.order_id == order_id)
            })
            .filter(|payment| {
                filter
                    .client_order_id
                    .as_ref()
                    .is_none_or(|client_order_id| &payment.client_order_id == client_order_id)
            })
            .filter(|payment| {
                filter
                    .state
                    .is_none_or(|state| payment.state.internal_state() == state)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            a.execute_at
                .cmp(&b.execute_at)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(matches)
    }

    async fn save_incoming_payment(&self, payment: &IncomingPayment) -> Result<(), Error> {
        self.ensure_ready()?;
        let mut payments = self.incoming.write().await;
        if payments.contains_key(&payment.id) {
            return Err(Error::DuplicateId(payment.id.clone()));
        }
        payments.insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    async fn get_incoming_payment(
        &self,
        id: &str,
        removed: Removed,
    ) -> Result<Option<IncomingPayment>, Error> {
        self.ensure_ready()?;
        Ok(self
            .incoming
            .read()
            .await
            .get(id)
            .filter(|payment| removed.matches(payment.removed))
            .cloned())
    }

    async fn update_incoming_payment(
        &self,
        id: &str,
        update: IncomingPaymentUpdate,
    ) -> Result<IncomingPayment, Error> {
        self.ensure_ready()?;
        if update.is_empty() {
            return Err(Error::InvalidPatch);
        }
        let mut payments = self.incoming.write().await;
        let payment = payments
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(amount) = update.amount {
            payment.amount = Some(amount);
        }
        if let Some(internal_state) = update.internal_state {
            payment.internal_state = internal_state;
        }
        if let Some(received_by_plugins) = update.received_by_plugins {
            payment.received_by_plugins = received_by_plugins;
        }
        if let Some(continuation_url) = update.continuation_url {
            payment.continuation_url = Some(continuation_url);
        }
        if let Some(removed) = update.removed {
            payment.removed = removed;
        }
        Ok(payment.clone())
    }

    async fn get_incoming_payments(
        &self,
        filter: IncomingPaymentFilter,
    ) -> Result<Vec<IncomingPayment>, Error> {
        self.ensure_ready()?;
        let mut matches: Vec<IncomingPayment> = self
            .incoming
            .read()
            .await
            .values()
            .filter(|payment| filter.removed.matches(payment.removed))
            .filter(|payment| {
                filter
                    .client_order_id
                    .as_ref()
                    .is_none_or(|client_order_id| {
                        payment.client_order_id.as_ref() == Some(client_order_id)
                    })
            })
            .filter(|payment| {
                filter
                    .internal_state
                    .is_none_or(|state| payment.internal_state == state)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test;

    #[tokio::test]
    async fn test_not_ready_before_init() {
        test::not_ready_before_init(MemoryDatabase::new()).await;
    }

    #[tokio::test]
    async fn test_outgoing_payment_round_trip() {
        test::outgoing_payment_round_trip(MemoryDatabase::new()).await;
    }

    #[tokio::test]
    async fn test_tombstone_visibility() {
        test::tombstone_visibility(MemoryDatabase::new()).await;
    }

    #[tokio::test]
    async fn test_duplicate_save_rejected() {
        test::duplicate_save_rejected(MemoryDatabase::new()).await;
    }

    #[tokio::test]
    async fn test_patch_merges_shallowly() {
        test::patch_merges_shallowly(MemoryDatabase::new()).await;
    }

    #[tokio::test]
    async fn test_empty_patch_rejected() {
        test::empty_patch_rejected(MemoryDatabase::new()).await;
    }

    #[tokio::test]
    async fn test_filters_are_conjunctive() {
        test::filters_are_conjunctive(MemoryDatabase::new()).await;
    }

    #[tokio::test]
    async fn test_incoming_payment_round_trip() {
        test::incoming_payment_round_trip(MemoryDatabase::new()).await;
    }
}
