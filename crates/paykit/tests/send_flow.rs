//! End-to-end send flows against scripted fake plugins
#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use anyhow::Result;
use paykit::common::payment::{PaymentUpdatePayload, PluginPayload, PluginPaymentState};
use paykit::common::util::unix_time_ms;
use paykit::common::{Error, InternalState, OrderParams, OrderState, PluginRunState};
use paykit::Notification;
use paykit_fake_plugin::FakePluginFactory;
use serde_json::json;

use common::Harness;

fn order_params(counterparty_url: &str, first_payment_at: u64) -> OrderParams {
    OrderParams {
        client_order_id: "co-1".to_string(),
        amount: "100".to_string(),
        currency: Some("BTC".to_string()),
        counterparty_url: counterparty_url.to_string(),
        sending_priority: vec!["p2sh".to_string(), "p2tr".to_string()],
        first_payment_at: Some(first_payment_at),
        ..Default::default()
    }
}

fn payload_updates(notifications: &[Notification]) -> Vec<PaymentUpdatePayload> {
    notifications
        .iter()
        .filter_map(|notification| match notification {
            Notification::Payload(PluginPayload::PaymentUpdate(update)) => Some(update.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_create_payment_order() -> Result<()> {
    let harness = Harness::new(vec![
        Arc::new(FakePluginFactory::new("p2sh")),
        Arc::new(FakePluginFactory::new("p2tr")),
    ])
    .await;
    let counterparty = harness
        .seed_counterparty("slash://bob", &["p2sh", "p2tr"])
        .await;

    let first_payment_at = unix_time_ms();
    let order = harness
        .manager
        .create_payment_order(order_params(&counterparty, first_payment_at))
        .await?;

    assert_eq!(order.state, OrderState::Initialized);
    assert_eq!(order.client_order_id, "co-1");

    let payments = harness.payments_of(&order.id).await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].execute_at, first_payment_at);
    assert_eq!(payments[0].state.internal_state(), InternalState::Initial);
    Ok(())
}

#[tokio::test]
async fn test_payment_completes_with_first_plugin() -> Result<()> {
    let p2sh = Arc::new(FakePluginFactory::new("p2sh"));
    let p2tr = Arc::new(FakePluginFactory::new("p2tr"));
    let harness = Harness::new(vec![p2sh.clone(), p2tr.clone()]).await;
    let counterparty = harness
        .seed_counterparty("slash://bob", &["p2sh", "p2tr"])
        .await;

    let order = harness
        .manager
        .create_payment_order(order_params(&counterparty, unix_time_ms()))
        .await?;
    harness.manager.send_payment(&order.id).await?;

    let stored = harness
        .db
        .get_order(&order.id, Default::default())
        .await?
        .unwrap();
    assert_eq!(stored.state, OrderState::Completed);

    let payments = harness.payments_of(&order.id).await;
    assert_eq!(payments.len(), 1);
    let state = &payments[0].state;
    assert_eq!(state.internal_state(), InternalState::Completed);
    assert_eq!(state.completed_by_plugin().unwrap().name, "p2sh");
    assert!(state.tried_plugins().is_empty());

    // The untried fallback plugin was never invoked
    let p2tr_plugin = p2tr.instance().await.unwrap();
    assert!(p2tr_plugin.pay_calls().await.is_empty());

    assert!(harness.notifications().iter().any(|notification| matches!(
        notification,
        Notification::Payload(PluginPayload::PaymentOrderCompleted { order_id, .. })
            if order_id == &order.id
    )));
    Ok(())
}

#[tokio::test]
async fn test_payment_falls_back_to_next_plugin() -> Result<()> {
    let p2sh = Arc::new(
        FakePluginFactory::new("p2sh").with_outcomes(vec![PluginPaymentState::Failed]),
    );
    let p2tr = Arc::new(FakePluginFactory::new("p2tr"));
    let harness = Harness::new(vec![p2sh.clone(), p2tr.clone()]).await;
    let counterparty = harness
        .seed_counterparty("slash://bob", &["p2sh", "p2tr"])
        .await;

    let order = harness
        .manager
        .create_payment_order(order_params(&counterparty, unix_time_ms()))
        .await?;
    harness.manager.send_payment(&order.id).await?;

    let payments = harness.payments_of(&order.id).await;
    let state = &payments[0].state;
    assert_eq!(state.internal_state(), InternalState::Completed);
    assert_eq!(state.tried_plugins().len(), 1);
    assert_eq!(state.tried_plugins()[0].name, "p2sh");
    assert_eq!(state.tried_plugins()[0].state, PluginRunState::Failed);
    assert_eq!(state.completed_by_plugin().unwrap().name, "p2tr");

    let stored = harness
        .db
        .get_order(&order.id, Default::default())
        .await?
        .unwrap();
    assert_eq!(stored.state, OrderState::Completed);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_priority_fails_payment() -> Result<()> {
    let p2sh = Arc::new(
        FakePluginFactory::new("p2sh").with_outcomes(vec![PluginPaymentState::Failed]),
    );
    let p2tr = Arc::new(
        FakePluginFactory::new("p2tr").with_outcomes(vec![PluginPaymentState::Failed]),
    );
    let harness = Harness::new(vec![p2sh, p2tr]).await;
    let counterparty = harness
        .seed_counterparty("slash://bob", &["p2sh", "p2tr"])
        .await;

    let order = harness
        .manager
        .create_payment_order(order_params(&counterparty, unix_time_ms()))
        .await?;
    harness.manager.send_payment(&order.id).await?;

    let payments = harness.payments_of(&order.id).await;
    let state = &payments[0].state;
    assert_eq!(state.internal_state(), InternalState::Failed);
    assert_eq!(state.tried_plugins().len(), 2);
    assert!(state.completed_by_plugin().is_none());

    // The final report carries the exhaustion error
    let updates = payload_updates(&harness.notifications());
    let last = updates.last().unwrap();
    assert_eq!(last.plugin_state, PluginPaymentState::Failed);
    assert_eq!(
        last.data.as_ref().unwrap()["error"],
        Error::NoPluginsAvailable.to_string()
    );
    Ok(())
}

#[tokio::test]
async fn test_missing_endpoint_is_treated_as_plugin_failure() -> Result<()> {
    let p2sh = Arc::new(FakePluginFactory::new("p2sh"));
    let p2tr = Arc::new(FakePluginFactory::new("p2tr"));
    let harness = Harness::new(vec![p2sh.clone(), p2tr.clone()]).await;
    // The counterparty only publishes an endpoint for p2tr
    let counterparty = harness.seed_counterparty("slash://bob", &["p2tr"]).await;

    let order = harness
        .manager
        .create_payment_order(order_params(&counterparty, unix_time_ms()))
        .await?;
    harness.manager.send_payment(&order.id).await?;

    let payments = harness.payments_of(&order.id).await;
    let state = &payments[0].state;
    assert_eq!(state.internal_state(), InternalState::Completed);
    assert_eq!(state.tried_plugins()[0].name, "p2sh");
    assert_eq!(state.completed_by_plugin().unwrap().name, "p2tr");

    // p2sh was skipped without ever being invoked
    let p2sh_plugin = p2sh.instance().await.unwrap();
    assert!(p2sh_plugin.pay_calls().await.is_empty());
    let p2tr_plugin = p2tr.instance().await.unwrap();
    assert_eq!(p2tr_plugin.pay_calls().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_recurring_order_completes_partially() -> Result<()> {
    let p2sh = Arc::new(FakePluginFactory::new("p2sh"));
    let harness = Harness::new(vec![p2sh]).await;
    let counterparty = harness.seed_counterparty("slash://bob", &["p2sh"]).await;

    let first_payment_at = unix_time_ms();
    let order = harness
        .manager
        .create_payment_order(OrderParams {
            client_order_id: "sub-1".to_string(),
            amount: "10".to_string(),
            counterparty_url: counterparty,
            sending_priority: vec!["p2sh".to_string()],
            frequency: Some(60_000),
            first_payment_at: Some(first_payment_at),
            last_payment_at: Some(first_payment_at + 300_000),
            ..Default::default()
        })
        .await?;

    let payments = harness.payments_of(&order.id).await;
    assert_eq!(payments.len(), 5);
    for (index, payment) in payments.iter().enumerate() {
        assert_eq!(
            payment.execute_at,
            first_payment_at + index as u64 * 60_000
        );
    }

    harness.manager.send_payment(&order.id).await?;

    let payments = harness.payments_of(&order.id).await;
    let completed = payments
        .iter()
        .filter(|payment| payment.state.internal_state() == InternalState::Completed)
        .count();
    assert_eq!(completed, 1);

    // The order stays open for the remaining scheduled payments
    let stored = harness
        .db
        .get_order(&order.id, Default::default())
        .await?
        .unwrap();
    assert_eq!(stored.state, OrderState::Processing);
    assert!(harness.notifications().iter().any(|notification| matches!(
        notification,
        Notification::Payload(PluginPayload::PaymentOrderPartiallyCompleted { order_id, .. })
            if order_id == &order.id
    )));
    Ok(())
}

#[tokio::test]
async fn test_user_update_reaches_in_flight_plugin() -> Result<()> {
    // A scripted `submitted` outcome leaves the payment in flight
    let p2sh = Arc::new(
        FakePluginFactory::new("p2sh").with_outcomes(vec![PluginPaymentState::Submitted]),
    );
    let harness = Harness::new(vec![p2sh.clone()]).await;
    let counterparty = harness.seed_counterparty("slash://bob", &["p2sh"]).await;

    let order = harness
        .manager
        .create_payment_order(OrderParams {
            client_order_id: "co-2".to_string(),
            amount: "100".to_string(),
            counterparty_url: counterparty,
            sending_priority: vec!["p2sh".to_string()],
            ..Default::default()
        })
        .await?;
    harness.manager.send_payment(&order.id).await?;

    let payments = harness.payments_of(&order.id).await;
    assert_eq!(payments[0].state.internal_state(), InternalState::InProgress);
    let payment_id = payments[0].id.clone();

    harness
        .manager
        .entry_point_for_user(json!({
            "pluginName": "p2sh",
            "paymentId": payment_id,
            "answer": "yes",
        }))
        .await?;
    let plugin = p2sh.instance().await.unwrap();
    assert_eq!(plugin.update_calls().await.len(), 1);

    // The plugin later confirms the payment out of band
    harness
        .manager
        .entry_point_for_plugin(PluginPayload::PaymentUpdate(PaymentUpdatePayload {
            plugin_name: "p2sh".to_string(),
            order_id: order.id.clone(),
            plugin_state: PluginPaymentState::Success,
            data: None,
        }))
        .await?;

    let stored = harness
        .db
        .get_order(&order.id, Default::default())
        .await?
        .unwrap();
    assert_eq!(stored.state, OrderState::Completed);
    Ok(())
}

#[tokio::test]
async fn test_stale_update_is_dropped() -> Result<()> {
    let p2sh = Arc::new(FakePluginFactory::new("p2sh"));
    let harness = Harness::new(vec![p2sh]).await;
    let counterparty = harness.seed_counterparty("slash://bob", &["p2sh"]).await;

    let order = harness
        .manager
        .create_payment_order(OrderParams {
            client_order_id: "co-3".to_string(),
            amount: "100".to_string(),
            counterparty_url: counterparty,
            sending_priority: vec!["p2sh".to_string()],
            ..Default::default()
        })
        .await?;
    harness.manager.send_payment(&order.id).await?;

    // A late callback for the already-completed payment is ignored
    harness
        .manager
        .entry_point_for_plugin(PluginPayload::PaymentUpdate(PaymentUpdatePayload {
            plugin_name: "p2sh".to_string(),
            order_id: order.id.clone(),
            plugin_state: PluginPaymentState::Failed,
            data: None,
        }))
        .await?;

    let payments = harness.payments_of(&order.id).await;
    assert_eq!(payments[0].state.internal_state(), InternalState::Completed);
    Ok(())
}
