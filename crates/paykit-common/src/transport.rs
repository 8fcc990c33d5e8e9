//! Transport contract for the endpoint catalogue
//!
//! A minimal key/value-over-URL store. The engine publishes the slashpay
//! catalogue through it and resolves counterparty endpoints from it; the
//! concrete transport (signed web drive) lives outside the engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transport error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Backend error
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
    /// Serde error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Custom
    #[error("`{0}`")]
    Custom(String),
}

/// Options for writing a payment file
#[derive(Debug, Default, Clone, Copy)]
pub struct CreateOptions {
    /// Await relay synchronisation before returning
    pub await_relay_sync: bool,
    /// Encrypt the payload
    pub encrypt: bool,
}

/// Key/value-over-URL store holding the endpoint catalogue
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Initialise the transport
    async fn init(&self) -> Result<(), Error>;

    /// Write `value` at `path` and return the public url
    async fn create(&self, path: &str, value: Value, opts: CreateOptions) -> Result<String, Error>;

    /// Read the value published at `url`
    async fn read_remote(&self, url: &str) -> Result<Option<Value>, Error>;

    /// Url a write at `path` would be published under
    async fn get_url(&self, path: &str) -> Result<String, Error>;

    /// Close the transport
    async fn close(&self) -> Result<(), Error>;
}

/// Shared handle to the transport
pub type DynTransport = Arc<dyn TransportConnector>;

/// Canonical path of the public endpoint index
pub const SLASHPAY_PATH: &str = "/public/slashpay.json";

const SLASHPAY_FILE: &str = "slashpay.json";

/// Path of a plugin's public payment file
pub fn public_plugin_path(plugin_name: &str) -> String {
    format!("/public/slashpay/{plugin_name}/{SLASHPAY_FILE}")
}

/// Path of the encrypted index of a private invoice
pub fn private_index_path(client_order_id: &str) -> String {
    format!("/slashpay/{client_order_id}/{SLASHPAY_FILE}")
}

/// Path of a plugin's encrypted payment file for a private invoice
pub fn private_plugin_path(client_order_id: &str, plugin_name: &str) -> String {
    format!("/slashpay/{client_order_id}/{plugin_name}/{SLASHPAY_FILE}")
}

/// Index of per-plugin payment endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEndpoints {
    /// Plugin name to payment file url
    pub payment_endpoints: BTreeMap<String, String>,
}
