//! Platform facades injected into rule scope
//!
//! Each facade is an opaque capability object giving rule code access to a
//! bounded slice of platform functionality. This crate only guarantees they
//! are bound under fixed names per format and never mutates them; the
//! implementations live in the host.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;

/// Asset query and mutation
pub trait AssetsFacade: Send + Sync {
    /// Read an asset attribute value
    fn attribute_value(&self, asset_id: &str, attribute: &str) -> Option<serde_json::Value>;

    /// Write an asset attribute value
    fn write_attribute(&self, asset_id: &str, attribute: &str, value: serde_json::Value)
        -> Result<()>;
}

/// User lookup
pub trait UsersFacade: Send + Sync {
    /// Resolve the user ids of a realm
    fn user_ids(&self, realm: &str) -> Vec<String>;
}

/// Notification dispatch
pub trait NotificationsFacade: Send + Sync {
    /// Send a notification to a target (user id, realm or topic)
    fn send(&self, target: &str, message: &str) -> Result<()>;
}

/// Historic datapoint access
pub trait HistoricDatapointsFacade: Send + Sync {
    /// Last stored value of an asset attribute, if any
    fn last_value(&self, asset_id: &str, attribute: &str) -> Option<f64>;
}

/// Predicted datapoint access
pub trait PredictedDatapointsFacade: Send + Sync {
    /// Predicted value of an asset attribute at `horizon_millis` from now
    fn predicted_value(&self, asset_id: &str, attribute: &str, horizon_millis: i64)
        -> Option<f64>;
}

/// The shared facade set handed to every compiler
#[derive(Clone)]
pub struct Facades {
    pub assets: Arc<dyn AssetsFacade>,
    pub users: Arc<dyn UsersFacade>,
    pub notifications: Arc<dyn NotificationsFacade>,
    pub historic_datapoints: Arc<dyn HistoricDatapointsFacade>,
    pub predicted_datapoints: Arc<dyn PredictedDatapointsFacade>,
}

impl Facades {
    /// A bundle of no-op facades
    ///
    /// Useful for hosts that compile rulesets without wiring the platform
    /// services, and for tests.
    pub fn noop() -> Self {
        Self {
            assets: Arc::new(NoopFacade),
            users: Arc::new(NoopFacade),
            notifications: Arc::new(NoopFacade),
            historic_datapoints: Arc::new(NoopFacade),
            predicted_datapoints: Arc::new(NoopFacade),
        }
    }
}

struct NoopFacade;

impl AssetsFacade for NoopFacade {
    fn attribute_value(&self, _asset_id: &str, _attribute: &str) -> Option<serde_json::Value> {
        None
    }

    fn write_attribute(
        &self,
        asset_id: &str,
        attribute: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        debug!("Noop asset write: {}:{} = {}", asset_id, attribute, value);
        Ok(())
    }
}

impl UsersFacade for NoopFacade {
    fn user_ids(&self, _realm: &str) -> Vec<String> {
        Vec::new()
    }
}

impl NotificationsFacade for NoopFacade {
    fn send(&self, target: &str, message: &str) -> Result<()> {
        debug!("Noop notification: {} <- {}", target, message);
        Ok(())
    }
}

impl HistoricDatapointsFacade for NoopFacade {
    fn last_value(&self, _asset_id: &str, _attribute: &str) -> Option<f64> {
        None
    }
}

impl PredictedDatapointsFacade for NoopFacade {
    fn predicted_value(
        &self,
        _asset_id: &str,
        _attribute: &str,
        _horizon_millis: i64,
    ) -> Option<f64> {
        None
    }
}
