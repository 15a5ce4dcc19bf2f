use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::ConnectError;

/// An established connection to an external capability.
///
/// The wire behaviour is entirely the implementor's concern; the engine only
/// pools, leases and eventually closes instances.
pub trait Connection: Send + Sync + 'static {
    /// Whether this instance may be handed out again after release.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Close the underlying resource. Must be idempotent.
    fn close(&self) {}

    /// Downcast hook so units can reach the concrete connection type.
    fn as_any(&self) -> &dyn Any;
}

/// Establishes new connections for one capability.
pub trait Connector: Send + Sync + 'static {
    /// Open a fresh connection, signalling transient vs permanent failure.
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>, ConnectError>>;
}
