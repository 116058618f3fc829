//! Restartable components.

use async_trait::async_trait;

use crate::error::Result;

/// A component the reconciler stops and restarts around a document swap.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Stop and wait until the component is quiescent.
    async fn stopkill(&self) -> Result<()>;

    /// Start again from the current document.
    async fn startup(&self) -> Result<()>;
}
