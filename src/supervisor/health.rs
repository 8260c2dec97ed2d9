//! Health probe seam

use async_trait::async_trait;

use crate::Result;

/// Reads the delivered frame rate a running worker reports about itself.
///
/// Typically backed by the worker's status endpoint. An error is treated as a
/// stalled sample.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn sample(&self) -> Result<f32>;
}

/// Probe answering from a closure, for in-process workers.
pub struct FnProbe<F>(pub F);

#[async_trait]
impl<F> HealthProbe for FnProbe<F>
where
    F: Fn() -> Result<f32> + Send + Sync + 'static,
{
    async fn sample(&self) -> Result<f32> {
        (self.0)()
    }
}

impl<F> std::fmt::Debug for FnProbe<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnProbe")
    }
}
