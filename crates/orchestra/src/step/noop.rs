//! Step that does nothing

use super::{Step, StepResult};
use crate::runtime::ExitInfo;
use async_trait::async_trait;

/// Used when a service has nothing to do for a phase
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStep;

#[async_trait]
impl Step for NoopStep {
    async fn wait(&self) -> StepResult {
        Ok(ExitInfo::default())
    }

    async fn abort(&self, _force: bool) -> StepResult {
        Ok(ExitInfo::default())
    }
}
