//! CPU implementation of SensitivityAlgorithms.

use std::sync::Arc;

use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

use super::impl_generic::{
    TrajectoryResult, adjoint_sensitivity_impl, forward_sensitivity_impl, integrate_impl,
};
use super::system::OdeSystem;
use super::traits::SensitivityAlgorithms;
use super::types::{AdjointSensitivityResult, ForwardSensitivityResult};
use crate::error::DiffResult;

impl SensitivityAlgorithms<CpuRuntime> for CpuClient {
    fn integrate(
        &self,
        system: &Arc<OdeSystem>,
        x0: &Tensor<CpuRuntime>,
        p: &Tensor<CpuRuntime>,
        record_checkpoints: bool,
    ) -> DiffResult<TrajectoryResult<CpuRuntime>> {
        integrate_impl(self, system, x0, p, record_checkpoints)
    }

    fn forward_sensitivity(
        &self,
        system: &Arc<OdeSystem>,
        x0: &Tensor<CpuRuntime>,
        p: &Tensor<CpuRuntime>,
        dx0: Option<&Tensor<CpuRuntime>>,
        dp: Option<&Tensor<CpuRuntime>>,
    ) -> DiffResult<ForwardSensitivityResult<CpuRuntime>> {
        forward_sensitivity_impl(self, system, x0, p, dx0, dp)
    }

    fn adjoint_sensitivity(
        &self,
        system: &Arc<OdeSystem>,
        x0: &Tensor<CpuRuntime>,
        p: &Tensor<CpuRuntime>,
        lambda: &Tensor<CpuRuntime>,
    ) -> DiffResult<AdjointSensitivityResult<CpuRuntime>> {
        adjoint_sensitivity_impl(self, system, x0, p, lambda)
    }
}
