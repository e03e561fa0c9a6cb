//! # Kernel Circuit Optimizer
//!
//! Rewrites a kernel circuit into a semantically equivalent but faster one,
//! honoring probe and feedback boundaries:
//!
//! - Dead-kernel elimination: drop unobserved device/constant kernels
//! - Redundant-input removal: coalesce duplicated hyperkernel inputs
//! - Common-subexpression elimination: share structurally equal kernels
//! - Transform/transpose absorption: fold transposes into matrix multiplies
//! - Block-reduce fusion: promote convolve+reduce-sum to fused vector modes
//! - Vertical and horizontal hyperkernel merging
//! - Reshape elision (always last: it relabels consumer input types)
//!
//! [`TensorReduceCollapser`] (`reduce(reduce(x))` -> `reduce(x)`) is not
//! scheduled by the driver; embedders whose frontends emit stacked
//! reductions run it as a stand-alone pass.
//!
//! ```text
//! KernelCircuit (from frontend) -> [Optimizer] -> Optimized KernelCircuit -> Code Gen
//! ```
//!
//! Every pass ends by refreshing the out-of-band feedback pointers of
//! recurrent kernels through the circuit's rename map; a derived pass that
//! forgets this step corrupts feedback loops, so use [`OptimizerPass`] and
//! call [`KernelCircuit::fix_recurrences`] last, unconditionally.

mod common_subexpression;
mod dead_kernel;
mod hyperkernel_merger;
mod multi_output_merger;
mod project_frame_reduce;
mod redundant_inputs;
mod reshape_remover;
mod tensor_reduce;
mod transform_transpose;

pub use common_subexpression::CommonSubexpression;
pub use dead_kernel::DeadKernelRemover;
pub use hyperkernel_merger::HyperKernelMerger;
pub use multi_output_merger::HyperKernelMultiOutputMerger;
pub use project_frame_reduce::ProjectFrameTensorReduceSum;
pub use redundant_inputs::RedundantInputRemover;
pub use reshape_remover::ReshapeRemover;
pub use tensor_reduce::TensorReduceCollapser;
pub use transform_transpose::TransformTransposeOptimizer;

use tracing::{debug, info};

use crate::config::OptimizerConfig;
use crate::error::CircuitResult;
use crate::factory::{DeviceParams, Profiler};
use crate::ir::KernelCircuit;

/// Read-only collaborators handed to every pass
pub struct PassContext<'a> {
    pub config: &'a OptimizerConfig,
    pub device_params: &'a DeviceParams,
    pub profiler: Option<&'a dyn Profiler>,
}

/// One transformation over a kernel circuit.
///
/// `run` returns the number of improvements made; zero counts toward
/// fixed-point termination. Implementations must leave the circuit
/// consistent and call `fix_recurrences` before returning.
pub trait OptimizerPass {
    fn name(&self) -> &'static str;

    fn enabled(&self, config: &OptimizerConfig) -> bool;

    fn run(&self, circuit: &mut KernelCircuit, ctx: &PassContext<'_>) -> CircuitResult<usize>;
}

/// Drives the optimization pipeline over one circuit.
///
/// Pass order is fixed: the stand-alone passes run once each, then the
/// coupled passes loop to a fixed point, and reshape removal runs last
/// because it changes the declared input types of downstream consumers.
pub struct CircuitOptimizer<'a> {
    config: &'a OptimizerConfig,
    device_params: &'a DeviceParams,
    profiler: Option<&'a dyn Profiler>,
}

impl<'a> CircuitOptimizer<'a> {
    pub fn new(config: &'a OptimizerConfig, device_params: &'a DeviceParams) -> Self {
        CircuitOptimizer {
            config,
            device_params,
            profiler: None,
        }
    }

    /// Attach a profiler consulted by factories during rebuilds
    pub fn with_profiler(mut self, profiler: &'a dyn Profiler) -> Self {
        self.profiler = Some(profiler);
        self
    }

    /// Optimize the circuit in place; returns the total number of
    /// improvements across all passes.
    pub fn optimize(&self, circuit: &mut KernelCircuit) -> CircuitResult<usize> {
        if !self.config.enabled {
            if self.config.verbose_optimizer {
                info!("optimizer disabled");
            }
            return Ok(0);
        }
        let ctx = PassContext {
            config: self.config,
            device_params: self.device_params,
            profiler: self.profiler,
        };

        let mut total = 0;
        total += self.run_pass(&DeadKernelRemover, circuit, &ctx)?;
        total += self.run_pass(&RedundantInputRemover, circuit, &ctx)?;
        total += self.run_pass(&CommonSubexpression, circuit, &ctx)?;
        total += self.run_pass(&ProjectFrameTensorReduceSum, circuit, &ctx)?;
        total += self.loop_to_fixed_point(&[&TransformTransposeOptimizer], circuit, &ctx)?;
        total += self.loop_to_fixed_point(
            &[&HyperKernelMerger, &HyperKernelMultiOutputMerger],
            circuit,
            &ctx,
        )?;
        total += self.loop_to_fixed_point(&[&ReshapeRemover], circuit, &ctx)?;

        if self.config.verbose_optimizer {
            info!(improvements = total, "optimization complete");
        }
        if self.config.print_circuit {
            info!("final circuit:\n{circuit}");
        }
        Ok(total)
    }

    fn run_pass(
        &self,
        pass: &dyn OptimizerPass,
        circuit: &mut KernelCircuit,
        ctx: &PassContext<'_>,
    ) -> CircuitResult<usize> {
        if !pass.enabled(self.config) {
            if self.config.verbose_optimizer {
                info!(pass = pass.name(), "pass disabled");
            }
            return Ok(0);
        }
        let improvements = pass.run(circuit, ctx)?;
        debug_assert!(circuit.validate().is_ok(), "{} left the circuit inconsistent", pass.name());
        if self.config.verbose_optimizer {
            info!(pass = pass.name(), improvements, "pass finished");
        }
        Ok(improvements)
    }

    /// Round-robin the passes until every one of them reports zero
    /// improvements for one full cycle.
    fn loop_to_fixed_point(
        &self,
        passes: &[&dyn OptimizerPass],
        circuit: &mut KernelCircuit,
        ctx: &PassContext<'_>,
    ) -> CircuitResult<usize> {
        let mut total = 0;
        let mut cycle_index = 0;
        let mut consecutive_fails = 0;
        while consecutive_fails < passes.len() {
            let improvements = self.run_pass(passes[cycle_index], circuit, ctx)?;
            if improvements > 0 {
                consecutive_fails = 0;
            } else {
                consecutive_fails += 1;
            }
            total += improvements;
            cycle_index = (cycle_index + 1) % passes.len();
        }
        debug!(improvements = total, "fixed point reached");
        Ok(total)
    }
}
