//! Convolve + tensor-reduce-sum fusion.
//!
//! A convolution in a frame-projection vector mode followed by a full block
//! summation of its planes is one fused device kernel: the convolution
//! accumulates the block in registers instead of materializing every plane.
//! The convolve kernel is rebuilt with the promoted vector mode and the
//! reduce drops out. When the promoted output keeps a trailing tensor
//! dimension of 1 that the reduce's type never had, a single
//! `SliceVectors(0)` drops it so the replacement's output type matches the
//! reduce's exactly.

use tracing::debug;

use super::{OptimizerPass, PassContext};
use crate::config::OptimizerConfig;
use crate::error::CircuitResult;
use crate::factory::{
    block_reduce_factor, can_use_filter_adjoint_block_reduce_sum, convolve_hyperkernel,
    convolve_output_field_type, slice_vectors_hyperkernel, SmallTensorPolicy,
};
use crate::ir::{
    FilterOrientation, KernelCircuit, KernelId, Opcode, ReduceOp, SamplingPolicy, VectorMode,
};

pub struct ProjectFrameTensorReduceSum;

impl ProjectFrameTensorReduceSum {
    fn mode_enabled(mode: VectorMode, config: &OptimizerConfig) -> bool {
        match mode {
            VectorMode::ProjectFrame => config.project_frame_merging,
            VectorMode::BackProjectFrame => config.back_project_frame_merging,
            VectorMode::FilterAdjoint => config.filter_adjoint_merging,
            _ => false,
        }
    }

    /// `reduce` is a tensor-reduce kernel; fuse it into its producing
    /// convolve kernel if every guard holds.
    fn fuse(
        circuit: &mut KernelCircuit,
        reduce: KernelId,
        ctx: &PassContext<'_>,
    ) -> CircuitResult<bool> {
        let reduce_params = match circuit.kernel(reduce).opcode() {
            Opcode::TensorReduce(p) if p.op == ReduceOp::Sum => p.clone(),
            _ => return Ok(false),
        };
        let middle = circuit.kernel(reduce).inputs()[0];
        let reg = circuit.register(middle);
        if reg.probed() || reg.sinks().len() != 1 || reg.sinks()[0] != (reduce, 0) {
            return Ok(false);
        }
        let convolve = reg.source();
        let params = match circuit.kernel(convolve).opcode() {
            Opcode::Convolve(p) => p.clone(),
            _ => return Ok(false),
        };
        let fused_mode = match params.vector_mode.block_reduce_sum() {
            Some(m) => m,
            None => return Ok(false),
        };
        if !Self::mode_enabled(params.vector_mode, ctx.config) {
            return Ok(false);
        }

        let in0 = circuit.kernel(convolve).inputs()[0];
        let in1 = circuit.kernel(convolve).inputs()[1];
        let in0_ty = circuit.register(in0).field_type().clone();
        let in1_ty = circuit.register(in1).field_type().clone();

        // The reduce must consume exactly the convolution's block structure
        let block = block_reduce_factor(&in0_ty, &in1_ty, &params)?;
        if reduce_params.factor != block {
            return Ok(false);
        }

        if params.vector_mode == VectorMode::FilterAdjoint {
            let upsampled = matches!(
                params.sampling,
                SamplingPolicy::UpsampleInputConvolution { .. }
            );
            let cross = params.orientation == FilterOrientation::CrossCorrelationOrientation;
            if !upsampled
                || !cross
                || params.batch_size <= 1
                || !can_use_filter_adjoint_block_reduce_sum(
                    &in0_ty,
                    &in1_ty,
                    &params,
                    ctx.device_params,
                )
            {
                return Ok(false);
            }
        }

        let mut fused_params = params.clone();
        fused_params.vector_mode = fused_mode;
        let fused_ty = convolve_output_field_type(&in0_ty, &in1_ty, &fused_params)?;
        let reduce_ty = circuit
            .register(circuit.output_of(reduce, 0))
            .field_type()
            .clone();

        if fused_ty == reduce_ty {
            let replacement = convolve_hyperkernel(
                circuit,
                [in0, in1],
                fused_params,
                fused_ty,
                SmallTensorPolicy::default(),
                ctx.device_params,
                ctx.profiler,
            )?;
            circuit.steal_outputs_from(replacement, reduce);
        } else if fused_ty.tensor_shape.last_extent() == Some(1)
            && fused_ty.with_tensor_shape(fused_ty.tensor_shape.drop_last()) == reduce_ty
        {
            // Promoted output carries a trailing singleton plane the reduce
            // never produced; slice it away to keep the type contract.
            let replacement = convolve_hyperkernel(
                circuit,
                [in0, in1],
                fused_params,
                fused_ty,
                SmallTensorPolicy::default(),
                ctx.device_params,
                ctx.profiler,
            )?;
            let fused_out = circuit.output_of(replacement, 0);
            let slice = slice_vectors_hyperkernel(circuit, fused_out, 0, reduce_ty)?;
            circuit.steal_outputs_from(slice, reduce);
        } else {
            return Ok(false);
        }
        circuit.remove_from_circuit(convolve, false, false)?;
        debug!(mode = ?fused_mode, "fused convolve with block reduce sum");
        Ok(true)
    }
}

impl OptimizerPass for ProjectFrameTensorReduceSum {
    fn name(&self) -> &'static str {
        "ProjectFrameTensorReduceSum"
    }

    fn enabled(&self, config: &OptimizerConfig) -> bool {
        config.enable_project_frame_reduce
    }

    fn run(&self, circuit: &mut KernelCircuit, ctx: &PassContext<'_>) -> CircuitResult<usize> {
        let mut fused = 0;
        for k in circuit.flatten_preorder() {
            if circuit.kernel(k).is_dead() {
                continue;
            }
            if Self::fuse(circuit, k, ctx)? {
                fused += 1;
            }
        }
        circuit.fix_recurrences();
        Ok(fused)
    }
}
