//! # Kernel Factories
//!
//! The boundary between the optimizer and device code generation. Passes
//! never assemble device kernels by hand; they call a factory, which
//! validates the inputs, consults the device parameters (and optionally a
//! profiler), and returns a fully typed kernel. Factories are total on
//! legal inputs and fail fast on illegal ones.
//!
//! The fusion legality predicates (`is_mergeable`,
//! `can_share_multi_output_kernel`) also live here: whether two opcodes can
//! share one device kernel is a property of the code generator, not of the
//! optimizer, and passes treat the answer as a black box.

use tracing::debug;

use crate::error::{CircuitError, CircuitResult};
use crate::ir::{
    BorderPolicy, ConvolveParams, FieldType, KernelCircuit, KernelId, KernelKind, Opcode,
    RegisterId, SamplingPolicy, Shape, TensorReduceParams, VectorMode,
};

// ============================================================================
// Device collaborators
// ============================================================================

/// Code-generation parameters of the target device.
///
/// Opaque to the optimizer: passes hand it to factories and predicates
/// without interpreting it.
#[derive(Debug, Clone)]
pub struct DeviceParams {
    /// Upper bound on the input count of a fused kernel
    pub max_merged_kernel_inputs: usize,
    /// Upper bound on the output count of a multi-output kernel
    pub max_kernel_outputs: usize,
    /// Local memory available to one work group, in bytes
    pub local_mem_bytes: usize,
    /// Maximum work-group size
    pub max_work_group_size: usize,
    /// Whether the tiled local-memory convolution variant may be emitted;
    /// mirrors the `tiled_convolve_enable` configuration flag
    pub tiled_convolve_enable: bool,
}

impl Default for DeviceParams {
    fn default() -> Self {
        DeviceParams {
            max_merged_kernel_inputs: 16,
            max_kernel_outputs: 8,
            local_mem_bytes: 48 * 1024,
            max_work_group_size: 256,
            tiled_convolve_enable: false,
        }
    }
}

/// Codegen variants of a convolution kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvolveVariant {
    /// Straightforward global-memory implementation
    Standard,
    /// Filter staged through local memory
    TiledLocalMemory,
}

/// Optional collaborator that chooses among pre-legal codegen variants.
///
/// The optimizer never reasons about cost itself; when more than one
/// variant is legal it defers the choice to the profiler, or takes the
/// first variant when none is supplied.
pub trait Profiler {
    /// Returns an index into `variants`
    fn pick(&self, variants: &[ConvolveVariant]) -> usize;
}

/// How small-tensor fields are laid out by generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmallTensorPolicy {
    #[default]
    UseSmallTensorWhenBest,
    AvoidSmallTensor,
}

// ============================================================================
// Convolution typing
// ============================================================================

fn convolve_field_shape(
    in0: &FieldType,
    in1: &FieldType,
    params: &ConvolveParams,
) -> CircuitResult<Shape> {
    let frame = in0.field_shape.extents();
    let filter = in1.field_shape.extents();
    if frame.len() != filter.len() {
        return Err(CircuitError::TypeMismatch {
            opcode: "Convolve".to_string(),
            reason: format!(
                "frame is {}-dimensional but filter is {}-dimensional",
                frame.len(),
                filter.len()
            ),
        });
    }
    let mut out = Vec::with_capacity(frame.len());
    for (&f, &h) in frame.iter().zip(filter) {
        let upsampled = match params.sampling {
            SamplingPolicy::UpsampleInputConvolution { factor } => f * factor,
            _ => f,
        };
        let bordered = match params.border {
            BorderPolicy::ValidBorder => {
                upsampled
                    .checked_sub(h - 1)
                    .ok_or_else(|| CircuitError::TypeMismatch {
                        opcode: "Convolve".to_string(),
                        reason: format!("filter extent {h} exceeds frame extent {upsampled}"),
                    })?
            }
            _ => upsampled,
        };
        let sampled = match params.sampling {
            SamplingPolicy::DownsampleOutputConvolution { factor } => bordered.div_ceil(factor),
            _ => bordered,
        };
        out.push(sampled);
    }
    Shape::new(out, Shape::MAX_FIELD_DIMENSIONS)
}

/// The number of tensor planes one batch item contributes, per vector mode.
///
/// This is also the reduction factor that the matching block-reduce-sum
/// fusion absorbs, which is how `ProjectFrameTensorReduceSum` recognizes a
/// fusable reduce.
pub fn block_reduce_factor(
    in0: &FieldType,
    in1: &FieldType,
    params: &ConvolveParams,
) -> CircuitResult<usize> {
    let (t0, t1, b) = (in0.tensor_points(), in1.tensor_points(), params.batch_size);
    if b == 0 {
        return Err(CircuitError::TypeMismatch {
            opcode: "Convolve".to_string(),
            reason: "batch size must be positive".to_string(),
        });
    }
    let factor = match params.vector_mode {
        VectorMode::ProjectFrame | VectorMode::ProjectFrameBlockReduceSum => {
            if t0 % b != 0 {
                return Err(CircuitError::TypeMismatch {
                    opcode: "Convolve".to_string(),
                    reason: format!("batch size {b} does not divide {t0} frame planes"),
                });
            }
            t0 / b
        }
        VectorMode::BackProjectFrame | VectorMode::BackProjectFrameBlockReduceSum => {
            if t1 % b != 0 {
                return Err(CircuitError::TypeMismatch {
                    opcode: "Convolve".to_string(),
                    reason: format!("batch size {b} does not divide {t1} filter planes"),
                });
            }
            t1 / b
        }
        VectorMode::FilterAdjoint | VectorMode::FilterAdjointBlockReduceSum => {
            if t0 % b != 0 {
                return Err(CircuitError::TypeMismatch {
                    opcode: "Convolve".to_string(),
                    reason: format!("batch size {b} does not divide {t0} frame planes"),
                });
            }
            b
        }
        VectorMode::PlaneByPlane => 1,
    };
    Ok(factor)
}

/// Output field type of a convolution, per vector mode.
///
/// The tensor-plane arithmetic pairs frame and filter planes as follows,
/// writing `t0`, `t1` for the input tensor-point counts and `b` for the
/// batch size:
///
/// - `ProjectFrame`: every batch item's `t0/b` frame planes against every
///   filter plane; output planes `[t1, t0/b]`. The fused variant sums each
///   filter's block of `t0/b` planes, leaving `[t1]`.
/// - `BackProjectFrame`: the mirror pairing; output `[t0, t1/b]`, fused
///   `[t0]`.
/// - `FilterAdjoint`: one gradient plane per frame-filter pair and batch
///   item, `[(t0/b)*t1, b]`; the fused variant sums across the batch,
///   leaving `[(t0/b)*t1]`.
/// - `PlaneByPlane`: planes convolve pairwise; output keeps `in0`'s tensor
///   shape.
pub fn convolve_output_field_type(
    in0: &FieldType,
    in1: &FieldType,
    params: &ConvolveParams,
) -> CircuitResult<FieldType> {
    if in0.element_type != in1.element_type {
        return Err(CircuitError::TypeMismatch {
            opcode: "Convolve".to_string(),
            reason: format!(
                "element types differ: {:?} vs {:?}",
                in0.element_type, in1.element_type
            ),
        });
    }
    let field_shape = convolve_field_shape(in0, in1, params)?;
    let (t0, t1, b) = (in0.tensor_points(), in1.tensor_points(), params.batch_size);
    let factor = block_reduce_factor(in0, in1, params)?;
    let tensor_shape = match params.vector_mode {
        VectorMode::ProjectFrame => Shape::new(vec![t1, factor], Shape::MAX_TENSOR_DIMENSIONS)?,
        VectorMode::ProjectFrameBlockReduceSum => {
            Shape::new(vec![t1], Shape::MAX_TENSOR_DIMENSIONS)?
        }
        VectorMode::BackProjectFrame => Shape::new(vec![t0, factor], Shape::MAX_TENSOR_DIMENSIONS)?,
        VectorMode::BackProjectFrameBlockReduceSum => {
            Shape::new(vec![t0], Shape::MAX_TENSOR_DIMENSIONS)?
        }
        VectorMode::FilterAdjoint => {
            Shape::new(vec![(t0 / b) * t1, factor], Shape::MAX_TENSOR_DIMENSIONS)?
        }
        VectorMode::FilterAdjointBlockReduceSum => {
            Shape::new(vec![(t0 / b) * t1], Shape::MAX_TENSOR_DIMENSIONS)?
        }
        VectorMode::PlaneByPlane => {
            if t0 != t1 {
                return Err(CircuitError::TypeMismatch {
                    opcode: "Convolve".to_string(),
                    reason: format!("plane-by-plane needs equal plane counts, got {t0} and {t1}"),
                });
            }
            in0.tensor_shape.clone()
        }
    };
    Ok(FieldType::new(field_shape, tensor_shape, in0.element_type))
}

// ============================================================================
// Factories
// ============================================================================

/// Build a convolution hyperkernel.
///
/// Validates the declared output type against the mode arithmetic, collects
/// the legal codegen variants for the device, and lets the profiler choose
/// among them when one is supplied.
pub fn convolve_hyperkernel(
    circuit: &mut KernelCircuit,
    inputs: [RegisterId; 2],
    params: ConvolveParams,
    output_type: FieldType,
    _smalltensor_policy: SmallTensorPolicy,
    device_params: &DeviceParams,
    profiler: Option<&dyn Profiler>,
) -> CircuitResult<KernelId> {
    let in0 = circuit.register(inputs[0]).field_type().clone();
    let in1 = circuit.register(inputs[1]).field_type().clone();
    let inferred = convolve_output_field_type(&in0, &in1, &params)?;
    if inferred != output_type {
        return Err(CircuitError::OutputTypeMismatch {
            kernel: "Convolve".to_string(),
            declared: output_type,
            inferred,
        });
    }

    let mut variants = vec![ConvolveVariant::Standard];
    if device_params.tiled_convolve_enable && in1.field_points() * 4 <= device_params.local_mem_bytes
    {
        variants.push(ConvolveVariant::TiledLocalMemory);
    }
    let choice = profiler.map_or(0, |p| p.pick(&variants).min(variants.len() - 1));
    debug!(
        variant = ?variants[choice],
        mode = ?params.vector_mode,
        "convolve variant selected"
    );

    circuit.add_kernel(
        KernelKind::Device,
        Opcode::Convolve(params),
        &[inputs[0], inputs[1]],
        vec![output_type],
    )
}

/// Device predicate: can the fused filter-adjoint variant be generated?
///
/// The fused kernel stages one filter gradient per work group, so the
/// filter plane must fit in local memory and the batch must not exceed the
/// work-group size.
pub fn can_use_filter_adjoint_block_reduce_sum(
    _in0: &FieldType,
    in1: &FieldType,
    params: &ConvolveParams,
    device_params: &DeviceParams,
) -> bool {
    in1.field_points() * 4 <= device_params.local_mem_bytes
        && params.batch_size <= device_params.max_work_group_size
}

/// Build a tensor-reduction hyperkernel
pub fn tensor_reduce_hyperkernel(
    circuit: &mut KernelCircuit,
    input: RegisterId,
    params: TensorReduceParams,
    output_type: FieldType,
) -> CircuitResult<KernelId> {
    let opcode = Opcode::TensorReduce(params);
    let inferred = opcode.output_type(&[circuit.register(input).field_type().clone()])?;
    if inferred != output_type {
        return Err(CircuitError::OutputTypeMismatch {
            kernel: opcode.name(),
            declared: output_type,
            inferred,
        });
    }
    circuit.add_kernel(KernelKind::Device, opcode, &[input], vec![output_type])
}

/// Build a tensor-slice hyperkernel selecting `index` along the last
/// tensor dimension
pub fn slice_vectors_hyperkernel(
    circuit: &mut KernelCircuit,
    input: RegisterId,
    index: usize,
    output_type: FieldType,
) -> CircuitResult<KernelId> {
    let opcode = Opcode::TensorSlice { index };
    let inferred = opcode.output_type(&[circuit.register(input).field_type().clone()])?;
    if inferred != output_type {
        return Err(CircuitError::OutputTypeMismatch {
            kernel: opcode.name(),
            declared: output_type,
            inferred,
        });
    }
    circuit.add_kernel(KernelKind::Device, opcode, &[input], vec![output_type])
}

/// Build a matrix-multiply hyperkernel with operand transpose flags
pub fn matrix_matrix_transform_hyperkernel(
    circuit: &mut KernelCircuit,
    inputs: [RegisterId; 2],
    transpose_in1: bool,
    transpose_in2: bool,
    output_type: FieldType,
) -> CircuitResult<KernelId> {
    let opcode = Opcode::MatrixTransform {
        transpose_in1,
        transpose_in2,
    };
    let inferred = opcode.output_type(&[
        circuit.register(inputs[0]).field_type().clone(),
        circuit.register(inputs[1]).field_type().clone(),
    ])?;
    if inferred != output_type {
        return Err(CircuitError::OutputTypeMismatch {
            kernel: opcode.name(),
            declared: output_type,
            inferred,
        });
    }
    circuit.add_kernel(
        KernelKind::Device,
        opcode,
        &[inputs[0], inputs[1]],
        vec![output_type],
    )
}

// ============================================================================
// Fusion legality
// ============================================================================

/// Opcodes the code generator can fold into a single device kernel: the
/// pointwise family, recursively through earlier fusions and remaps.
fn fusable(op: &Opcode) -> bool {
    match op {
        Opcode::Add
        | Opcode::Multiply
        | Opcode::AddConst { .. }
        | Opcode::MultiplyConst { .. } => true,
        Opcode::Remapped { inner, .. } => fusable(inner),
        Opcode::Merged { sink, source, .. } => fusable(sink) && fusable(source),
        Opcode::MergedMultiOutput { a, b } => fusable(a) && fusable(b),
        _ => false,
    }
}

/// Can `source` be folded into its sole consumer `sink`?
pub fn is_mergeable(sink: &Opcode, source: &Opcode, _device_params: &DeviceParams) -> bool {
    fusable(sink) && fusable(source)
}

/// Can two sibling kernels reading the same inputs share one device kernel?
pub fn can_share_multi_output_kernel(
    a: &Opcode,
    b: &Opcode,
    combined_outputs: usize,
    device_params: &DeviceParams,
) -> bool {
    fusable(a) && fusable(b) && combined_outputs <= device_params.max_kernel_outputs
}
