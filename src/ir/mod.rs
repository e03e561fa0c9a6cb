//! # Kernel Circuit IR
//!
//! Typed intermediate representation for the compute-graph optimizer.
//! A circuit is an acyclic graph of kernels; every kernel consumes virtual
//! field registers owned by other kernels and owns the registers it produces.
//!
//! ```text
//! Field Algebra Frontend -> KernelCircuit -> [Optimizer] -> KernelCircuit -> Code Gen
//! ```
//!
//! This module defines the value types of the IR: shapes, field types and
//! the closed opcode hierarchy. The graph container itself lives in
//! [`circuit`], ergonomic construction helpers in [`builder`].

pub mod builder;
pub mod circuit;

pub use circuit::{
    AbstractKernel, KernelCircuit, KernelId, KernelKind, RegisterId, VirtualFieldRegister,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{CircuitError, CircuitResult};

// ============================================================================
// Shapes and Field Types
// ============================================================================

/// Element type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    /// 32-bit IEEE float
    Float32,
    /// Complex number with 32-bit components
    Complex32,
    /// 8-bit pixel channel
    Uint8Pixel,
}

/// A discrete shape: an ordered sequence of positive extents.
///
/// Field shapes carry 0-3 dimensions, tensor shapes 0-2. A 0-dimensional
/// shape describes a single point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Maximum dimensionality for field shapes
    pub const MAX_FIELD_DIMENSIONS: usize = 3;
    /// Maximum dimensionality for tensor shapes
    pub const MAX_TENSOR_DIMENSIONS: usize = 2;

    /// Create a shape, checking that every extent is positive
    pub fn new(extents: Vec<usize>, max_dimensions: usize) -> CircuitResult<Self> {
        if extents.len() > max_dimensions || extents.iter().any(|&e| e == 0) {
            return Err(CircuitError::InvalidShape(extents, max_dimensions));
        }
        Ok(Shape(extents))
    }

    /// The 0-dimensional shape
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    /// Number of dimensions
    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    /// Total number of points (product of extents; 1 for a scalar shape)
    pub fn points(&self) -> usize {
        self.0.iter().product()
    }

    /// Extents as a slice
    pub fn extents(&self) -> &[usize] {
        &self.0
    }

    /// Last extent, if any
    pub fn last_extent(&self) -> Option<usize> {
        self.0.last().copied()
    }

    /// This shape with the last dimension removed.
    ///
    /// Used when a trailing tensor dimension is sliced away.
    pub fn drop_last(&self) -> Shape {
        let mut extents = self.0.clone();
        extents.pop();
        Shape(extents)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " x ")?;
            }
            write!(f, "{e}")?;
        }
        write!(f, "]")
    }
}

/// The type of a field: a field shape of tensors, all of the same tensor
/// shape and element type.
///
/// Equality is structural; field types are immutable values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldType {
    /// Shape of the field lattice (0-3 dimensions)
    pub field_shape: Shape,
    /// Shape of the tensor at every field point (0-2 dimensions)
    pub tensor_shape: Shape,
    /// Element type of each tensor component
    pub element_type: ElementType,
}

impl FieldType {
    pub fn new(field_shape: Shape, tensor_shape: Shape, element_type: ElementType) -> Self {
        FieldType {
            field_shape,
            tensor_shape,
            element_type,
        }
    }

    /// Number of field dimensions
    pub fn dimensions(&self) -> usize {
        self.field_shape.dimensions()
    }

    /// Order of the tensor at each field point (0 = scalar field)
    pub fn tensor_order(&self) -> usize {
        self.tensor_shape.dimensions()
    }

    /// Number of components in each tensor
    pub fn tensor_points(&self) -> usize {
        self.tensor_shape.points()
    }

    /// Number of field points
    pub fn field_points(&self) -> usize {
        self.field_shape.points()
    }

    /// Total number of scalar components in the field
    pub fn points(&self) -> usize {
        self.field_points() * self.tensor_points()
    }

    /// Same field and element type, different tensor shape
    pub fn with_tensor_shape(&self, tensor_shape: Shape) -> FieldType {
        FieldType {
            field_shape: self.field_shape.clone(),
            tensor_shape,
            element_type: self.element_type,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{:?}",
            self.field_shape, self.tensor_shape, self.element_type
        )
    }
}

// ============================================================================
// Opcode Parameters
// ============================================================================

/// A scalar constant parameter of an opcode.
///
/// Wraps an `f32` with bit-pattern equality and hashing so that opcodes
/// carrying constants can be used as hash keys during common-subexpression
/// elimination. Two constants are equal iff their bit patterns are equal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstParam(pub f32);

impl PartialEq for ConstParam {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for ConstParam {}

impl Hash for ConstParam {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl From<f32> for ConstParam {
    fn from(v: f32) -> Self {
        ConstParam(v)
    }
}

/// Border handling policy for convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BorderPolicy {
    /// Output shrinks: only fully-covered positions are produced
    ValidBorder,
    /// Output keeps the input field shape, borders clamped
    BorderClamp,
    /// Output keeps the input field shape, borders wrap
    BorderCyclic,
    /// Output keeps the input field shape, borders read as zero
    BorderZero,
}

/// Filter orientation for convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOrientation {
    /// Filter is flipped (true convolution)
    ConvolutionOrientation,
    /// Filter is applied as-is
    CrossCorrelationOrientation,
}

/// Up/down sampling fused into a convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SamplingPolicy {
    NoSamplingConvolution,
    /// Input is upsampled by `factor` before the filter is applied
    UpsampleInputConvolution { factor: usize },
    /// Output is decimated by `factor`
    DownsampleOutputConvolution { factor: usize },
}

impl SamplingPolicy {
    /// Apply the sampling step to a field extent
    pub fn apply(&self, extent: usize) -> usize {
        match self {
            SamplingPolicy::NoSamplingConvolution => extent,
            SamplingPolicy::UpsampleInputConvolution { factor } => extent * factor,
            SamplingPolicy::DownsampleOutputConvolution { factor } => extent.div_ceil(*factor),
        }
    }
}

/// Tensor-reduction semantics of a convolution over a stack of planes.
///
/// The three base modes differ in how the frame and filter tensor planes are
/// paired; each has a fused `...BlockReduceSum` variant that folds the
/// following block-summation into the convolution itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VectorMode {
    /// Each frame plane of a batch item is paired with every filter plane
    ProjectFrame,
    ProjectFrameBlockReduceSum,
    /// Each filter plane of a batch item is paired with every frame plane
    BackProjectFrame,
    BackProjectFrameBlockReduceSum,
    /// Gradient-of-filter pairing used by learning rules
    FilterAdjoint,
    FilterAdjointBlockReduceSum,
    /// Planes are convolved pairwise with no cross terms
    PlaneByPlane,
}

impl VectorMode {
    /// The fused block-reduce-sum variant of a base mode, if one exists
    pub fn block_reduce_sum(self) -> Option<VectorMode> {
        match self {
            VectorMode::ProjectFrame => Some(VectorMode::ProjectFrameBlockReduceSum),
            VectorMode::BackProjectFrame => Some(VectorMode::BackProjectFrameBlockReduceSum),
            VectorMode::FilterAdjoint => Some(VectorMode::FilterAdjointBlockReduceSum),
            _ => None,
        }
    }
}

/// Associative operator of a tensor reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

/// Parameters of a convolution opcode
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvolveParams {
    pub border: BorderPolicy,
    pub orientation: FilterOrientation,
    pub sampling: SamplingPolicy,
    pub vector_mode: VectorMode,
    pub batch_size: usize,
}

/// Parameters of a tensor-reduction opcode
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorReduceParams {
    pub op: ReduceOp,
    /// Number of consecutive tensor planes folded into each output plane
    pub factor: usize,
}

/// When a consumer is fused into a producer, the consumer's operand
/// positions must be rewired to the fused kernel's input list.
///
/// `Carried(i)` reads the fused kernel's input `i`; `Fused(o)` reads the
/// absorbed producer's output `o`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergedOperand {
    Carried(usize),
    Fused(usize),
}

// ============================================================================
// Opcode
// ============================================================================

/// The closed set of operations a kernel may perform.
///
/// Each variant owns its parameters by value; two opcodes are equal iff they
/// are the same variant with structurally equal parameters, and the hash
/// reflects that equality. Sequence parameters are held in `Vec`s so they
/// compare by contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// A constant field; the values are part of the opcode so that two
    /// distinct constants never compare equal
    ConstantField { values: Vec<ConstParam> },
    /// Produces the feedback value of a recurrent kernel
    Recurrence,
    /// Elementwise addition of two fields
    Add,
    /// Elementwise multiplication of two fields
    Multiply,
    /// Elementwise addition of a constant
    AddConst { offset: ConstParam },
    /// Elementwise multiplication by a constant
    MultiplyConst { factor: ConstParam },
    /// Reverses the field points of every tensor plane
    Flip,
    /// Relabels the shape of a field; element order is unchanged
    Reshape {
        field_shape: Shape,
        tensor_shape: Shape,
    },
    /// Convolution of a frame field with a filter field
    Convolve(ConvolveParams),
    /// Block reduction over consecutive tensor planes
    TensorReduce(TensorReduceParams),
    /// Transpose of a 2D field
    MatrixTranspose,
    /// Matrix multiply of two 2D fields, with optional operand transposes
    MatrixTransform {
        transpose_in1: bool,
        transpose_in2: bool,
    },
    /// Selects index `index` along the last tensor dimension
    TensorSlice { index: usize },
    /// Opaque user kernel running on the host; may have side effects
    UserCpu { name: String },
    /// A vertically fused kernel: `source` feeds `sink` through `wiring`
    Merged {
        sink: Box<Opcode>,
        source: Box<Opcode>,
        /// One entry per original sink operand
        wiring: Vec<MergedOperand>,
    },
    /// A horizontally fused kernel: both components read the same inputs
    MergedMultiOutput { a: Box<Opcode>, b: Box<Opcode> },
    /// Wraps an opcode whose operand positions were compacted after
    /// duplicated-input removal; operand `j` reads kernel input `map[j]`
    Remapped { inner: Box<Opcode>, map: Vec<usize> },
}

impl Opcode {
    /// Stable display name, used for debug output and derived kernel naming
    pub fn name(&self) -> String {
        match self {
            Opcode::ConstantField { .. } => "ConstantField".to_string(),
            Opcode::Recurrence => "Recurrence".to_string(),
            Opcode::Add => "Add".to_string(),
            Opcode::Multiply => "Multiply".to_string(),
            Opcode::AddConst { .. } => "AddConst".to_string(),
            Opcode::MultiplyConst { .. } => "MultiplyConst".to_string(),
            Opcode::Flip => "Flip".to_string(),
            Opcode::Reshape { .. } => "Reshape".to_string(),
            Opcode::Convolve(p) => format!("Convolve({:?})", p.vector_mode),
            Opcode::TensorReduce(p) => format!("TensorReduce{:?}", p.op),
            Opcode::MatrixTranspose => "MatrixTranspose".to_string(),
            Opcode::MatrixTransform { .. } => "MatrixTransform".to_string(),
            Opcode::TensorSlice { .. } => "TensorSlice".to_string(),
            Opcode::UserCpu { name } => format!("UserCpu({name})"),
            Opcode::Merged { sink, source, .. } => {
                format!("Merged({} + {})", sink.name(), source.name())
            }
            Opcode::MergedMultiOutput { a, b } => {
                format!("MergedMultiOutput({} | {})", a.name(), b.name())
            }
            Opcode::Remapped { inner, .. } => format!("Remapped({})", inner.name()),
        }
    }

    /// Number of input registers the opcode expects, if fixed.
    ///
    /// Merged and remapped opcodes have an input count determined by the
    /// rewrite that produced them, so they return `None`.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Opcode::ConstantField { .. } | Opcode::Recurrence => Some(0),
            Opcode::AddConst { .. }
            | Opcode::MultiplyConst { .. }
            | Opcode::Flip
            | Opcode::Reshape { .. }
            | Opcode::TensorReduce(_)
            | Opcode::MatrixTranspose
            | Opcode::TensorSlice { .. } => Some(1),
            Opcode::Add
            | Opcode::Multiply
            | Opcode::Convolve(_)
            | Opcode::MatrixTransform { .. } => Some(2),
            Opcode::UserCpu { .. }
            | Opcode::Merged { .. }
            | Opcode::MergedMultiOutput { .. }
            | Opcode::Remapped { .. } => None,
        }
    }

    /// Infer the output field type from input field types.
    ///
    /// Total for every opcode the frontend can produce. Merged opcodes do
    /// not occur in frontend circuits; their output types are fixed by the
    /// rewrite that creates them.
    pub fn output_type(&self, inputs: &[FieldType]) -> CircuitResult<FieldType> {
        let arity_check = |expected: usize| -> CircuitResult<()> {
            if inputs.len() == expected {
                Ok(())
            } else {
                Err(CircuitError::ArityMismatch {
                    opcode: self.name(),
                    expected,
                    found: inputs.len(),
                })
            }
        };
        match self {
            Opcode::ConstantField { .. } | Opcode::Recurrence => Err(CircuitError::TypeMismatch {
                opcode: self.name(),
                reason: "output type is declared, not inferred".to_string(),
            }),
            Opcode::Add | Opcode::Multiply => {
                arity_check(2)?;
                if inputs[0] != inputs[1] {
                    return Err(CircuitError::TypeMismatch {
                        opcode: self.name(),
                        reason: format!("operand types differ: {} vs {}", inputs[0], inputs[1]),
                    });
                }
                Ok(inputs[0].clone())
            }
            Opcode::AddConst { .. } | Opcode::MultiplyConst { .. } | Opcode::Flip => {
                arity_check(1)?;
                Ok(inputs[0].clone())
            }
            Opcode::Reshape {
                field_shape,
                tensor_shape,
            } => {
                arity_check(1)?;
                let declared = FieldType::new(
                    field_shape.clone(),
                    tensor_shape.clone(),
                    inputs[0].element_type,
                );
                if declared.points() != inputs[0].points() {
                    return Err(CircuitError::TypeMismatch {
                        opcode: self.name(),
                        reason: format!(
                            "reshape changes point count: {} -> {}",
                            inputs[0].points(),
                            declared.points()
                        ),
                    });
                }
                Ok(declared)
            }
            Opcode::Convolve(params) => {
                arity_check(2)?;
                crate::factory::convolve_output_field_type(&inputs[0], &inputs[1], params)
            }
            Opcode::TensorReduce(params) => {
                arity_check(1)?;
                let points = inputs[0].tensor_points();
                if params.factor == 0 || points % params.factor != 0 {
                    return Err(CircuitError::IllegalReduceFactor {
                        factor: params.factor,
                        points,
                    });
                }
                let reduced = points / params.factor;
                let tensor_shape = if reduced == 1 {
                    Shape::scalar()
                } else {
                    Shape::new(vec![reduced], Shape::MAX_TENSOR_DIMENSIONS)?
                };
                Ok(inputs[0].with_tensor_shape(tensor_shape))
            }
            Opcode::MatrixTranspose => {
                arity_check(1)?;
                let e = inputs[0].field_shape.extents();
                if e.len() != 2 {
                    return Err(CircuitError::TypeMismatch {
                        opcode: self.name(),
                        reason: format!("expected 2D field, got {}", inputs[0].field_shape),
                    });
                }
                Ok(FieldType::new(
                    Shape::new(vec![e[1], e[0]], Shape::MAX_FIELD_DIMENSIONS)?,
                    inputs[0].tensor_shape.clone(),
                    inputs[0].element_type,
                ))
            }
            Opcode::MatrixTransform {
                transpose_in1,
                transpose_in2,
            } => {
                arity_check(2)?;
                let (e0, e1) = (
                    inputs[0].field_shape.extents(),
                    inputs[1].field_shape.extents(),
                );
                if e0.len() != 2 || e1.len() != 2 {
                    return Err(CircuitError::TypeMismatch {
                        opcode: self.name(),
                        reason: "matrix transform needs 2D fields".to_string(),
                    });
                }
                let (m, k1) = if *transpose_in1 {
                    (e0[1], e0[0])
                } else {
                    (e0[0], e0[1])
                };
                let (k2, n) = if *transpose_in2 {
                    (e1[1], e1[0])
                } else {
                    (e1[0], e1[1])
                };
                if k1 != k2 {
                    return Err(CircuitError::TypeMismatch {
                        opcode: self.name(),
                        reason: format!("inner dimensions differ: {k1} vs {k2}"),
                    });
                }
                Ok(FieldType::new(
                    Shape::new(vec![m, n], Shape::MAX_FIELD_DIMENSIONS)?,
                    inputs[0].tensor_shape.clone(),
                    inputs[0].element_type,
                ))
            }
            Opcode::TensorSlice { index } => {
                arity_check(1)?;
                let last = inputs[0].tensor_shape.last_extent().unwrap_or(1);
                if *index >= last {
                    return Err(CircuitError::TypeMismatch {
                        opcode: self.name(),
                        reason: format!("slice index {index} out of range {last}"),
                    });
                }
                Ok(inputs[0].with_tensor_shape(inputs[0].tensor_shape.drop_last()))
            }
            Opcode::UserCpu { .. }
            | Opcode::Merged { .. }
            | Opcode::MergedMultiOutput { .. }
            | Opcode::Remapped { .. } => Err(CircuitError::TypeMismatch {
                opcode: self.name(),
                reason: "output type is fixed by the rewrite, not inferred".to_string(),
            }),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
