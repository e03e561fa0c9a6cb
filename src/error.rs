//! Circuit and Optimizer Error Types

use thiserror::Error;

use crate::ir::FieldType;

/// Errors raised at the circuit and kernel-factory boundary.
///
/// Internal invariant violations (a factory returning the wrong output type,
/// a rename-map chase resolving to a dead register) are not represented here;
/// those abort via panic with the offending kernel's debug name, since the
/// circuit cannot be left in a half-rewritten state.
#[derive(Error, Debug)]
pub enum CircuitError {
    /// A shape was constructed with a zero extent or too many dimensions
    #[error("Invalid shape {0:?}: extents must be positive, at most {1} dimensions")]
    InvalidShape(Vec<usize>, usize),

    /// A kernel was given the wrong number of inputs for its opcode
    #[error("Opcode '{opcode}' expects {expected} inputs, got {found}")]
    ArityMismatch {
        opcode: String,
        expected: usize,
        found: usize,
    },

    /// Input field types do not satisfy the opcode's typing rule
    #[error("Opcode '{opcode}' rejects input types: {reason}")]
    TypeMismatch { opcode: String, reason: String },

    /// A factory was asked to build a kernel whose declared output type
    /// disagrees with the type inferred from its inputs
    #[error("Kernel '{kernel}' declares output type {declared} but inference gives {inferred}")]
    OutputTypeMismatch {
        kernel: String,
        declared: FieldType,
        inferred: FieldType,
    },

    /// A reduction factor does not divide the tensor-point count
    #[error("Reduce factor {factor} does not divide {points} tensor points")]
    IllegalReduceFactor { factor: usize, points: usize },

    /// A kernel operation was attempted on a dead kernel
    #[error("Kernel '{0}' is dead")]
    DeadKernel(String),

    /// A hyperkernel-only primitive was applied to a non-hyperkernel
    #[error("Kernel '{0}' is not a hyperkernel")]
    NotHyperKernel(String),

    /// A feedback register was attached to a kernel that is not recurrent
    #[error("Kernel '{0}' is not a recurrent kernel")]
    NotRecurrent(String),

    /// remove_from_circuit called without must_do on a kernel that still
    /// has consumers or probed outputs
    #[error("Kernel '{0}' still has live sinks or probed outputs")]
    RemoveWithLiveSinks(String),

    /// Adding a kernel would make it transitively its own input
    #[error("Kernel '{0}' would create a cycle")]
    Cycle(String),

    /// A recurrent kernel was executed before its feedback register was set
    #[error("Recurrent kernel '{0}' has no recurrence register")]
    RecurrenceUnset(String),

    /// The reference executor does not implement this opcode
    #[error("Reference executor does not support opcode '{0}'")]
    UnsupportedOpcode(String),

    /// The reference executor only evaluates Float32 fields
    #[error("Reference executor does not support element type {0:?}")]
    UnsupportedElementType(String),

    /// Configuration loading error
    #[error("Config error: {0}")]
    Config(#[from] figment::Error),
}

/// Result type for circuit operations
pub type CircuitResult<T> = Result<T, CircuitError>;
