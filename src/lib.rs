//! # FieldPipe Kernel-Circuit Optimizer
//!
//! A dataflow compute-graph framework core: rewrites an acyclic graph of
//! compute kernels (produced by a field-algebra frontend) into a
//! semantically equivalent but faster graph, honoring probing and feedback
//! boundaries.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Field Algebra Frontend
//!     ↓
//! KernelCircuit                  → typed IR: kernels + virtual registers
//!     ↓
//! [DeadKernel]                   → drop unobserved device kernels
//! [RedundantInputs]              → coalesce duplicated inputs
//! [CommonSubexpression]          → share structurally equal kernels
//! [ProjectFrameTensorReduceSum]  → fuse convolve + block reduce sum
//! [TransformTranspose]*          → absorb transposes into matrix multiply
//! [HyperKernelMerger,
//!  HyperKernelMultiOutputMerger]* → vertical / horizontal kernel fusion
//! [ReshapeRemover]*              → elide shape relabellings (always last)
//!     ↓
//! Optimized KernelCircuit        → Code Generation
//!
//! (* = looped to a fixed point)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldpipe::{CircuitOptimizer, Config, DeviceParams, KernelCircuit};
//!
//! let config = Config::load()?;
//! let device = DeviceParams::default();
//!
//! let mut circuit = KernelCircuit::new();
//! let input = circuit.constant(shape, &values)?;
//! let doubled = circuit.multiply_const(input, 2.0)?;
//! circuit.probe(doubled, Some("doubled"));
//!
//! let improvements = CircuitOptimizer::new(&config.optimizer, &device)
//!     .optimize(&mut circuit)?;
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `ir` | Field types, opcodes, registers, kernels, the circuit DAG |
//! | `factory` | Kernel factories, device parameters, fusion legality |
//! | `optimizer` | The nine passes and the fixed-point driver |
//! | `executor` | CPU reference interpreter used to pin down semantics |
//! | `config` | Hierarchical configuration (figment) |
//!
//! The optimizer is strictly single-threaded per circuit; independent
//! circuits may be optimized concurrently on separate threads.

pub mod config;
pub mod error;
pub mod executor;
pub mod factory;
pub mod ir;
pub mod optimizer;

// Re-export the surface embedders touch day to day
pub use config::{Config, LoggingConfig, OptimizerConfig};
pub use error::{CircuitError, CircuitResult};
pub use executor::ReferenceExecutor;
pub use factory::{ConvolveVariant, DeviceParams, Profiler, SmallTensorPolicy};
pub use ir::{
    AbstractKernel, ElementType, FieldType, KernelCircuit, KernelId, KernelKind, Opcode,
    ReduceOp, RegisterId, Shape, VectorMode, VirtualFieldRegister,
};
pub use optimizer::{CircuitOptimizer, OptimizerPass, PassContext};
