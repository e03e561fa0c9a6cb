//! Transpose absorption into matrix-multiply kernels.
//!
//! A matrix multiply can transpose either operand for free, so an adjacent
//! transpose kernel is folded into the multiply by flipping its operand
//! flags:
//!
//! - Transpose downstream of the multiply: `(A op B)^T == B^T op A^T`, so
//!   the operands swap and both flags invert. Requires the multiply's
//!   output to be unprobed with the transpose as its only consumer.
//! - Transpose on operand 0 or 1: the flag for that operand inverts and the
//!   transpose's own input plugs in directly. Requires only that the
//!   transpose's output is unprobed; other consumers of the transpose keep
//!   it alive and still benefit from the shared rewrite.

use tracing::debug;

use super::{OptimizerPass, PassContext};
use crate::config::OptimizerConfig;
use crate::error::CircuitResult;
use crate::factory::matrix_matrix_transform_hyperkernel;
use crate::ir::{KernelCircuit, KernelId, Opcode};

pub struct TransformTransposeOptimizer;

impl TransformTransposeOptimizer {
    /// Transpose kernel `t` whose input is a multiply consumed only by `t`
    fn absorb_downstream(circuit: &mut KernelCircuit, t: KernelId) -> CircuitResult<bool> {
        let input = circuit.kernel(t).inputs()[0];
        let reg = circuit.register(input);
        if reg.probed() || reg.sinks().len() != 1 || reg.sinks()[0] != (t, 0) {
            return Ok(false);
        }
        let multiply = reg.source();
        let (t1, t2) = match circuit.kernel(multiply).opcode() {
            Opcode::MatrixTransform {
                transpose_in1,
                transpose_in2,
            } => (*transpose_in1, *transpose_in2),
            _ => return Ok(false),
        };
        if !circuit.kernel(multiply).is_hyper() {
            return Ok(false);
        }
        let a = circuit.kernel(multiply).inputs()[0];
        let b = circuit.kernel(multiply).inputs()[1];
        let output_type = circuit
            .register(circuit.output_of(t, 0))
            .field_type()
            .clone();
        let replacement =
            matrix_matrix_transform_hyperkernel(circuit, [b, a], !t2, !t1, output_type)?;
        circuit.steal_outputs_from(replacement, t);
        circuit.remove_from_circuit(multiply, false, false)?;
        debug!(kernel = %circuit.kernel(replacement).debug_name(), "absorbed downstream transpose");
        Ok(true)
    }

    /// Multiply kernel `m` with a transpose feeding operand `operand`
    fn absorb_upstream(
        circuit: &mut KernelCircuit,
        m: KernelId,
        operand: usize,
    ) -> CircuitResult<bool> {
        let (t1, t2) = match circuit.kernel(m).opcode() {
            Opcode::MatrixTransform {
                transpose_in1,
                transpose_in2,
            } => (*transpose_in1, *transpose_in2),
            _ => return Ok(false),
        };
        let fed = circuit.kernel(m).inputs()[operand];
        if circuit.register(fed).probed() {
            return Ok(false);
        }
        let transpose = circuit.register(fed).source();
        if circuit.kernel(transpose).opcode() != &Opcode::MatrixTranspose
            || !circuit.kernel(transpose).is_hyper()
        {
            return Ok(false);
        }
        let plugged = circuit.kernel(transpose).inputs()[0];
        let other = circuit.kernel(m).inputs()[1 - operand];
        let (inputs, flags) = if operand == 0 {
            ([plugged, other], (!t1, t2))
        } else {
            ([other, plugged], (t1, !t2))
        };
        let output_type = circuit
            .register(circuit.output_of(m, 0))
            .field_type()
            .clone();
        let replacement =
            matrix_matrix_transform_hyperkernel(circuit, inputs, flags.0, flags.1, output_type)?;
        circuit.steal_outputs_from(replacement, m);
        // The transpose stays for its other consumers; if this was the last
        // one it is now a dangler and can go.
        let dangling = circuit.kernel(transpose).outputs().iter().all(|&r| {
            let reg = circuit.register(r);
            reg.sinks().is_empty() && !reg.probed()
        });
        if dangling {
            circuit.remove_from_circuit(transpose, false, false)?;
        }
        debug!(kernel = %circuit.kernel(replacement).debug_name(), operand, "absorbed upstream transpose");
        Ok(true)
    }
}

impl OptimizerPass for TransformTransposeOptimizer {
    fn name(&self) -> &'static str {
        "TransformTranspose"
    }

    fn enabled(&self, config: &OptimizerConfig) -> bool {
        config.enable_transform_transpose
    }

    fn run(&self, circuit: &mut KernelCircuit, _ctx: &PassContext<'_>) -> CircuitResult<usize> {
        let mut absorbed = 0;
        for k in circuit.flatten_preorder() {
            if circuit.kernel(k).is_dead() {
                continue;
            }
            match circuit.kernel(k).opcode() {
                Opcode::MatrixTranspose => {
                    if Self::absorb_downstream(circuit, k)? {
                        absorbed += 1;
                    }
                }
                Opcode::MatrixTransform { .. } => {
                    if Self::absorb_upstream(circuit, k, 0)? {
                        absorbed += 1;
                    } else if Self::absorb_upstream(circuit, k, 1)? {
                        absorbed += 1;
                    }
                }
                _ => {}
            }
        }
        circuit.fix_recurrences();
        Ok(absorbed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::DeviceParams;
    use crate::ir::Shape;

    fn run(circuit: &mut KernelCircuit) -> usize {
        let config = OptimizerConfig::default();
        let device = DeviceParams::default();
        let ctx = PassContext {
            config: &config,
            device_params: &device,
            profiler: None,
        };
        TransformTransposeOptimizer.run(circuit, &ctx).unwrap()
    }

    fn matrix(circuit: &mut KernelCircuit, rows: usize, cols: usize) -> crate::ir::RegisterId {
        let shape = Shape::new(vec![rows, cols], Shape::MAX_FIELD_DIMENSIONS).unwrap();
        circuit.constant(shape, &vec![1.0; rows * cols]).unwrap()
    }

    #[test]
    fn downstream_transpose_swaps_operands_and_flags() {
        let mut circuit = KernelCircuit::new();
        let a = matrix(&mut circuit, 3, 4);
        let b = matrix(&mut circuit, 4, 5);
        let product = circuit.matrix_transform(a, b, false, false).unwrap();
        let transposed = circuit.matrix_transpose(product).unwrap();
        circuit.probe(transposed, Some("out"));
        assert_eq!(circuit.size(), 4);

        let absorbed = run(&mut circuit);
        assert_eq!(absorbed, 1);
        assert_eq!(circuit.size(), 3);
        let out = circuit.find_stolen_output(transposed);
        let replacement = circuit.register(out).source();
        assert_eq!(
            circuit.kernel(replacement).opcode(),
            &Opcode::MatrixTransform {
                transpose_in1: true,
                transpose_in2: true,
            }
        );
        assert_eq!(circuit.kernel(replacement).inputs(), &[b, a]);
        assert_eq!(
            circuit.register(out).field_type().field_shape.extents(),
            &[5, 3]
        );
        assert!(circuit.register(out).probed());
        circuit.validate().unwrap();
    }

    #[test]
    fn downstream_absorption_needs_sole_consumer() {
        let mut circuit = KernelCircuit::new();
        let a = matrix(&mut circuit, 3, 3);
        let b = matrix(&mut circuit, 3, 3);
        let product = circuit.matrix_transform(a, b, false, false).unwrap();
        let transposed = circuit.matrix_transpose(product).unwrap();
        let doubled = circuit.multiply_const(product, 2.0).unwrap();
        circuit.probe(transposed, None);
        circuit.probe(doubled, None);

        assert_eq!(run(&mut circuit), 0);
        circuit.validate().unwrap();
    }

    #[test]
    fn upstream_transpose_plugs_source_directly() {
        let mut circuit = KernelCircuit::new();
        let x = matrix(&mut circuit, 4, 3);
        let b = matrix(&mut circuit, 4, 5);
        let xt = circuit.matrix_transpose(x).unwrap();
        let product = circuit.matrix_transform(xt, b, false, false).unwrap();
        circuit.probe(product, Some("out"));
        assert_eq!(circuit.size(), 4);

        let absorbed = run(&mut circuit);
        assert_eq!(absorbed, 1);
        // The dangling transpose is collected with the rewrite
        assert_eq!(circuit.size(), 3);
        let out = circuit.find_stolen_output(product);
        let replacement = circuit.register(out).source();
        assert_eq!(
            circuit.kernel(replacement).opcode(),
            &Opcode::MatrixTransform {
                transpose_in1: true,
                transpose_in2: false,
            }
        );
        assert_eq!(circuit.kernel(replacement).inputs(), &[x, b]);
        circuit.validate().unwrap();
    }

    #[test]
    fn upstream_absorption_keeps_shared_transpose_alive() {
        let mut circuit = KernelCircuit::new();
        let x = matrix(&mut circuit, 4, 3);
        let b = matrix(&mut circuit, 4, 5);
        let xt = circuit.matrix_transpose(x).unwrap();
        let product = circuit.matrix_transform(xt, b, false, false).unwrap();
        let also = circuit.multiply_const(xt, 2.0).unwrap();
        circuit.probe(product, None);
        circuit.probe(also, None);
        assert_eq!(circuit.size(), 5);

        let absorbed = run(&mut circuit);
        assert_eq!(absorbed, 1);
        // Transpose still feeds its other consumer
        assert_eq!(circuit.size(), 5);
        assert!(!circuit.kernel(circuit.register(xt).source()).is_dead());
        circuit.validate().unwrap();
    }

    #[test]
    fn probed_transpose_output_blocks_upstream_absorption() {
        let mut circuit = KernelCircuit::new();
        let x = matrix(&mut circuit, 4, 3);
        let b = matrix(&mut circuit, 4, 5);
        let xt = circuit.matrix_transpose(x).unwrap();
        circuit.probe(xt, Some("xt"));
        let product = circuit.matrix_transform(xt, b, false, false).unwrap();
        circuit.probe(product, None);

        assert_eq!(run(&mut circuit), 0);
        circuit.validate().unwrap();
    }
}
