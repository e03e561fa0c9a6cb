//! Tensor-reduce chain collapsing.
//!
//! Two stacked block reductions with the same associative operator are one
//! reduction with the product factor: the outer reduce folds blocks of the
//! inner reduce's output, and consecutive blocks of consecutive blocks are
//! consecutive blocks. Field shapes are untouched; only the tensor order
//! drops.

use tracing::debug;

use super::{OptimizerPass, PassContext};
use crate::config::OptimizerConfig;
use crate::error::CircuitResult;
use crate::factory::tensor_reduce_hyperkernel;
use crate::ir::{KernelCircuit, KernelId, Opcode, TensorReduceParams};

pub struct TensorReduceCollapser;

impl TensorReduceCollapser {
    fn collapse(circuit: &mut KernelCircuit, outer: KernelId) -> CircuitResult<bool> {
        let outer_params = match circuit.kernel(outer).opcode() {
            Opcode::TensorReduce(p) => p.clone(),
            _ => return Ok(false),
        };
        let middle = circuit.kernel(outer).inputs()[0];
        let reg = circuit.register(middle);
        if reg.probed() || reg.sinks().len() != 1 || reg.sinks()[0] != (outer, 0) {
            return Ok(false);
        }
        let inner = reg.source();
        let inner_params = match circuit.kernel(inner).opcode() {
            Opcode::TensorReduce(p) => p.clone(),
            _ => return Ok(false),
        };
        if inner_params.op != outer_params.op || !circuit.kernel(inner).is_hyper() {
            return Ok(false);
        }
        let source = circuit.kernel(inner).inputs()[0];
        let combined = TensorReduceParams {
            op: outer_params.op,
            factor: inner_params.factor * outer_params.factor,
        };
        // Divisibility of the combined factor follows from the two kernels
        // having type-checked individually, but the factory re-checks.
        if circuit.register(source).field_type().tensor_points() % combined.factor != 0 {
            return Ok(false);
        }
        let output_type = circuit
            .register(circuit.output_of(outer, 0))
            .field_type()
            .clone();
        let replacement = tensor_reduce_hyperkernel(circuit, source, combined.clone(), output_type)?;
        circuit.steal_outputs_from(replacement, outer);
        circuit.remove_from_circuit(inner, false, false)?;
        debug!(
            factor = combined.factor,
            kernel = %circuit.kernel(replacement).debug_name(),
            "collapsed reduce chain"
        );
        Ok(true)
    }
}

impl OptimizerPass for TensorReduceCollapser {
    fn name(&self) -> &'static str {
        "TensorReduce"
    }

    fn enabled(&self, config: &OptimizerConfig) -> bool {
        config.enable_tensor_reduce
    }

    fn run(&self, circuit: &mut KernelCircuit, _ctx: &PassContext<'_>) -> CircuitResult<usize> {
        let mut collapsed = 0;
        for k in circuit.flatten_preorder() {
            if circuit.kernel(k).is_dead() {
                continue;
            }
            if Self::collapse(circuit, k)? {
                collapsed += 1;
            }
        }
        circuit.fix_recurrences();
        Ok(collapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::DeviceParams;
    use crate::ir::{ElementType, FieldType, ReduceOp, Shape};

    fn run(circuit: &mut KernelCircuit) -> usize {
        let config = OptimizerConfig::default();
        let device = DeviceParams::default();
        let ctx = PassContext {
            config: &config,
            device_params: &device,
            profiler: None,
        };
        TensorReduceCollapser.run(circuit, &ctx).unwrap()
    }

    fn vector_field(circuit: &mut KernelCircuit, planes: usize) -> crate::ir::RegisterId {
        let ty = FieldType::new(
            Shape::new(vec![4], Shape::MAX_FIELD_DIMENSIONS).unwrap(),
            Shape::new(vec![planes], Shape::MAX_TENSOR_DIMENSIONS).unwrap(),
            ElementType::Float32,
        );
        circuit.constant_typed(ty, &vec![1.0; 4 * planes]).unwrap()
    }

    #[test]
    fn stacked_sums_become_one_reduce() {
        let mut circuit = KernelCircuit::new();
        let x = vector_field(&mut circuit, 12);
        let inner = circuit.tensor_reduce(x, ReduceOp::Sum, 3).unwrap();
        let outer = circuit.tensor_reduce(inner, ReduceOp::Sum, 2).unwrap();
        circuit.probe(outer, Some("out"));
        assert_eq!(circuit.size(), 3);

        let collapsed = run(&mut circuit);
        assert_eq!(collapsed, 1);
        assert_eq!(circuit.size(), 2);
        let out = circuit.find_stolen_output(outer);
        let replacement = circuit.register(out).source();
        assert_eq!(
            circuit.kernel(replacement).opcode(),
            &Opcode::TensorReduce(TensorReduceParams {
                op: ReduceOp::Sum,
                factor: 6,
            })
        );
        assert_eq!(circuit.register(out).field_type().tensor_points(), 2);
        circuit.validate().unwrap();
    }

    #[test]
    fn mixed_operators_do_not_collapse() {
        let mut circuit = KernelCircuit::new();
        let x = vector_field(&mut circuit, 12);
        let inner = circuit.tensor_reduce(x, ReduceOp::Sum, 3).unwrap();
        let outer = circuit.tensor_reduce(inner, ReduceOp::Max, 2).unwrap();
        circuit.probe(outer, None);
        assert_eq!(run(&mut circuit), 0);
        assert_eq!(circuit.size(), 3);
    }

    #[test]
    fn probed_middle_register_blocks_collapse() {
        let mut circuit = KernelCircuit::new();
        let x = vector_field(&mut circuit, 12);
        let inner = circuit.tensor_reduce(x, ReduceOp::Sum, 3).unwrap();
        circuit.probe(inner, Some("partial"));
        let outer = circuit.tensor_reduce(inner, ReduceOp::Sum, 2).unwrap();
        circuit.probe(outer, None);
        assert_eq!(run(&mut circuit), 0);
        circuit.validate().unwrap();
    }

    #[test]
    fn shared_middle_register_blocks_collapse() {
        let mut circuit = KernelCircuit::new();
        let x = vector_field(&mut circuit, 12);
        let inner = circuit.tensor_reduce(x, ReduceOp::Min, 3).unwrap();
        let outer = circuit.tensor_reduce(inner, ReduceOp::Min, 2).unwrap();
        let other = circuit.tensor_reduce(inner, ReduceOp::Min, 4).unwrap();
        circuit.probe(outer, None);
        circuit.probe(other, None);
        assert_eq!(run(&mut circuit), 0);
        circuit.validate().unwrap();
    }
}
