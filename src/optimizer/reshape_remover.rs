//! Reshape elision.
//!
//! A reshape relabels a field's shape without touching element order, so
//! its consumers can read the producer's register directly once code
//! generation no longer cares about the declared input shape. This pass
//! must run after every other pass: rewiring changes a consumer's declared
//! input field type, which would confuse shape-sensitive pattern matching
//! in the earlier passes.

use tracing::debug;

use super::{OptimizerPass, PassContext};
use crate::config::OptimizerConfig;
use crate::error::CircuitResult;
use crate::ir::{KernelCircuit, Opcode};

pub struct ReshapeRemover;

impl OptimizerPass for ReshapeRemover {
    fn name(&self) -> &'static str {
        "ReshapeRemover"
    }

    fn enabled(&self, config: &OptimizerConfig) -> bool {
        config.enable_reshape_removal
    }

    fn run(&self, circuit: &mut KernelCircuit, _ctx: &PassContext<'_>) -> CircuitResult<usize> {
        let mut removed = 0;
        // Preorder visits consumers before producers, so a reshape chain
        // unwinds in one sweep.
        for k in circuit.flatten_preorder() {
            let kernel = circuit.kernel(k);
            if kernel.is_dead() || !matches!(kernel.opcode(), Opcode::Reshape { .. }) {
                continue;
            }
            let out = kernel.outputs()[0];
            if circuit.register(out).probed() {
                continue;
            }
            let input = circuit.kernel(k).inputs()[0];
            circuit.steal_sinks_from(input, out);
            circuit.remove_from_circuit(k, false, false)?;
            debug!(register = %input, "elided reshape");
            removed += 1;
        }
        circuit.fix_recurrences();
        Ok(removed)
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
        ReshapeRemover.run(circuit, &ctx).unwrap()
    }

    fn shape(extents: Vec<usize>) -> Shape {
        Shape::new(extents, Shape::MAX_FIELD_DIMENSIONS).unwrap()
    }

    #[test]
    fn reshape_is_elided_and_consumer_rewired() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(vec![100]), &[0.0; 100]).unwrap();
        let grid = circuit
            .reshape(a, shape(vec![10, 10]), Shape::scalar())
            .unwrap();
        let out = circuit.add_const(grid, 1.0).unwrap();
        circuit.probe(out, Some("out"));
        assert_eq!(circuit.size(), 3);

        let removed = run(&mut circuit);
        assert_eq!(removed, 1);
        assert_eq!(circuit.size(), 2);
        // The consumer now reads the reshape's input directly
        let stolen = circuit.find_stolen_output(out);
        let consumer = circuit.register(stolen).source();
        assert_eq!(circuit.kernel(consumer).inputs(), &[a]);
        circuit.validate().unwrap();
    }

    #[test]
    fn probed_reshape_survives() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(vec![100]), &[0.0; 100]).unwrap();
        let grid = circuit
            .reshape(a, shape(vec![10, 10]), Shape::scalar())
            .unwrap();
        circuit.probe(grid, Some("grid"));
        assert_eq!(run(&mut circuit), 0);
        assert_eq!(circuit.size(), 2);
    }

    #[test]
    fn reshape_chain_unwinds_in_one_sweep() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(vec![100]), &[0.0; 100]).unwrap();
        let r1 = circuit
            .reshape(a, shape(vec![10, 10]), Shape::scalar())
            .unwrap();
        let r2 = circuit
            .reshape(r1, shape(vec![4, 25]), Shape::scalar())
            .unwrap();
        let out = circuit.flip(r2).unwrap();
        circuit.probe(out, None);
        assert_eq!(circuit.size(), 4);

        let removed = run(&mut circuit);
        assert_eq!(removed, 2);
        assert_eq!(circuit.size(), 2);
        circuit.validate().unwrap();
    }
}
