//! Vertical hyperkernel merging.
//!
//! A hyperkernel whose outputs feed exactly one other hyperkernel can be
//! folded into that consumer, saving a kernel launch and an intermediate
//! field buffer. Chains collapse greedily: after each merge the fused
//! kernel is re-examined, so `a -> b -> c` becomes one kernel in a single
//! sweep. Whether a pair of opcodes can share a device kernel is the code
//! generator's call (`is_mergeable`); the device's input-count limit bounds
//! how wide a fused kernel may grow.

use tracing::debug;

use super::{OptimizerPass, PassContext};
use crate::config::OptimizerConfig;
use crate::error::CircuitResult;
use crate::factory::is_mergeable;
use crate::ir::{KernelCircuit, KernelId};

pub struct HyperKernelMerger;

impl HyperKernelMerger {
    /// Input count of the kernel that would result from merging
    fn merged_input_count(circuit: &KernelCircuit, sink: KernelId, source: KernelId) -> usize {
        let source_outputs = circuit.kernel(source).outputs();
        let carried = circuit
            .kernel(sink)
            .inputs()
            .iter()
            .filter(|r| !source_outputs.contains(r))
            .count();
        carried + circuit.kernel(source).inputs().len()
    }
}

impl OptimizerPass for HyperKernelMerger {
    fn name(&self) -> &'static str {
        "HyperKernelMerger"
    }

    fn enabled(&self, config: &OptimizerConfig) -> bool {
        config.enable_kernel_merging
    }

    fn run(&self, circuit: &mut KernelCircuit, ctx: &PassContext<'_>) -> CircuitResult<usize> {
        let mut merges = 0;
        loop {
            let mut merged_this_sweep = false;
            for k in circuit.flatten_preorder() {
                if circuit.kernel(k).is_dead() {
                    continue;
                }
                let mut sink = k;
                while let Some(source) = circuit.find_mergeable_input(sink, |s, src| {
                    is_mergeable(s, src, ctx.device_params)
                }) {
                    if Self::merged_input_count(circuit, sink, source)
                        > ctx.device_params.max_merged_kernel_inputs
                    {
                        break;
                    }
                    let source_name = circuit.kernel(source).debug_name();
                    let sink_name = circuit.kernel(sink).debug_name();
                    sink = circuit.do_merge(sink, source)?;
                    if ctx.config.verbose_kernel_merging {
                        debug!(
                            source = %source_name,
                            sink = %sink_name,
                            merged = %circuit.kernel(sink).debug_name(),
                            "merged kernels"
                        );
                    }
                    merges += 1;
                    merged_this_sweep = true;
                }
            }
            if !merged_this_sweep {
                break;
            }
        }
        circuit.fix_recurrences();
        Ok(merges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::DeviceParams;
    use crate::ir::{Opcode, Shape};

    fn run_with(circuit: &mut KernelCircuit, device: &DeviceParams) -> usize {
        let config = OptimizerConfig::default();
        let ctx = PassContext {
            config: &config,
            device_params: device,
            profiler: None,
        };
        HyperKernelMerger.run(circuit, &ctx).unwrap()
    }

    fn run(circuit: &mut KernelCircuit) -> usize {
        run_with(circuit, &DeviceParams::default())
    }

    fn shape(points: usize) -> Shape {
        Shape::new(vec![points], Shape::MAX_FIELD_DIMENSIONS).unwrap()
    }

    #[test]
    fn chain_of_pointwise_kernels_collapses() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(4), &[1.0; 4]).unwrap();
        let doubled = circuit.multiply_const(a, 2.0).unwrap();
        let shifted = circuit.add_const(doubled, 1.0).unwrap();
        let out = circuit.multiply(shifted, a).unwrap();
        circuit.probe(out, Some("out"));
        assert_eq!(circuit.size(), 4);

        let merges = run(&mut circuit);
        assert_eq!(merges, 2);
        // Constant + one fused kernel
        assert_eq!(circuit.size(), 2);
        let out = circuit.find_stolen_output(out);
        assert!(circuit.register(out).probed());
        let merged = circuit.register(out).source();
        assert!(matches!(
            circuit.kernel(merged).opcode(),
            Opcode::Merged { .. }
        ));
        circuit.validate().unwrap();
    }

    #[test]
    fn shared_producer_is_not_merged() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(4), &[1.0; 4]).unwrap();
        let doubled = circuit.multiply_const(a, 2.0).unwrap();
        let u1 = circuit.add_const(doubled, 1.0).unwrap();
        let u2 = circuit.add_const(doubled, 2.0).unwrap();
        circuit.probe(u1, None);
        circuit.probe(u2, None);

        assert_eq!(run(&mut circuit), 0);
        assert_eq!(circuit.size(), 4);
    }

    #[test]
    fn probed_intermediate_is_not_merged() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(4), &[1.0; 4]).unwrap();
        let doubled = circuit.multiply_const(a, 2.0).unwrap();
        circuit.probe(doubled, Some("watch"));
        let out = circuit.add_const(doubled, 1.0).unwrap();
        circuit.probe(out, None);

        assert_eq!(run(&mut circuit), 0);
        circuit.validate().unwrap();
    }

    #[test]
    fn non_pointwise_producer_is_not_merged() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(4), &[1.0; 4]).unwrap();
        let flipped = circuit.flip(a).unwrap();
        let out = circuit.add_const(flipped, 1.0).unwrap();
        circuit.probe(out, None);

        assert_eq!(run(&mut circuit), 0);
    }

    #[test]
    fn device_input_limit_bounds_merging() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(4), &[1.0; 4]).unwrap();
        let b = circuit.constant(shape(4), &[2.0; 4]).unwrap();
        let sum = circuit.add(a, b).unwrap();
        let out = circuit.multiply(sum, a).unwrap();
        circuit.probe(out, None);

        // Merging would need 3 inputs; cap the device at 2
        let device = DeviceParams {
            max_merged_kernel_inputs: 2,
            ..DeviceParams::default()
        };
        assert_eq!(run_with(&mut circuit, &device), 0);
        assert_eq!(run(&mut circuit), 1);
        circuit.validate().unwrap();
    }
}
