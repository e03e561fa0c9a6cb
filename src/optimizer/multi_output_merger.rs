//! Horizontal hyperkernel merging.
//!
//! Sibling hyperkernels reading identical input lists re-fetch the same
//! field data in separate launches. When the code generator can emit both
//! bodies in one kernel (`can_share_multi_output_kernel`), the siblings
//! collapse into a single multi-output kernel. Each equivalence class
//! merges at most once per run; the driver's fixed-point loop re-runs the
//! pass until nothing new appears.

use std::collections::HashSet;

use tracing::debug;

use super::{OptimizerPass, PassContext};
use crate::config::OptimizerConfig;
use crate::error::CircuitResult;
use crate::factory::can_share_multi_output_kernel;
use crate::ir::{KernelCircuit, KernelId};

pub struct HyperKernelMultiOutputMerger;

impl HyperKernelMultiOutputMerger {
    /// Kernels consuming every input register of `k`, in deterministic
    /// order. Siblings necessarily sink the first input, so its sink list
    /// is the candidate pool.
    fn siblings(circuit: &KernelCircuit, k: KernelId) -> Vec<KernelId> {
        let inputs = circuit.kernel(k).inputs();
        let mut seen = HashSet::new();
        circuit
            .register(inputs[0])
            .sinks()
            .iter()
            .map(|&(consumer, _)| consumer)
            .filter(|&consumer| consumer != k && seen.insert(consumer))
            .filter(|&consumer| circuit.kernel(consumer).inputs() == inputs)
            .collect()
    }
}

impl OptimizerPass for HyperKernelMultiOutputMerger {
    fn name(&self) -> &'static str {
        "HyperKernelMultiOutputMerger"
    }

    fn enabled(&self, config: &OptimizerConfig) -> bool {
        config.enable_multi_output_merging
    }

    fn run(&self, circuit: &mut KernelCircuit, ctx: &PassContext<'_>) -> CircuitResult<usize> {
        let mut merges = 0;
        let mut created: HashSet<KernelId> = HashSet::new();
        for k in circuit.flatten_preorder() {
            let kernel = circuit.kernel(k);
            if kernel.is_dead()
                || !kernel.is_hyper()
                || kernel.inputs().is_empty()
                || created.contains(&k)
            {
                continue;
            }
            let mut current = k;
            for candidate in Self::siblings(circuit, k) {
                let cand = circuit.kernel(candidate);
                if cand.is_dead() || !cand.is_hyper() || created.contains(&candidate) {
                    continue;
                }
                // Progressive merging grows `current`; re-check inputs
                // because adoption may have rewired them.
                if circuit.kernel(current).inputs() != circuit.kernel(candidate).inputs() {
                    continue;
                }
                let combined =
                    circuit.kernel(current).outputs().len() + cand.outputs().len();
                if !can_share_multi_output_kernel(
                    circuit.kernel(current).opcode(),
                    circuit.kernel(candidate).opcode(),
                    combined,
                    ctx.device_params,
                ) {
                    continue;
                }
                let merged = circuit.do_multi_output_merge(current, candidate)?;
                if ctx.config.verbose_kernel_merging {
                    debug!(
                        merged = %circuit.kernel(merged).debug_name(),
                        outputs = combined,
                        "shared multi-output kernel"
                    );
                }
                created.insert(merged);
                current = merged;
                merges += 1;
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
        HyperKernelMultiOutputMerger.run(circuit, &ctx).unwrap()
    }

    fn run(circuit: &mut KernelCircuit) -> usize {
        run_with(circuit, &DeviceParams::default())
    }

    fn shape(points: usize) -> Shape {
        Shape::new(vec![points], Shape::MAX_FIELD_DIMENSIONS).unwrap()
    }

    #[test]
    fn siblings_with_identical_inputs_share_one_kernel() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(4), &[1.0; 4]).unwrap();
        let doubled = circuit.multiply_const(a, 2.0).unwrap();
        let tripled = circuit.multiply_const(a, 3.0).unwrap();
        let shifted = circuit.add_const(a, 1.0).unwrap();
        circuit.probe(doubled, Some("x2"));
        circuit.probe(tripled, Some("x3"));
        circuit.probe(shifted, Some("p1"));
        assert_eq!(circuit.size(), 4);

        let merges = run(&mut circuit);
        assert_eq!(merges, 2);
        assert_eq!(circuit.size(), 2);
        let live = circuit.find_stolen_output(doubled);
        let merged = circuit.register(live).source();
        assert_eq!(circuit.kernel(merged).outputs().len(), 3);
        assert!(matches!(
            circuit.kernel(merged).opcode(),
            Opcode::MergedMultiOutput { .. }
        ));
        for r in [doubled, tripled, shifted] {
            let live = circuit.find_stolen_output(r);
            assert!(circuit.register(live).probed());
            assert_eq!(circuit.register(live).source(), merged);
        }
        circuit.validate().unwrap();
    }

    #[test]
    fn different_inputs_do_not_share() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(4), &[1.0; 4]).unwrap();
        let b = circuit.constant(shape(4), &[2.0; 4]).unwrap();
        let da = circuit.multiply_const(a, 2.0).unwrap();
        let db = circuit.multiply_const(b, 2.0).unwrap();
        circuit.probe(da, None);
        circuit.probe(db, None);
        assert_eq!(run(&mut circuit), 0);
    }

    #[test]
    fn output_limit_bounds_sharing() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(4), &[1.0; 4]).unwrap();
        for i in 0..4 {
            let out = circuit.multiply_const(a, i as f32).unwrap();
            circuit.probe(out, None);
        }
        let device = DeviceParams {
            max_kernel_outputs: 2,
            ..DeviceParams::default()
        };
        // Only pairs fit: two merges of two kernels each
        let merges = run_with(&mut circuit, &device);
        assert_eq!(merges, 2);
        assert_eq!(circuit.size(), 3);
        circuit.validate().unwrap();
    }

    #[test]
    fn merged_kernels_are_not_remerged_within_a_run() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(4), &[1.0; 4]).unwrap();
        let x = circuit.multiply_const(a, 2.0).unwrap();
        let y = circuit.multiply_const(a, 3.0).unwrap();
        circuit.probe(x, None);
        circuit.probe(y, None);
        let first = run(&mut circuit);
        assert_eq!(first, 1);
        // Nothing left to share: the merged kernel stands alone
        assert_eq!(run(&mut circuit), 0);
        circuit.validate().unwrap();
    }
}
