//! Common-subexpression elimination.
//!
//! Two kernels are equivalent iff their opcodes are structurally equal and
//! they read the same registers, in order, by identity. One representative
//! survives; the duplicate's output registers transfer to it wholesale, so
//! downstream consumers keep the register identity they already hold.
//!
//! Opcode parameters must compare and hash by value, including sequence
//! parameters, or this pass silently misses candidates.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use super::{OptimizerPass, PassContext};
use crate::config::OptimizerConfig;
use crate::error::CircuitResult;
use crate::ir::{KernelCircuit, KernelId, Opcode, RegisterId};

pub struct CommonSubexpression;

impl CommonSubexpression {
    /// One preorder sweep; returns the number of duplicates removed.
    ///
    /// Stealing outputs rewires downstream input lists, which invalidates
    /// the keys of kernels already visited, so the caller repeats the sweep
    /// until it removes nothing.
    fn sweep(circuit: &mut KernelCircuit) -> usize {
        let mut removed = 0;
        let mut seen: HashMap<(Opcode, Vec<RegisterId>), KernelId> = HashMap::new();
        for k in circuit.flatten_preorder() {
            if circuit.kernel(k).is_dead() {
                continue;
            }
            let key = (
                circuit.kernel(k).opcode().clone(),
                circuit.kernel(k).inputs().to_vec(),
            );
            match seen.entry(key) {
                Entry::Occupied(canonical) => {
                    let canonical = *canonical.get();
                    let outputs = circuit.kernel(k).outputs().len();
                    for i in 0..outputs {
                        let kept = circuit.output_of(canonical, i);
                        let dropped = circuit.output_of(k, i);
                        circuit.steal_probe_and_name_from(kept, dropped);
                    }
                    circuit.steal_outputs_from(canonical, k);
                    removed += 1;
                }
                Entry::Vacant(slot) => {
                    slot.insert(k);
                }
            }
        }
        removed
    }
}

impl OptimizerPass for CommonSubexpression {
    fn name(&self) -> &'static str {
        "CommonSubexpression"
    }

    fn enabled(&self, config: &OptimizerConfig) -> bool {
        config.enable_common_subexpression
    }

    fn run(&self, circuit: &mut KernelCircuit, _ctx: &PassContext<'_>) -> CircuitResult<usize> {
        let mut total = 0;
        loop {
            let removed = Self::sweep(circuit);
            total += removed;
            if removed == 0 {
                break;
            }
        }
        circuit.fix_recurrences();
        Ok(total)
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
        CommonSubexpression.run(circuit, &ctx).unwrap()
    }

    fn shape(points: usize) -> Shape {
        Shape::new(vec![points], Shape::MAX_FIELD_DIMENSIONS).unwrap()
    }

    #[test]
    fn duplicate_sums_collapse() {
        let mut circuit = KernelCircuit::new();
        let in1 = circuit.constant(shape(16), &[1.0; 16]).unwrap();
        let in2 = circuit.constant(shape(16), &[2.0; 16]).unwrap();
        let s1 = circuit.add(in1, in2).unwrap();
        let s2 = circuit.add(in1, in2).unwrap();
        let fin = circuit.add(s1, s2).unwrap();
        circuit.probe(fin, Some("final"));
        assert_eq!(circuit.size(), 5);

        let removed = run(&mut circuit);
        assert_eq!(removed, 1);
        assert_eq!(circuit.size(), 4);
        // The probed output survives the rewrite
        let fin = circuit.find_stolen_output(fin);
        assert!(circuit.register(fin).probed());
        circuit.validate().unwrap();
    }

    #[test]
    fn cascaded_duplicates_collapse_over_repeated_sweeps() {
        // d1/d2 only become structurally equal once s1/s2 are shared, which
        // a single sweep cannot see.
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(4), &[1.0; 4]).unwrap();
        let b = circuit.constant(shape(4), &[2.0; 4]).unwrap();
        let s1 = circuit.add(a, b).unwrap();
        let s2 = circuit.add(a, b).unwrap();
        let d1 = circuit.flip(s1).unwrap();
        let d2 = circuit.flip(s2).unwrap();
        let fin = circuit.add(d1, d2).unwrap();
        circuit.probe(fin, None);
        assert_eq!(circuit.size(), 7);

        let removed = run(&mut circuit);
        assert_eq!(removed, 2);
        assert_eq!(circuit.size(), 5);
        circuit.validate().unwrap();
    }

    #[test]
    fn different_constants_do_not_collapse() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(2), &[1.0, 2.0]).unwrap();
        let b = circuit.constant(shape(2), &[1.0, 3.0]).unwrap();
        let sum = circuit.add(a, b).unwrap();
        circuit.probe(sum, None);
        assert_eq!(run(&mut circuit), 0);
        assert_eq!(circuit.size(), 3);
    }

    #[test]
    fn probes_transfer_from_the_duplicate() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(2), &[1.0, 2.0]).unwrap();
        let m1 = circuit.multiply_const(a, 2.0).unwrap();
        let m2 = circuit.multiply_const(a, 2.0).unwrap();
        circuit.probe(m2, Some("watched"));

        let removed = run(&mut circuit);
        assert_eq!(removed, 1);
        let survivor = circuit.find_stolen_output(m1);
        assert!(circuit.register(survivor).probed());
        assert_eq!(circuit.register(survivor).name(), Some("watched"));
        circuit.validate().unwrap();
    }

    #[test]
    fn cse_is_idempotent() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(4), &[1.0; 4]).unwrap();
        let s1 = circuit.add(a, a).unwrap();
        let s2 = circuit.add(a, a).unwrap();
        let fin = circuit.add(s1, s2).unwrap();
        circuit.probe(fin, None);
        assert!(run(&mut circuit) > 0);
        assert_eq!(run(&mut circuit), 0);
    }
}
