//! Duplicated-input compaction.
//!
//! A hyperkernel reading the same register on two input positions wastes a
//! device buffer binding. The kernel is rebuilt with the unique inputs and
//! an opcode-local operand remapping; outputs, probes and names transfer to
//! the replacement.

use super::{OptimizerPass, PassContext};
use crate::config::OptimizerConfig;
use crate::error::CircuitResult;
use crate::ir::KernelCircuit;

pub struct RedundantInputRemover;

impl OptimizerPass for RedundantInputRemover {
    fn name(&self) -> &'static str {
        "RedundantInputs"
    }

    fn enabled(&self, config: &OptimizerConfig) -> bool {
        config.enable_redundant_input_removal
    }

    fn run(&self, circuit: &mut KernelCircuit, _ctx: &PassContext<'_>) -> CircuitResult<usize> {
        let mut rebuilt = 0;
        for k in circuit.flatten_preorder() {
            let kernel = circuit.kernel(k);
            if kernel.is_dead() || !kernel.is_hyper() || !kernel.has_duplicated_inputs() {
                continue;
            }
            circuit.remove_redundant_inputs(k)?;
            rebuilt += 1;
        }
        circuit.fix_recurrences();
        Ok(rebuilt)
    }
}
