//! Dead-kernel elimination.
//!
//! Removes kernels whose outputs nobody reads and nobody probes, restricted
//! to kernels that are safe to drop (device and constant-field kernels).
//! User CPU kernels may have side effects and are never removed, even when
//! they look useless.

use super::{OptimizerPass, PassContext};
use crate::config::OptimizerConfig;
use crate::error::CircuitResult;
use crate::ir::{KernelCircuit, KernelId};

pub struct DeadKernelRemover;

impl DeadKernelRemover {
    fn find_useless(circuit: &KernelCircuit) -> Option<KernelId> {
        circuit.flatten_preorder().into_iter().find(|&k| {
            circuit.kind_is_droppable(k)
                && circuit.kernel(k).outputs().iter().all(|&r| {
                    let reg = circuit.register(r);
                    reg.sinks().is_empty() && !reg.probed()
                })
        })
    }
}

impl OptimizerPass for DeadKernelRemover {
    fn name(&self) -> &'static str {
        "DeadKernel"
    }

    fn enabled(&self, config: &OptimizerConfig) -> bool {
        config.enable_dead_kernel_removal
    }

    fn run(&self, circuit: &mut KernelCircuit, _ctx: &PassContext<'_>) -> CircuitResult<usize> {
        let mut removed = 0;
        // One kernel at a time: removing a kernel may orphan its producers,
        // which the next traversal then finds. Recursive removal is
        // deliberately off; probed producers must survive for out-of-band
        // consumers, and the rename map handles the rest.
        while let Some(k) = Self::find_useless(circuit) {
            circuit.remove_from_circuit(k, true, false)?;
            removed += 1;
        }
        circuit.fix_recurrences();
        Ok(removed)
    }
}
