//! Kernel circuit: the mutable DAG of kernels and virtual field registers.
//!
//! The circuit owns every kernel and every register in two arenas; kernels
//! and registers refer to each other by id, so "equality by identity" in the
//! optimizer is id equality. All structural mutation goes through the
//! rewrite primitives defined here; each primitive leaves the circuit in a
//! consistent state.
//!
//! Feedback edges are not part of the DAG. A recurrent kernel holds an
//! out-of-band pointer to the register producing its next-cycle value; the
//! circuit maintains a rename map (`stolen_outputs`) recording, for every
//! register ever replaced during a rewrite, its current replacement. The
//! recurrence fix-up chases that map after every optimizer pass.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use super::{FieldType, Opcode};
use crate::error::{CircuitError, CircuitResult};

// ============================================================================
// Ids
// ============================================================================

/// Identity of a kernel inside its circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelId(pub(crate) u32);

/// Identity of a virtual field register inside its circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegisterId(pub(crate) u32);

impl KernelId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl RegisterId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}", self.0)
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

// ============================================================================
// Registers and Kernels
// ============================================================================

/// Output edge of a kernel.
///
/// A register is owned by the kernel that produces it. Its `sinks` form an
/// ordered multiset of (consumer, input position) pairs: a register appears
/// in a consumer's entry exactly as many times as that consumer reads it on
/// distinct input positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualFieldRegister {
    pub(crate) id: RegisterId,
    pub(crate) source: KernelId,
    pub(crate) field_type: FieldType,
    pub(crate) sinks: Vec<(KernelId, usize)>,
    pub(crate) probed: bool,
    pub(crate) name: Option<String>,
}

impl VirtualFieldRegister {
    pub fn id(&self) -> RegisterId {
        self.id
    }

    pub fn source(&self) -> KernelId {
        self.source
    }

    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    pub fn sinks(&self) -> &[(KernelId, usize)] {
        &self.sinks
    }

    pub fn probed(&self) -> bool {
        self.probed
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Capability class of a kernel.
///
/// Passes match on this exhaustively. Device kernels are hyperkernels: they
/// participate in merging and duplicated-input compaction. User CPU kernels
/// may have side effects and are never removed, even when they look useless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelKind {
    /// GPU kernel with merging rules
    Device,
    /// Produces a compile-time constant field
    ConstantField,
    /// Stateful kernel fed by an out-of-band feedback register
    Recurrent {
        /// Register producing the next-cycle value; set by the frontend
        recurrence: Option<RegisterId>,
    },
    /// Opaque host kernel, possibly side-effecting
    UserCpu,
}

/// A node of the compute graph: one field-to-field operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbstractKernel {
    pub(crate) id: KernelId,
    pub(crate) opcode: Opcode,
    pub(crate) kind: KernelKind,
    pub(crate) inputs: Vec<RegisterId>,
    pub(crate) outputs: Vec<RegisterId>,
    pub(crate) is_dead: bool,
}

impl AbstractKernel {
    pub fn id(&self) -> KernelId {
        self.id
    }

    pub fn opcode(&self) -> &Opcode {
        &self.opcode
    }

    pub fn kind(&self) -> &KernelKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[RegisterId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[RegisterId] {
        &self.outputs
    }

    pub fn is_dead(&self) -> bool {
        self.is_dead
    }

    /// Device kernels are hyperkernels
    pub fn is_hyper(&self) -> bool {
        matches!(self.kind, KernelKind::Device)
    }

    /// True if any register appears twice in the input list
    pub fn has_duplicated_inputs(&self) -> bool {
        let mut seen = HashSet::new();
        self.inputs.iter().any(|r| !seen.insert(*r))
    }

    /// Derived debug name: opcode name plus kernel id
    pub fn debug_name(&self) -> String {
        format!("{}-{}", self.opcode.name(), self.id)
    }
}

// ============================================================================
// KernelCircuit
// ============================================================================

/// A mutable DAG of kernels.
///
/// Kernels live inside exactly one circuit. They are removed by
/// [`KernelCircuit::remove_from_circuit`], which marks them dead and unlinks
/// them from the sinks of their inputs; dead kernels stay in the arena so
/// that ids remain stable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelCircuit {
    kernels: Vec<AbstractKernel>,
    registers: Vec<VirtualFieldRegister>,
    /// Rename map: every register ever replaced by output stealing maps to
    /// its replacement, chased transitively by `find_stolen_output`.
    #[serde(skip)]
    stolen_outputs: HashMap<RegisterId, RegisterId>,
}

impl KernelCircuit {
    pub fn new() -> Self {
        KernelCircuit::default()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn kernel(&self, id: KernelId) -> &AbstractKernel {
        &self.kernels[id.index()]
    }

    fn kernel_mut(&mut self, id: KernelId) -> &mut AbstractKernel {
        &mut self.kernels[id.index()]
    }

    pub fn register(&self, id: RegisterId) -> &VirtualFieldRegister {
        &self.registers[id.index()]
    }

    fn register_mut(&mut self, id: RegisterId) -> &mut VirtualFieldRegister {
        &mut self.registers[id.index()]
    }

    /// Output register `i` of kernel `k`
    pub fn output_of(&self, k: KernelId, i: usize) -> RegisterId {
        self.kernel(k).outputs[i]
    }

    /// Number of live kernels
    pub fn size(&self) -> usize {
        self.kernels.iter().filter(|k| !k.is_dead).count()
    }

    /// A register is live when its source kernel is live and still owns it
    pub fn register_is_live(&self, r: RegisterId) -> bool {
        let reg = self.register(r);
        let source = self.kernel(reg.source);
        !source.is_dead && source.outputs.contains(&r)
    }

    /// Mark a register as externally observed, optionally naming it
    pub fn probe(&mut self, r: RegisterId, name: Option<&str>) {
        let reg = self.register_mut(r);
        reg.probed = true;
        if reg.name.is_none() {
            reg.name = name.map(str::to_string);
        }
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Add a kernel with the given inputs and declared output types.
    ///
    /// Inputs must be live registers of this circuit. Where the opcode
    /// supports type inference the declared types are cross-checked against
    /// it; merged and opaque opcodes carry their types from the rewrite or
    /// frontend that produced them.
    pub fn add_kernel(
        &mut self,
        kind: KernelKind,
        opcode: Opcode,
        inputs: &[RegisterId],
        output_types: Vec<FieldType>,
    ) -> CircuitResult<KernelId> {
        if let Some(expected) = opcode.arity() {
            if inputs.len() != expected {
                return Err(CircuitError::ArityMismatch {
                    opcode: opcode.name(),
                    expected,
                    found: inputs.len(),
                });
            }
        }
        for &r in inputs {
            if !self.register_is_live(r) {
                return Err(CircuitError::DeadKernel(format!(
                    "input {r} of new '{}' kernel",
                    opcode.name()
                )));
            }
        }
        let inferable = !matches!(
            opcode,
            Opcode::ConstantField { .. }
                | Opcode::Recurrence
                | Opcode::UserCpu { .. }
                | Opcode::Merged { .. }
                | Opcode::MergedMultiOutput { .. }
                | Opcode::Remapped { .. }
        );
        if inferable {
            let input_types: Vec<FieldType> = inputs
                .iter()
                .map(|&r| self.register(r).field_type.clone())
                .collect();
            let inferred = opcode.output_type(&input_types)?;
            if output_types.len() != 1 || output_types[0] != inferred {
                return Err(CircuitError::OutputTypeMismatch {
                    kernel: opcode.name(),
                    declared: output_types
                        .first()
                        .cloned()
                        .unwrap_or_else(|| inferred.clone()),
                    inferred,
                });
            }
        }

        let id = KernelId(u32::try_from(self.kernels.len()).unwrap_or(u32::MAX));
        let mut outputs = Vec::with_capacity(output_types.len());
        for field_type in output_types {
            let rid = RegisterId(u32::try_from(self.registers.len()).unwrap_or(u32::MAX));
            self.registers.push(VirtualFieldRegister {
                id: rid,
                source: id,
                field_type,
                sinks: Vec::new(),
                probed: false,
                name: None,
            });
            outputs.push(rid);
        }
        for (position, &r) in inputs.iter().enumerate() {
            self.register_mut(r).sinks.push((id, position));
        }
        self.kernels.push(AbstractKernel {
            id,
            opcode,
            kind,
            inputs: inputs.to_vec(),
            outputs,
            is_dead: false,
        });
        Ok(id)
    }

    /// Set the out-of-band feedback register of a recurrent kernel.
    ///
    /// The feedback register is marked probed: it is externally observed by
    /// the next cycle and must never be optimized away.
    pub fn set_recurrence(&mut self, k: KernelId, r: RegisterId) -> CircuitResult<()> {
        let name = self.kernel(k).debug_name();
        match &mut self.kernel_mut(k).kind {
            KernelKind::Recurrent { recurrence } => {
                *recurrence = Some(r);
            }
            _ => return Err(CircuitError::NotRecurrent(name)),
        }
        self.register_mut(r).probed = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// Live kernels in insertion order
    pub fn flatten(&self) -> Vec<KernelId> {
        self.kernels
            .iter()
            .filter(|k| !k.is_dead)
            .map(|k| k.id)
            .collect()
    }

    /// Terminal kernels: live kernels none of whose outputs has a sink.
    ///
    /// Every live kernel is reachable from some terminal kernel because the
    /// graph is acyclic.
    pub fn roots(&self) -> Vec<KernelId> {
        self.kernels
            .iter()
            .filter(|k| !k.is_dead)
            .filter(|k| k.outputs.iter().all(|&r| self.register(r).sinks.is_empty()))
            .map(|k| k.id)
            .collect()
    }

    /// Live kernels in preorder: each terminal kernel in insertion order,
    /// then depth-first into its inputs, consumers before producers.
    ///
    /// Deterministic given the circuit's insertion order.
    pub fn flatten_preorder(&self) -> Vec<KernelId> {
        let mut order = Vec::with_capacity(self.kernels.len());
        let mut visited = HashSet::new();
        for root in self.roots() {
            self.preorder_visit(root, &mut visited, &mut order);
        }
        order
    }

    fn preorder_visit(
        &self,
        k: KernelId,
        visited: &mut HashSet<KernelId>,
        order: &mut Vec<KernelId>,
    ) {
        if !visited.insert(k) {
            return;
        }
        order.push(k);
        let inputs = self.kernel(k).inputs.clone();
        for r in inputs {
            let source = self.register(r).source;
            self.preorder_visit(source, visited, order);
        }
    }

    /// Apply `op` to every live kernel in preorder
    pub fn traverse_preorder(&self, mut op: impl FnMut(&AbstractKernel)) {
        for k in self.flatten_preorder() {
            op(self.kernel(k));
        }
    }

    // ------------------------------------------------------------------
    // Rename map
    // ------------------------------------------------------------------

    /// Follow the rename map to its fixed point; returns `r` if unchanged.
    ///
    /// Chains are collapsed on each lookup so repeated chases stay cheap.
    pub fn find_stolen_output(&mut self, r: RegisterId) -> RegisterId {
        let mut chain = Vec::new();
        let mut current = r;
        while let Some(&next) = self.stolen_outputs.get(&current) {
            chain.push(current);
            current = next;
        }
        for link in chain {
            self.stolen_outputs.insert(link, current);
        }
        current
    }

    /// Refresh the out-of-band feedback pointers of every recurrent kernel.
    ///
    /// Called at the tail of every optimizer pass; a recurrence register
    /// replaced during the pass is chased to its live replacement here.
    pub fn fix_recurrences(&mut self) {
        let recurrent: Vec<(KernelId, RegisterId)> = self
            .kernels
            .iter()
            .filter(|k| !k.is_dead)
            .filter_map(|k| match k.kind {
                KernelKind::Recurrent {
                    recurrence: Some(r),
                } => Some((k.id, r)),
                _ => None,
            })
            .collect();
        for (k, r) in recurrent {
            let replacement = self.find_stolen_output(r);
            assert!(
                self.register_is_live(replacement),
                "recurrence of '{}' resolved to dead register {replacement}",
                self.kernel(k).debug_name()
            );
            if let KernelKind::Recurrent { recurrence } = &mut self.kernel_mut(k).kind {
                *recurrence = Some(replacement);
            }
        }
    }

    // ------------------------------------------------------------------
    // Rewrite primitives
    // ------------------------------------------------------------------

    /// Move every sink of `old` onto `new`: each consumer's input slot is
    /// rewritten to `new` and the sink entry transfers. Records the rename
    /// `old -> new`.
    pub fn steal_sinks_from(&mut self, new: RegisterId, old: RegisterId) {
        if new == old {
            return;
        }
        let moved = std::mem::take(&mut self.register_mut(old).sinks);
        for &(consumer, position) in &moved {
            self.kernel_mut(consumer).inputs[position] = new;
        }
        self.register_mut(new).sinks.extend(moved);
        self.stolen_outputs.insert(old, new);
    }

    /// OR the probe flag of `old` into `new`; copy the name if `new` has none
    pub fn steal_probe_and_name_from(&mut self, new: RegisterId, old: RegisterId) {
        if new == old {
            return;
        }
        let (probed, name) = {
            let old_reg = self.register(old);
            (old_reg.probed, old_reg.name.clone())
        };
        let new_reg = self.register_mut(new);
        new_reg.probed |= probed;
        if new_reg.name.is_none() {
            new_reg.name = name;
        }
    }

    /// `this` adopts output register `donor` into slot `slot`, abandoning
    /// whatever register currently occupies the slot. The abandoned
    /// register's sinks and probe state transfer to the adopted one first,
    /// and the rename `abandoned -> donor` is recorded.
    fn adopt_output(&mut self, this: KernelId, slot: usize, donor: RegisterId) {
        let abandoned = self.kernel(this).outputs[slot];
        if abandoned == donor {
            return;
        }
        assert_eq!(
            self.register(abandoned).field_type,
            self.register(donor).field_type,
            "output stealing changes the type of slot {slot} of '{}'",
            self.kernel(this).debug_name()
        );
        self.steal_sinks_from(donor, abandoned);
        self.steal_probe_and_name_from(donor, abandoned);
        self.register_mut(donor).source = this;
        self.kernel_mut(this).outputs[slot] = donor;
        self.stolen_outputs.insert(abandoned, donor);
    }

    /// `this` takes over every output register of `other`, slot by slot,
    /// then `other` is removed from the circuit.
    ///
    /// Consumers of `other`'s registers are untouched (the registers keep
    /// their identity, only their source changes); consumers of `this`'s
    /// abandoned registers are rewired onto the adopted ones. Output types
    /// must agree slot-for-slot.
    pub fn steal_outputs_from(&mut self, this: KernelId, other: KernelId) {
        assert!(
            !self.kernel(this).is_dead && !self.kernel(other).is_dead,
            "output stealing between dead kernels: '{}' <- '{}'",
            self.kernel(this).debug_name(),
            self.kernel(other).debug_name()
        );
        assert_eq!(
            self.kernel(this).outputs.len(),
            self.kernel(other).outputs.len(),
            "output count mismatch: '{}' <- '{}'",
            self.kernel(this).debug_name(),
            self.kernel(other).debug_name()
        );
        let donors = self.kernel(other).outputs.clone();
        for (slot, donor) in donors.into_iter().enumerate() {
            self.adopt_output(this, slot, donor);
        }
        self.kernel_mut(other).outputs.clear();
        self.remove_from_circuit(other, true, false)
            .unwrap_or_else(|_| {
                panic!(
                    "removal after output stealing failed for '{}'",
                    self.kernel(other).debug_name()
                )
            });
    }

    /// Remove a kernel: mark it dead and unlink it from the sinks of its
    /// inputs.
    ///
    /// Without `must_do`, every output must be sink-free and unprobed. With
    /// `recursive`, inputs that become useless danglers are removed too.
    pub fn remove_from_circuit(
        &mut self,
        k: KernelId,
        must_do: bool,
        recursive: bool,
    ) -> CircuitResult<()> {
        if self.kernel(k).is_dead {
            return Err(CircuitError::DeadKernel(self.kernel(k).debug_name()));
        }
        if !must_do {
            let removable = self.kernel(k).outputs.iter().all(|&r| {
                let reg = self.register(r);
                reg.sinks.is_empty() && !reg.probed
            });
            if !removable {
                return Err(CircuitError::RemoveWithLiveSinks(
                    self.kernel(k).debug_name(),
                ));
            }
        }
        self.kernel_mut(k).is_dead = true;
        let inputs = self.kernel(k).inputs.clone();
        for (position, r) in inputs.iter().enumerate() {
            let sinks = &mut self.register_mut(*r).sinks;
            if let Some(found) = sinks.iter().position(|&s| s == (k, position)) {
                sinks.remove(found);
            }
        }
        if recursive {
            let mut producers: Vec<KernelId> =
                inputs.iter().map(|&r| self.register(r).source).collect();
            producers.dedup();
            for p in producers {
                let kernel = self.kernel(p);
                if kernel.is_dead || !self.kind_is_droppable(p) {
                    continue;
                }
                let dangling = kernel.outputs.iter().all(|&r| {
                    let reg = self.register(r);
                    reg.sinks.is_empty() && !reg.probed
                });
                if dangling {
                    self.remove_from_circuit(p, false, true)?;
                }
            }
        }
        Ok(())
    }

    /// Only device and constant-field kernels are safe to drop; user CPU
    /// kernels may have side effects and recurrent kernels carry state.
    pub fn kind_is_droppable(&self, k: KernelId) -> bool {
        matches!(
            self.kernel(k).kind,
            KernelKind::Device | KernelKind::ConstantField
        )
    }

    // ------------------------------------------------------------------
    // Hyperkernel helpers
    // ------------------------------------------------------------------

    /// Rebuild a hyperkernel whose input list mentions the same register
    /// twice: the duplicates are coalesced and the opcode gains a local
    /// operand remapping. Outputs and probes transfer to the replacement.
    pub fn remove_redundant_inputs(&mut self, k: KernelId) -> CircuitResult<KernelId> {
        if !self.kernel(k).is_hyper() {
            return Err(CircuitError::NotHyperKernel(self.kernel(k).debug_name()));
        }
        let inputs = self.kernel(k).inputs.clone();
        let mut unique = Vec::new();
        let mut compact = Vec::with_capacity(inputs.len());
        for r in &inputs {
            match unique.iter().position(|u| u == r) {
                Some(existing) => compact.push(existing),
                None => {
                    unique.push(*r);
                    compact.push(unique.len() - 1);
                }
            }
        }
        // Compose with an existing remap rather than nesting two layers
        let opcode = match self.kernel(k).opcode.clone() {
            Opcode::Remapped { inner, map } => Opcode::Remapped {
                inner,
                map: map.into_iter().map(|j| compact[j]).collect(),
            },
            other => Opcode::Remapped {
                inner: Box::new(other),
                map: compact,
            },
        };
        let output_types: Vec<FieldType> = self
            .kernel(k)
            .outputs
            .iter()
            .map(|&r| self.register(r).field_type.clone())
            .collect();
        let replacement = self.add_kernel(KernelKind::Device, opcode, &unique, output_types)?;
        self.steal_outputs_from(replacement, k);
        Ok(replacement)
    }

    /// Find an input producer that can be vertically merged into `sink`:
    /// a live hyperkernel all of whose outputs are unprobed and consumed
    /// only by `sink`, and whose opcode the device accepts for fusion.
    pub fn find_mergeable_input(
        &self,
        sink: KernelId,
        is_mergeable: impl Fn(&Opcode, &Opcode) -> bool,
    ) -> Option<KernelId> {
        let kernel = self.kernel(sink);
        if kernel.is_dead || !kernel.is_hyper() {
            return None;
        }
        let mut candidates = kernel.inputs.clone();
        candidates.dedup();
        for r in candidates {
            let source = self.register(r).source;
            if source == sink {
                continue;
            }
            let producer = self.kernel(source);
            if producer.is_dead || !producer.is_hyper() {
                continue;
            }
            let captive = producer.outputs.iter().all(|&out| {
                let reg = self.register(out);
                !reg.probed && reg.sinks.iter().all(|&(consumer, _)| consumer == sink)
            });
            if captive && is_mergeable(&kernel.opcode, &producer.opcode) {
                return Some(source);
            }
        }
        None
    }

    /// Vertically merge `source` into `sink`, producing a fresh kernel whose
    /// opcode is the composition of both. The fused kernel's inputs are the
    /// sink's inputs minus the source's outputs, followed by the source's
    /// inputs; its outputs reproduce the sink's outputs exactly.
    ///
    /// Preconditions: both are live hyperkernels and every output of
    /// `source` is unprobed and consumed only by `sink`.
    pub fn do_merge(&mut self, sink: KernelId, source: KernelId) -> CircuitResult<KernelId> {
        for k in [sink, source] {
            if self.kernel(k).is_dead {
                return Err(CircuitError::DeadKernel(self.kernel(k).debug_name()));
            }
            if !self.kernel(k).is_hyper() {
                return Err(CircuitError::NotHyperKernel(self.kernel(k).debug_name()));
            }
        }
        let source_outputs = self.kernel(source).outputs.clone();
        let captive = source_outputs.iter().all(|&out| {
            let reg = self.register(out);
            !reg.probed && reg.sinks.iter().all(|&(consumer, _)| consumer == sink)
        });
        if !captive {
            return Err(CircuitError::RemoveWithLiveSinks(
                self.kernel(source).debug_name(),
            ));
        }

        let sink_inputs = self.kernel(sink).inputs.clone();
        let mut carried = Vec::new();
        let mut wiring = Vec::with_capacity(sink_inputs.len());
        for r in &sink_inputs {
            match source_outputs.iter().position(|out| out == r) {
                Some(o) => wiring.push(super::MergedOperand::Fused(o)),
                None => {
                    carried.push(*r);
                    wiring.push(super::MergedOperand::Carried(carried.len() - 1));
                }
            }
        }
        let mut merged_inputs = carried;
        merged_inputs.extend_from_slice(&self.kernel(source).inputs.clone());

        let opcode = Opcode::Merged {
            sink: Box::new(self.kernel(sink).opcode.clone()),
            source: Box::new(self.kernel(source).opcode.clone()),
            wiring,
        };
        let output_types: Vec<FieldType> = self
            .kernel(sink)
            .outputs
            .iter()
            .map(|&r| self.register(r).field_type.clone())
            .collect();
        let merged = self.add_kernel(KernelKind::Device, opcode, &merged_inputs, output_types)?;
        // Killing the sink detaches it from the source's outputs, leaving
        // the source a dangler that can be removed without force.
        self.steal_outputs_from(merged, sink);
        self.remove_from_circuit(source, false, false)?;
        Ok(merged)
    }

    /// Horizontally merge two sibling hyperkernels reading identical input
    /// lists into one kernel producing both output sets.
    pub fn do_multi_output_merge(&mut self, a: KernelId, b: KernelId) -> CircuitResult<KernelId> {
        for k in [a, b] {
            if self.kernel(k).is_dead {
                return Err(CircuitError::DeadKernel(self.kernel(k).debug_name()));
            }
            if !self.kernel(k).is_hyper() {
                return Err(CircuitError::NotHyperKernel(self.kernel(k).debug_name()));
            }
        }
        assert_eq!(
            self.kernel(a).inputs,
            self.kernel(b).inputs,
            "multi-output merge of '{}' and '{}' with differing inputs",
            self.kernel(a).debug_name(),
            self.kernel(b).debug_name()
        );
        let inputs = self.kernel(a).inputs.clone();
        let opcode = Opcode::MergedMultiOutput {
            a: Box::new(self.kernel(a).opcode.clone()),
            b: Box::new(self.kernel(b).opcode.clone()),
        };
        let a_outputs = self.kernel(a).outputs.clone();
        let b_outputs = self.kernel(b).outputs.clone();
        let output_types: Vec<FieldType> = a_outputs
            .iter()
            .chain(&b_outputs)
            .map(|&r| self.register(r).field_type.clone())
            .collect();
        let merged = self.add_kernel(KernelKind::Device, opcode, &inputs, output_types)?;
        for (slot, donor) in a_outputs.iter().chain(&b_outputs).enumerate() {
            self.adopt_output(merged, slot, *donor);
        }
        self.kernel_mut(a).outputs.clear();
        self.kernel_mut(b).outputs.clear();
        self.remove_from_circuit(a, true, false)?;
        self.remove_from_circuit(b, true, false)?;
        Ok(merged)
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Check the structural invariants of the circuit.
    ///
    /// Verifies acyclicity, sink consistency in both directions, that no
    /// dead kernel is reachable from a live one, and that every recurrence
    /// register is live. Passes call this under `debug_assert!`; tests call
    /// it after every pass.
    pub fn validate(&self) -> CircuitResult<()> {
        // Sink consistency, liveness of inputs, recurrences
        for kernel in self.kernels.iter().filter(|k| !k.is_dead) {
            for (position, &r) in kernel.inputs.iter().enumerate() {
                if !self.register_is_live(r) {
                    return Err(CircuitError::DeadKernel(format!(
                        "input {position} of '{}' is a dead register",
                        kernel.debug_name()
                    )));
                }
                let hits = self
                    .register(r)
                    .sinks
                    .iter()
                    .filter(|&&s| s == (kernel.id, position))
                    .count();
                if hits != 1 {
                    return Err(CircuitError::RemoveWithLiveSinks(format!(
                        "sink entry ({}, {position}) occurs {hits} times on {r}",
                        kernel.debug_name()
                    )));
                }
            }
            for &r in &kernel.outputs {
                let reg = self.register(r);
                if reg.source != kernel.id {
                    return Err(CircuitError::RemoveWithLiveSinks(format!(
                        "output {r} of '{}' does not point back at it",
                        kernel.debug_name()
                    )));
                }
                for &(consumer, position) in &reg.sinks {
                    let c = self.kernel(consumer);
                    if c.is_dead {
                        return Err(CircuitError::DeadKernel(format!(
                            "dead kernel '{}' still sinks {r}",
                            c.debug_name()
                        )));
                    }
                    if c.inputs.get(position) != Some(&r) {
                        return Err(CircuitError::RemoveWithLiveSinks(format!(
                            "sink ({}, {position}) of {r} reads another register",
                            c.debug_name()
                        )));
                    }
                }
            }
            if let KernelKind::Recurrent {
                recurrence: Some(r),
            } = kernel.kind
            {
                if !self.register_is_live(r) {
                    return Err(CircuitError::DeadKernel(format!(
                        "recurrence of '{}' is dead",
                        kernel.debug_name()
                    )));
                }
            }
        }
        // Acyclicity
        let mut state: HashMap<KernelId, u8> = HashMap::new();
        for kernel in self.kernels.iter().filter(|k| !k.is_dead) {
            self.check_acyclic(kernel.id, &mut state)?;
        }
        Ok(())
    }

    fn check_acyclic(&self, k: KernelId, state: &mut HashMap<KernelId, u8>) -> CircuitResult<()> {
        match state.get(&k) {
            Some(2) => return Ok(()),
            Some(1) => return Err(CircuitError::Cycle(self.kernel(k).debug_name())),
            _ => {}
        }
        state.insert(k, 1);
        for &r in &self.kernel(k).inputs {
            self.check_acyclic(self.register(r).source, state)?;
        }
        state.insert(k, 2);
        Ok(())
    }
}

impl fmt::Display for KernelCircuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "KernelCircuit ({} live kernels)", self.size())?;
        for k in self.flatten_preorder() {
            let kernel = self.kernel(k);
            write!(f, "  {} <- [", kernel.debug_name())?;
            for (i, &r) in kernel.inputs.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{r}")?;
            }
            write!(f, "] -> [")?;
            for (i, &r) in kernel.outputs.iter().enumerate() {
                let reg = self.register(r);
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{r}:{}", reg.field_type)?;
                if reg.probed {
                    write!(f, " probed")?;
                }
                if let Some(name) = &reg.name {
                    write!(f, " '{name}'")?;
                }
            }
            writeln!(f, "]")?;
        }
        Ok(())
    }
}
