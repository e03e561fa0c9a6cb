//! # Reference Executor
//!
//! A deterministic CPU interpreter for kernel circuits. It exists to pin
//! down the semantics the optimizer must preserve: the test suite runs a
//! circuit before and after optimization and compares every probed value.
//!
//! Fields are evaluated as flat `f32` buffers in plane-major order: the
//! value of tensor plane `p` at field point `i` lives at `p * field_points
//! + i`. Only `Float32` fields are supported; convolution and opaque user
//! kernels are not interpreted (their circuits are checked structurally
//! instead).
//!
//! Recurrent kernels hold per-executor state, initialized to zero and
//! advanced once per [`ReferenceExecutor::step`] from their feedback
//! register.

use std::collections::HashMap;

use crate::error::{CircuitError, CircuitResult};
use crate::ir::{
    ElementType, FieldType, KernelCircuit, KernelId, KernelKind, MergedOperand, Opcode, ReduceOp,
    RegisterId,
};

/// Field value: type plus plane-major data
type Value = (FieldType, Vec<f32>);

pub struct ReferenceExecutor<'a> {
    circuit: &'a KernelCircuit,
    values: HashMap<RegisterId, Vec<f32>>,
    state: HashMap<KernelId, Vec<f32>>,
}

impl<'a> ReferenceExecutor<'a> {
    pub fn new(circuit: &'a KernelCircuit) -> CircuitResult<Self> {
        circuit.validate()?;
        let mut state = HashMap::new();
        for k in circuit.flatten() {
            let kernel = circuit.kernel(k);
            if matches!(kernel.kind(), KernelKind::Recurrent { .. }) {
                let ty = circuit.register(kernel.outputs()[0]).field_type();
                state.insert(k, vec![0.0; ty.points()]);
            }
        }
        Ok(ReferenceExecutor {
            circuit,
            values: HashMap::new(),
            state,
        })
    }

    /// Kernels in dependency order: producers strictly before consumers
    fn topological_order(&self) -> Vec<KernelId> {
        fn visit(
            circuit: &KernelCircuit,
            k: KernelId,
            done: &mut HashMap<KernelId, bool>,
            order: &mut Vec<KernelId>,
        ) {
            if done.contains_key(&k) {
                return;
            }
            done.insert(k, false);
            for &r in circuit.kernel(k).inputs() {
                visit(circuit, circuit.register(r).source(), done, order);
            }
            done.insert(k, true);
            order.push(k);
        }
        let mut order = Vec::new();
        let mut done = HashMap::new();
        for k in self.circuit.flatten() {
            visit(self.circuit, k, &mut done, &mut order);
        }
        order
    }

    /// Evaluate every kernel once, then advance recurrent state
    pub fn step(&mut self) -> CircuitResult<()> {
        for k in self.topological_order() {
            let kernel = self.circuit.kernel(k);
            let outputs: Vec<Value> = match kernel.kind() {
                KernelKind::ConstantField => {
                    let ty = self
                        .circuit
                        .register(kernel.outputs()[0])
                        .field_type()
                        .clone();
                    let data = match kernel.opcode() {
                        Opcode::ConstantField { values } => {
                            values.iter().map(|v| v.0).collect()
                        }
                        other => {
                            return Err(CircuitError::UnsupportedOpcode(other.name()));
                        }
                    };
                    vec![(ty, data)]
                }
                KernelKind::Recurrent { .. } => {
                    let ty = self
                        .circuit
                        .register(kernel.outputs()[0])
                        .field_type()
                        .clone();
                    vec![(ty, self.state[&k].clone())]
                }
                _ => {
                    let operands: Vec<Value> = kernel
                        .inputs()
                        .iter()
                        .map(|&r| {
                            let reg = self.circuit.register(r);
                            (reg.field_type().clone(), self.values[&r].clone())
                        })
                        .collect();
                    eval_opcode(kernel.opcode(), &operands)?
                }
            };
            assert_eq!(
                outputs.len(),
                kernel.outputs().len(),
                "evaluation of '{}' produced the wrong output count",
                kernel.debug_name()
            );
            for (&r, (_, data)) in kernel.outputs().iter().zip(outputs) {
                self.values.insert(r, data);
            }
        }
        let recurrent: Vec<(KernelId, RegisterId)> = self
            .circuit
            .flatten()
            .into_iter()
            .filter_map(|k| match self.circuit.kernel(k).kind() {
                KernelKind::Recurrent {
                    recurrence: Some(r),
                } => Some((k, *r)),
                _ => None,
            })
            .collect();
        for (k, r) in recurrent {
            let next = self
                .values
                .get(&r)
                .ok_or_else(|| {
                    CircuitError::RecurrenceUnset(self.circuit.kernel(k).debug_name())
                })?
                .clone();
            self.state.insert(k, next);
        }
        Ok(())
    }

    /// Run `steps` evaluation cycles
    pub fn run(&mut self, steps: usize) -> CircuitResult<()> {
        for _ in 0..steps {
            self.step()?;
        }
        Ok(())
    }

    /// Value of a register after the last step
    pub fn value(&self, r: RegisterId) -> Option<&[f32]> {
        self.values.get(&r).map(Vec::as_slice)
    }

    /// Value of the probed register with the given display name
    pub fn probed_value(&self, name: &str) -> Option<&[f32]> {
        self.circuit.flatten().into_iter().find_map(|k| {
            self.circuit
                .kernel(k)
                .outputs()
                .iter()
                .find(|&&r| {
                    let reg = self.circuit.register(r);
                    reg.probed() && reg.name() == Some(name)
                })
                .and_then(|&r| self.value(r))
        })
    }
}

fn float32_only(ty: &FieldType) -> CircuitResult<()> {
    if ty.element_type == ElementType::Float32 {
        Ok(())
    } else {
        Err(CircuitError::UnsupportedElementType(format!(
            "{:?}",
            ty.element_type
        )))
    }
}

/// Evaluate one opcode over typed operand buffers.
///
/// Returns one (type, data) pair per output. Merged opcodes recurse into
/// their components, reconstructing the absorbed producer's operand view
/// from the fused kernel's input list.
fn eval_opcode(opcode: &Opcode, operands: &[Value]) -> CircuitResult<Vec<Value>> {
    for (ty, _) in operands {
        float32_only(ty)?;
    }
    match opcode {
        Opcode::ConstantField { values } => Err(CircuitError::UnsupportedOpcode(format!(
            "nested constant of {} values",
            values.len()
        ))),
        Opcode::Recurrence => Err(CircuitError::UnsupportedOpcode("Recurrence".to_string())),
        Opcode::UserCpu { name } => {
            Err(CircuitError::UnsupportedOpcode(format!("UserCpu({name})")))
        }
        Opcode::Convolve(_) => Err(CircuitError::UnsupportedOpcode(opcode.name())),

        Opcode::Add => {
            let out = pointwise2(operands, |a, b| a + b)?;
            Ok(vec![out])
        }
        Opcode::Multiply => {
            let out = pointwise2(operands, |a, b| a * b)?;
            Ok(vec![out])
        }
        Opcode::AddConst { offset } => {
            let (ty, data) = &operands[0];
            Ok(vec![(ty.clone(), data.iter().map(|v| v + offset.0).collect())])
        }
        Opcode::MultiplyConst { factor } => {
            let (ty, data) = &operands[0];
            Ok(vec![(ty.clone(), data.iter().map(|v| v * factor.0).collect())])
        }

        Opcode::Flip => {
            let (ty, data) = &operands[0];
            let fp = ty.field_points();
            let mut out = data.clone();
            for plane in out.chunks_mut(fp) {
                plane.reverse();
            }
            Ok(vec![(ty.clone(), out)])
        }

        Opcode::Reshape { .. } => {
            let ty = opcode.output_type(&[operands[0].0.clone()])?;
            Ok(vec![(ty, operands[0].1.clone())])
        }

        Opcode::TensorReduce(params) => {
            let (ty, data) = &operands[0];
            let out_ty = opcode.output_type(&[ty.clone()])?;
            let fp = ty.field_points();
            let out_planes = ty.tensor_points() / params.factor;
            let mut out = Vec::with_capacity(out_planes * fp);
            for j in 0..out_planes {
                for i in 0..fp {
                    let mut acc = data[(j * params.factor) * fp + i];
                    for b in 1..params.factor {
                        let v = data[(j * params.factor + b) * fp + i];
                        acc = match params.op {
                            ReduceOp::Sum => acc + v,
                            ReduceOp::Min => acc.min(v),
                            ReduceOp::Max => acc.max(v),
                        };
                    }
                    out.push(acc);
                }
            }
            Ok(vec![(out_ty, out)])
        }

        Opcode::MatrixTranspose => {
            let (ty, data) = &operands[0];
            let out_ty = opcode.output_type(&[ty.clone()])?;
            let e = ty.field_shape.extents();
            let (rows, cols) = (e[0], e[1]);
            let fp = rows * cols;
            let mut out = vec![0.0; data.len()];
            for plane in 0..ty.tensor_points() {
                for r in 0..rows {
                    for c in 0..cols {
                        out[plane * fp + c * rows + r] = data[plane * fp + r * cols + c];
                    }
                }
            }
            Ok(vec![(out_ty, out)])
        }

        Opcode::MatrixTransform {
            transpose_in1,
            transpose_in2,
        } => {
            let out_ty = opcode.output_type(&[operands[0].0.clone(), operands[1].0.clone()])?;
            let (a_ty, a) = &operands[0];
            let (b_ty, b) = &operands[1];
            let ae = a_ty.field_shape.extents();
            let be = b_ty.field_shape.extents();
            let (m, kk) = if *transpose_in1 {
                (ae[1], ae[0])
            } else {
                (ae[0], ae[1])
            };
            let n = if *transpose_in2 { be[0] } else { be[1] };
            let a_at = |p: usize, i: usize, l: usize| {
                let fp = ae[0] * ae[1];
                if *transpose_in1 {
                    a[p * fp + l * ae[1] + i]
                } else {
                    a[p * fp + i * ae[1] + l]
                }
            };
            let b_at = |p: usize, l: usize, j: usize| {
                let fp = be[0] * be[1];
                if *transpose_in2 {
                    b[p * fp + j * be[1] + l]
                } else {
                    b[p * fp + l * be[1] + j]
                }
            };
            let planes = a_ty.tensor_points();
            let mut out = Vec::with_capacity(planes * m * n);
            for p in 0..planes {
                for i in 0..m {
                    for j in 0..n {
                        let mut acc = 0.0;
                        for l in 0..kk {
                            acc += a_at(p, i, l) * b_at(p, l, j);
                        }
                        out.push(acc);
                    }
                }
            }
            Ok(vec![(out_ty, out)])
        }

        Opcode::TensorSlice { index } => {
            let (ty, data) = &operands[0];
            let out_ty = opcode.output_type(&[ty.clone()])?;
            let last = ty.tensor_shape.last_extent().unwrap_or(1);
            let fp = ty.field_points();
            let out_planes = ty.tensor_points() / last;
            let mut out = Vec::with_capacity(out_planes * fp);
            for j in 0..out_planes {
                let plane = j * last + index;
                out.extend_from_slice(&data[plane * fp..(plane + 1) * fp]);
            }
            Ok(vec![(out_ty, out)])
        }

        Opcode::Remapped { inner, map } => {
            let view: Vec<Value> = map.iter().map(|&j| operands[j].clone()).collect();
            eval_opcode(inner, &view)
        }

        Opcode::Merged {
            sink,
            source,
            wiring,
        } => {
            let carried = wiring
                .iter()
                .filter(|w| matches!(w, MergedOperand::Carried(_)))
                .count();
            let source_outputs = eval_opcode(source, &operands[carried..])?;
            let sink_operands: Vec<Value> = wiring
                .iter()
                .map(|w| match *w {
                    MergedOperand::Carried(j) => operands[j].clone(),
                    MergedOperand::Fused(o) => source_outputs[o].clone(),
                })
                .collect();
            eval_opcode(sink, &sink_operands)
        }

        Opcode::MergedMultiOutput { a, b } => {
            let mut outputs = eval_opcode(a, operands)?;
            outputs.extend(eval_opcode(b, operands)?);
            Ok(outputs)
        }
    }
}

fn pointwise2(operands: &[Value], f: impl Fn(f32, f32) -> f32) -> CircuitResult<Value> {
    let (ty, a) = &operands[0];
    let (_, b) = &operands[1];
    Ok((ty.clone(), a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Shape;

    fn shape(extents: Vec<usize>) -> Shape {
        Shape::new(extents, Shape::MAX_FIELD_DIMENSIONS).unwrap()
    }

    #[test]
    fn flip_reshape_flip_relabels_indices() {
        // out(r, c) == 1 + 10r + c for a 100-point ramp
        let mut circuit = KernelCircuit::new();
        let ramp: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let input = circuit.constant(shape(vec![100]), &ramp).unwrap();
        let flipped = circuit.flip(input).unwrap();
        let grid = circuit
            .reshape(flipped, shape(vec![10, 10]), Shape::scalar())
            .unwrap();
        let reflipped = circuit.flip(grid).unwrap();
        let out = circuit.add_const(reflipped, 1.0).unwrap();
        circuit.probe(out, Some("out"));

        let mut exec = ReferenceExecutor::new(&circuit).unwrap();
        exec.step().unwrap();
        let values = exec.probed_value("out").unwrap();
        for r in 0..10 {
            for c in 0..10 {
                assert_eq!(values[r * 10 + c], (1 + 10 * r + c) as f32);
            }
        }
    }

    #[test]
    fn tensor_reduce_folds_consecutive_planes() {
        let mut circuit = KernelCircuit::new();
        let ty = FieldType::new(
            shape(vec![2]),
            Shape::new(vec![4], Shape::MAX_TENSOR_DIMENSIONS).unwrap(),
            ElementType::Float32,
        );
        // planes: [1,2], [3,4], [5,6], [7,8]
        let x = circuit
            .constant_typed(ty, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0])
            .unwrap();
        let sum = circuit.tensor_reduce(x, ReduceOp::Sum, 2).unwrap();
        circuit.probe(sum, Some("sum"));

        let mut exec = ReferenceExecutor::new(&circuit).unwrap();
        exec.step().unwrap();
        assert_eq!(exec.probed_value("sum").unwrap(), &[4.0, 6.0, 12.0, 14.0]);
    }

    #[test]
    fn matrix_transform_honors_transpose_flags() {
        let mut circuit = KernelCircuit::new();
        // A = [[1, 2], [3, 4]], B = [[5, 6], [7, 8]]
        let a = circuit
            .constant(shape(vec![2, 2]), &[1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let b = circuit
            .constant(shape(vec![2, 2]), &[5.0, 6.0, 7.0, 8.0])
            .unwrap();
        let plain = circuit.matrix_transform(a, b, false, false).unwrap();
        let left_t = circuit.matrix_transform(a, b, true, false).unwrap();
        circuit.probe(plain, Some("ab"));
        circuit.probe(left_t, Some("atb"));

        let mut exec = ReferenceExecutor::new(&circuit).unwrap();
        exec.step().unwrap();
        assert_eq!(exec.probed_value("ab").unwrap(), &[19.0, 22.0, 43.0, 50.0]);
        assert_eq!(exec.probed_value("atb").unwrap(), &[26.0, 30.0, 38.0, 44.0]);
    }

    #[test]
    fn merged_opcode_evaluates_like_the_chain() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(vec![4]), &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let doubled = circuit.multiply_const(a, 2.0).unwrap();
        let out = circuit.add(doubled, a).unwrap();
        circuit.probe(out, Some("out"));

        let sink = circuit.register(out).source();
        let source = circuit.register(doubled).source();
        circuit.do_merge(sink, source).unwrap();
        circuit.validate().unwrap();

        let mut exec = ReferenceExecutor::new(&circuit).unwrap();
        exec.step().unwrap();
        assert_eq!(exec.probed_value("out").unwrap(), &[3.0, 6.0, 9.0, 12.0]);
    }

    #[test]
    fn recurrence_accumulates_across_steps() {
        let mut circuit = KernelCircuit::new();
        let ty = FieldType::new(shape(vec![2]), Shape::scalar(), ElementType::Float32);
        let (state, state_out) = circuit.recurrence(ty).unwrap();
        let next = circuit.add_const(state_out, 1.0).unwrap();
        circuit.set_recurrence(state, next).unwrap();
        circuit.probe(state_out, Some("state"));

        let mut exec = ReferenceExecutor::new(&circuit).unwrap();
        exec.run(3).unwrap();
        // State lags the increment by one step
        assert_eq!(exec.probed_value("state").unwrap(), &[2.0, 2.0]);
    }

    #[test]
    fn user_cpu_kernels_are_not_interpreted() {
        let mut circuit = KernelCircuit::new();
        let a = circuit.constant(shape(vec![2]), &[1.0, 2.0]).unwrap();
        let ty = circuit.register(a).field_type().clone();
        circuit.user_cpu("opaque", &[a], ty).unwrap();
        let mut exec = ReferenceExecutor::new(&circuit).unwrap();
        // The constant producer evaluates fine; the failure must come from
        // the opaque kernel itself.
        match exec.step() {
            Err(CircuitError::UnsupportedOpcode(name)) => {
                assert!(name.contains("UserCpu"), "unexpected opcode: {name}");
            }
            other => panic!("expected an unsupported-opcode error, got {other:?}"),
        }
        assert_eq!(exec.value(a), Some([1.0, 2.0].as_slice()));
    }
}
