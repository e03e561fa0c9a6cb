//! Kernel-merging scenarios: vertical chains, horizontal siblings, and the
//! interaction of both under the driver's coupled fixed-point loop.

use fieldpipe::{
    CircuitOptimizer, DeviceParams, KernelCircuit, Opcode, OptimizerConfig, ReferenceExecutor,
    Shape,
};

fn shape(points: usize) -> Shape {
    Shape::new(vec![points], Shape::MAX_FIELD_DIMENSIONS).unwrap()
}

fn optimize(circuit: &mut KernelCircuit) -> usize {
    let config = OptimizerConfig::default();
    let device = DeviceParams::default();
    let n = CircuitOptimizer::new(&config, &device)
        .optimize(circuit)
        .unwrap();
    circuit.validate().unwrap();
    n
}

fn probed(circuit: &KernelCircuit, name: &str) -> Vec<f32> {
    let mut exec = ReferenceExecutor::new(circuit).unwrap();
    exec.step().unwrap();
    exec.probed_value(name).unwrap().to_vec()
}

#[test]
fn pointwise_pipeline_collapses_to_two_kernels() {
    let mut circuit = KernelCircuit::new();
    let a = circuit.constant(shape(4), &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let x = circuit.multiply_const(a, 2.0).unwrap();
    let y = circuit.add_const(x, 10.0).unwrap();
    let z = circuit.multiply_const(y, 0.5).unwrap();
    circuit.probe(z, Some("z"));
    assert_eq!(circuit.size(), 4);
    let before = probed(&circuit, "z");

    optimize(&mut circuit);
    assert_eq!(circuit.size(), 2);
    assert_eq!(probed(&circuit, "z"), before);
    assert_eq!(before, vec![6.0, 7.0, 8.0, 9.0]);
}

#[test]
fn merging_preserves_interior_probe() {
    let mut circuit = KernelCircuit::new();
    let a = circuit.constant(shape(4), &[1.0; 4]).unwrap();
    let x = circuit.multiply_const(a, 2.0).unwrap();
    circuit.probe(x, Some("x"));
    let y = circuit.add_const(x, 1.0).unwrap();
    circuit.probe(y, Some("y"));
    assert_eq!(circuit.size(), 3);

    optimize(&mut circuit);
    // The probed intermediate blocks vertical merging entirely
    assert_eq!(circuit.size(), 3);
    assert_eq!(probed(&circuit, "x"), vec![2.0; 4]);
    assert_eq!(probed(&circuit, "y"), vec![3.0; 4]);
}

#[test]
fn siblings_collapse_then_feed_one_consumer() {
    let mut circuit = KernelCircuit::new();
    let a = circuit.constant(shape(4), &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let doubled = circuit.multiply_const(a, 2.0).unwrap();
    let shifted = circuit.add_const(a, 1.0).unwrap();
    let out = circuit.multiply(doubled, shifted).unwrap();
    circuit.probe(out, Some("out"));
    assert_eq!(circuit.size(), 4);
    let before = probed(&circuit, "out");

    optimize(&mut circuit);
    // Horizontal merge shares the siblings, then the vertical merger folds
    // the shared kernel into its sole consumer.
    assert_eq!(circuit.size(), 2);
    assert_eq!(probed(&circuit, "out"), before);
    assert_eq!(before, vec![4.0, 12.0, 24.0, 40.0]);
}

#[test]
fn multi_output_kernel_keeps_both_probes() {
    let mut circuit = KernelCircuit::new();
    let a = circuit.constant(shape(2), &[3.0, 5.0]).unwrap();
    let x = circuit.multiply_const(a, 2.0).unwrap();
    let y = circuit.add_const(a, 1.0).unwrap();
    circuit.probe(x, Some("x"));
    circuit.probe(y, Some("y"));

    optimize(&mut circuit);
    assert_eq!(circuit.size(), 2);
    let live = circuit.find_stolen_output(x);
    let merged = circuit.register(live).source();
    assert!(matches!(
        circuit.kernel(merged).opcode(),
        Opcode::MergedMultiOutput { .. }
    ));
    assert_eq!(probed(&circuit, "x"), vec![6.0, 10.0]);
    assert_eq!(probed(&circuit, "y"), vec![4.0, 6.0]);
}

#[test]
fn diamond_collapses_completely() {
    // a -> (x2, x3) -> sum: horizontal then vertical merging leaves the
    // constant plus one fused kernel computing 5a.
    let mut circuit = KernelCircuit::new();
    let a = circuit.constant(shape(3), &[1.0, 2.0, 3.0]).unwrap();
    let x2 = circuit.multiply_const(a, 2.0).unwrap();
    let x3 = circuit.multiply_const(a, 3.0).unwrap();
    let sum = circuit.add(x2, x3).unwrap();
    circuit.probe(sum, Some("sum"));
    let before = probed(&circuit, "sum");

    optimize(&mut circuit);
    assert_eq!(circuit.size(), 2);
    assert_eq!(probed(&circuit, "sum"), before);
    assert_eq!(before, vec![5.0, 10.0, 15.0]);
}

#[test]
fn recurrence_pointer_survives_merging() {
    use fieldpipe::{ElementType, FieldType, KernelKind};

    let mut circuit = KernelCircuit::new();
    let ty = FieldType::new(shape(2), Shape::scalar(), ElementType::Float32);
    let (state, state_out) = circuit.recurrence(ty).unwrap();
    let x = circuit.multiply_const(state_out, 2.0).unwrap();
    let next = circuit.add_const(x, 1.0).unwrap();
    circuit.set_recurrence(state, next).unwrap();

    optimize(&mut circuit);
    circuit.validate().unwrap();
    let live = circuit
        .flatten()
        .into_iter()
        .find_map(|k| match circuit.kernel(k).kind() {
            KernelKind::Recurrent {
                recurrence: Some(r),
            } => Some(*r),
            _ => None,
        })
        .expect("recurrent kernel vanished");
    assert!(circuit.register_is_live(live));

    // state(n) = 2 * state(n-1) + 1: 0, 1, 3, 7
    let mut exec = ReferenceExecutor::new(&circuit).unwrap();
    exec.run(3).unwrap();
    assert_eq!(exec.value(live).unwrap(), &[7.0, 7.0]);
}
