//! Ergonomic circuit construction.
//!
//! The frontend (and the test suite) builds circuits through these helpers
//! instead of spelling out kernel kinds and output types by hand. Every
//! helper infers the output type from the opcode and returns the freshly
//! created kernel's first output register, which is how expression-style
//! construction chains naturally.

use super::{
    ConstParam, ElementType, FieldType, KernelCircuit, KernelId, KernelKind, Opcode, ReduceOp,
    RegisterId, Shape, TensorReduceParams,
};
use crate::error::CircuitResult;

impl KernelCircuit {
    fn unary(&mut self, opcode: Opcode, input: RegisterId) -> CircuitResult<RegisterId> {
        let ty = opcode.output_type(&[self.register(input).field_type().clone()])?;
        let k = self.add_kernel(KernelKind::Device, opcode, &[input], vec![ty])?;
        Ok(self.output_of(k, 0))
    }

    fn binary(
        &mut self,
        opcode: Opcode,
        in1: RegisterId,
        in2: RegisterId,
    ) -> CircuitResult<RegisterId> {
        let ty = opcode.output_type(&[
            self.register(in1).field_type().clone(),
            self.register(in2).field_type().clone(),
        ])?;
        let k = self.add_kernel(KernelKind::Device, opcode, &[in1, in2], vec![ty])?;
        Ok(self.output_of(k, 0))
    }

    /// A constant scalar field over `field_shape` with the given values,
    /// one per field point
    pub fn constant(&mut self, field_shape: Shape, values: &[f32]) -> CircuitResult<RegisterId> {
        let ty = FieldType::new(field_shape, Shape::scalar(), ElementType::Float32);
        self.constant_typed(ty, values)
    }

    /// A constant field of arbitrary type
    pub fn constant_typed(&mut self, ty: FieldType, values: &[f32]) -> CircuitResult<RegisterId> {
        let opcode = Opcode::ConstantField {
            values: values.iter().map(|&v| ConstParam::from(v)).collect(),
        };
        let k = self.add_kernel(KernelKind::ConstantField, opcode, &[], vec![ty])?;
        Ok(self.output_of(k, 0))
    }

    /// A recurrent kernel producing feedback state of type `ty`.
    ///
    /// The feedback register is attached later with
    /// [`KernelCircuit::set_recurrence`] once the producing kernel exists.
    pub fn recurrence(&mut self, ty: FieldType) -> CircuitResult<(KernelId, RegisterId)> {
        let k = self.add_kernel(
            KernelKind::Recurrent { recurrence: None },
            Opcode::Recurrence,
            &[],
            vec![ty],
        )?;
        Ok((k, self.output_of(k, 0)))
    }

    pub fn add(&mut self, a: RegisterId, b: RegisterId) -> CircuitResult<RegisterId> {
        self.binary(Opcode::Add, a, b)
    }

    pub fn multiply(&mut self, a: RegisterId, b: RegisterId) -> CircuitResult<RegisterId> {
        self.binary(Opcode::Multiply, a, b)
    }

    pub fn add_const(&mut self, a: RegisterId, offset: f32) -> CircuitResult<RegisterId> {
        self.unary(
            Opcode::AddConst {
                offset: offset.into(),
            },
            a,
        )
    }

    pub fn multiply_const(&mut self, a: RegisterId, factor: f32) -> CircuitResult<RegisterId> {
        self.unary(
            Opcode::MultiplyConst {
                factor: factor.into(),
            },
            a,
        )
    }

    pub fn flip(&mut self, a: RegisterId) -> CircuitResult<RegisterId> {
        self.unary(Opcode::Flip, a)
    }

    pub fn reshape(
        &mut self,
        a: RegisterId,
        field_shape: Shape,
        tensor_shape: Shape,
    ) -> CircuitResult<RegisterId> {
        self.unary(
            Opcode::Reshape {
                field_shape,
                tensor_shape,
            },
            a,
        )
    }

    pub fn tensor_reduce(
        &mut self,
        a: RegisterId,
        op: ReduceOp,
        factor: usize,
    ) -> CircuitResult<RegisterId> {
        self.unary(Opcode::TensorReduce(TensorReduceParams { op, factor }), a)
    }

    pub fn matrix_transpose(&mut self, a: RegisterId) -> CircuitResult<RegisterId> {
        self.unary(Opcode::MatrixTranspose, a)
    }

    pub fn matrix_transform(
        &mut self,
        a: RegisterId,
        b: RegisterId,
        transpose_in1: bool,
        transpose_in2: bool,
    ) -> CircuitResult<RegisterId> {
        self.binary(
            Opcode::MatrixTransform {
                transpose_in1,
                transpose_in2,
            },
            a,
            b,
        )
    }

    pub fn tensor_slice(&mut self, a: RegisterId, index: usize) -> CircuitResult<RegisterId> {
        self.unary(Opcode::TensorSlice { index }, a)
    }

    /// An opaque host kernel; never removed by the optimizer
    pub fn user_cpu(
        &mut self,
        name: &str,
        inputs: &[RegisterId],
        output_type: FieldType,
    ) -> CircuitResult<RegisterId> {
        let k = self.add_kernel(
            KernelKind::UserCpu,
            Opcode::UserCpu {
                name: name.to_string(),
            },
            inputs,
            vec![output_type],
        )?;
        Ok(self.output_of(k, 0))
    }
}
