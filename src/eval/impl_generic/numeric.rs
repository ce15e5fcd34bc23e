//! Numeric value domain over numr tensors.

use std::marker::PhantomData;
use std::sync::Arc;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::sweep;
use crate::client::DiffClient;
use crate::error::{DiffError, DiffResult};
use crate::eval::algebra::Algebra;
use crate::expr::{BinaryOp, CompareOp, Shape, UnaryOp};
use crate::function::Function;
use crate::integrate::impl_generic::{adjoint_outputs_impl, terminal_state_impl};
use crate::integrate::{AdjointSystem, OdeSystem};

/// Evaluates node rules with a numr client.
///
/// Every value is a 2-D `F64` tensor in row-major order.
pub(crate) struct NumericAlgebra<'a, R, C> {
    client: &'a C,
    _runtime: PhantomData<R>,
}

impl<'a, R, C> NumericAlgebra<'a, R, C>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    pub(crate) fn new(client: &'a C) -> Self {
        Self {
            client,
            _runtime: PhantomData,
        }
    }

    pub(crate) fn client(&self) -> &'a C {
        self.client
    }

    fn expand(&self, x: &Tensor<R>, shape: Shape) -> DiffResult<Tensor<R>> {
        if Shape::from_dims(x.shape()) == shape {
            return Ok(x.clone());
        }
        if shape.is_empty() {
            return Ok(Tensor::<R>::zeros(&shape.dims(), DType::F64, self.client.device()));
        }
        Ok(x.broadcast_to(&shape.dims())?.contiguous())
    }

    fn pair_shape(&self, op: &str, a: &Tensor<R>, b: &Tensor<R>) -> DiffResult<Shape> {
        let sa = Shape::from_dims(a.shape());
        let sb = Shape::from_dims(b.shape());
        sa.broadcast(&sb)
            .ok_or_else(|| DiffError::shape_mismatch(op, sa, sb))
    }

    fn concat(&self, parts: &[Tensor<R>], dim: isize) -> DiffResult<Tensor<R>> {
        let shapes: Vec<Shape> = parts.iter().map(|t| Shape::from_dims(t.shape())).collect();
        let Some(first) = shapes.first() else {
            return Err(DiffError::InvalidArgument {
                context: "concatenation of an empty list".to_string(),
            });
        };
        let shape = if dim == 0 {
            Shape::new(shapes.iter().map(|s| s.rows).sum(), first.cols)
        } else {
            Shape::new(first.rows, shapes.iter().map(|s| s.cols).sum())
        };
        let kept: Vec<&Tensor<R>> = parts
            .iter()
            .zip(&shapes)
            .filter(|(_, s)| !s.is_empty())
            .map(|(t, _)| t)
            .collect();
        match kept.len() {
            0 => Ok(Tensor::<R>::zeros(&shape.dims(), DType::F64, self.client.device())),
            1 => Ok(kept[0].clone()),
            _ => Ok(self.client.cat(&kept, dim)?),
        }
    }
}

impl<'a, R, C> Algebra for NumericAlgebra<'a, R, C>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    type Value = Tensor<R>;

    fn shape_of(&self, v: &Tensor<R>) -> DiffResult<Shape> {
        Ok(Shape::from_dims(v.shape()))
    }

    fn constant(&self, shape: Shape, values: &[f64]) -> DiffResult<Tensor<R>> {
        if values.len() != shape.numel() {
            return Err(DiffError::shape_mismatch(
                "constant",
                shape.numel(),
                values.len(),
            ));
        }
        Ok(Tensor::<R>::from_slice(
            values,
            &shape.dims(),
            self.client.device(),
        ))
    }

    fn full(&self, shape: Shape, value: f64) -> DiffResult<Tensor<R>> {
        Ok(Tensor::<R>::full_scalar(
            &shape.dims(),
            DType::F64,
            value,
            self.client.device(),
        ))
    }

    fn unary(&self, op: UnaryOp, x: &Tensor<R>) -> DiffResult<Tensor<R>> {
        let shape = Shape::from_dims(x.shape());
        if shape.is_empty() {
            return Ok(x.clone());
        }
        let c = self.client;
        let out = match op {
            UnaryOp::Neg => c.mul_scalar(x, -1.0)?,
            UnaryOp::Exp => c.exp(x)?,
            UnaryOp::Log => c.log(x)?,
            UnaryOp::Sin => c.sin(x)?,
            UnaryOp::Cos => c.cos(x)?,
            UnaryOp::Tan => c.tan(x)?,
            UnaryOp::Sqrt => c.sqrt(x)?,
            UnaryOp::Abs => c.abs(x)?,
            UnaryOp::Sign => {
                let zeros = self.zeros(shape)?;
                let ones = self.full(shape, 1.0)?;
                let minus = self.full(shape, -1.0)?;
                let negative = c.lt(x, &zeros)?;
                let positive = c.gt(x, &zeros)?;
                let lower = c.where_cond(&negative, &minus, &zeros)?;
                c.where_cond(&positive, &ones, &lower)?
            }
        };
        Ok(out)
    }

    fn binary(&self, op: BinaryOp, a: &Tensor<R>, b: &Tensor<R>) -> DiffResult<Tensor<R>> {
        let shape = self.pair_shape("elementwise", a, b)?;
        if shape.is_empty() {
            return self.zeros(shape);
        }
        let a = self.expand(a, shape)?;
        let b = self.expand(b, shape)?;
        let c = self.client;
        let out = match op {
            BinaryOp::Add => c.add(&a, &b)?,
            BinaryOp::Sub => c.sub(&a, &b)?,
            BinaryOp::Mul => c.mul(&a, &b)?,
            BinaryOp::Div => c.div(&a, &b)?,
        };
        Ok(out)
    }

    fn powi(&self, x: &Tensor<R>, n: i32) -> DiffResult<Tensor<R>> {
        let shape = Shape::from_dims(x.shape());
        if n == 0 {
            return self.full(shape, 1.0);
        }
        // Square-and-multiply keeps negative bases exact.
        let mut base = x.clone();
        let mut exponent = n.unsigned_abs();
        let mut acc: Option<Tensor<R>> = None;
        while exponent > 0 {
            if exponent & 1 == 1 {
                acc = Some(match acc {
                    None => base.clone(),
                    Some(a) => self.client.mul(&a, &base)?,
                });
            }
            exponent >>= 1;
            if exponent > 0 {
                base = self.client.mul(&base, &base)?;
            }
        }
        let positive = acc.unwrap_or_else(|| x.clone());
        if n < 0 {
            let ones = self.full(shape, 1.0)?;
            Ok(self.client.div(&ones, &positive)?)
        } else {
            Ok(positive)
        }
    }

    fn compare(&self, op: CompareOp, a: &Tensor<R>, b: &Tensor<R>) -> DiffResult<Tensor<R>> {
        let shape = self.pair_shape("compare", a, b)?;
        if shape.is_empty() {
            return self.zeros(shape);
        }
        let a = self.expand(a, shape)?;
        let b = self.expand(b, shape)?;
        let c = self.client;
        let mask = match op {
            CompareOp::Lt => c.lt(&a, &b)?,
            CompareOp::Le => c.le(&a, &b)?,
            CompareOp::Eq => c.eq(&a, &b)?,
        };
        let ones = self.full(shape, 1.0)?;
        let zeros = self.zeros(shape)?;
        Ok(c.where_cond(&mask, &ones, &zeros)?)
    }

    fn if_else(
        &self,
        cond: &Tensor<R>,
        if_true: &Tensor<R>,
        if_false: &Tensor<R>,
    ) -> DiffResult<Tensor<R>> {
        let branches = self.pair_shape("if_else", if_true, if_false)?;
        let sc = Shape::from_dims(cond.shape());
        let shape = branches
            .broadcast(&sc)
            .ok_or_else(|| DiffError::shape_mismatch("if_else condition", branches, sc))?;
        if shape.is_empty() {
            return self.zeros(shape);
        }
        let cond = self.expand(cond, shape)?;
        let if_true = self.expand(if_true, shape)?;
        let if_false = self.expand(if_false, shape)?;
        let zeros = self.zeros(shape)?;
        let is_zero = self.client.eq(&cond, &zeros)?;
        Ok(self.client.where_cond(&is_zero, &if_false, &if_true)?)
    }

    fn matmul(&self, a: &Tensor<R>, b: &Tensor<R>) -> DiffResult<Tensor<R>> {
        let sa = Shape::from_dims(a.shape());
        let sb = Shape::from_dims(b.shape());
        if sa.cols != sb.rows {
            return Err(DiffError::shape_mismatch("matmul", sa, sb));
        }
        let shape = Shape::new(sa.rows, sb.cols);
        if shape.is_empty() || sa.cols == 0 {
            return self.zeros(shape);
        }
        Ok(self.client.matmul(a, b)?)
    }

    fn transpose(&self, x: &Tensor<R>) -> DiffResult<Tensor<R>> {
        let shape = Shape::from_dims(x.shape());
        if shape.is_empty() {
            return self.zeros(shape.transposed());
        }
        if shape.rows == 1 || shape.cols == 1 {
            return Ok(x.contiguous().reshape(&shape.transposed().dims())?);
        }
        Ok(x.transpose(0, 1)?.contiguous())
    }

    fn reshape(&self, x: &Tensor<R>, shape: Shape) -> DiffResult<Tensor<R>> {
        let from = Shape::from_dims(x.shape());
        if from.numel() != shape.numel() {
            return Err(DiffError::shape_mismatch("reshape", from, shape));
        }
        if shape.is_empty() {
            return self.zeros(shape);
        }
        Ok(x.contiguous().reshape(&shape.dims())?)
    }

    fn vertcat(&self, parts: &[Tensor<R>]) -> DiffResult<Tensor<R>> {
        self.concat(parts, 0)
    }

    fn horzcat(&self, parts: &[Tensor<R>]) -> DiffResult<Tensor<R>> {
        self.concat(parts, 1)
    }

    fn slice(&self, x: &Tensor<R>, row: usize, col: usize, shape: Shape) -> DiffResult<Tensor<R>> {
        if shape.is_empty() {
            return self.zeros(shape);
        }
        let from = Shape::from_dims(x.shape());
        if from == shape {
            return Ok(x.clone());
        }
        Ok(x
            .narrow(0, row, shape.rows)?
            .narrow(1, col, shape.cols)?
            .contiguous())
    }

    fn embed(&self, x: &Tensor<R>, row: usize, col: usize, shape: Shape) -> DiffResult<Tensor<R>> {
        let inner = Shape::from_dims(x.shape());
        if row + inner.rows > shape.rows || col + inner.cols > shape.cols {
            return Err(DiffError::shape_mismatch("embed", shape, inner));
        }
        if inner == shape {
            return Ok(x.clone());
        }
        let left = self.zeros(Shape::new(inner.rows, col))?;
        let right = self.zeros(Shape::new(inner.rows, shape.cols - col - inner.cols))?;
        let band = self.horzcat(&[left, x.clone(), right])?;
        let top = self.zeros(Shape::new(row, shape.cols))?;
        let bottom = self.zeros(Shape::new(shape.rows - row - inner.rows, shape.cols))?;
        self.vertcat(&[top, band, bottom])
    }

    fn sum_all(&self, x: &Tensor<R>) -> DiffResult<Tensor<R>> {
        let shape = Shape::from_dims(x.shape());
        if shape.is_empty() {
            return self.zeros(Shape::scalar());
        }
        if shape.is_scalar() {
            return Ok(x.clone());
        }
        let total = self.client.sum(x, &[0, 1], true)?;
        Ok(total.contiguous().reshape(&[1, 1])?)
    }

    fn broadcast(&self, x: &Tensor<R>, shape: Shape) -> DiffResult<Tensor<R>> {
        self.expand(x, shape)
    }

    fn assertion(&self, x: &Tensor<R>, cond: &Tensor<R>, message: &str) -> DiffResult<Tensor<R>> {
        let values: Vec<f64> = cond.to_vec();
        if values.iter().any(|&v| v == 0.0) {
            return Err(DiffError::AssertionFailed {
                message: message.to_string(),
            });
        }
        Ok(x.clone())
    }

    fn call_function(&self, f: &Function, args: &[Tensor<R>]) -> DiffResult<Vec<Tensor<R>>> {
        sweep::evaluate(self, f.program(), args)
    }

    fn integrate(
        &self,
        system: &Arc<OdeSystem>,
        x0: &Tensor<R>,
        p: &Tensor<R>,
    ) -> DiffResult<Tensor<R>> {
        terminal_state_impl(self.client, system, x0, p)
    }

    fn integrate_adjoint(
        &self,
        system: &Arc<AdjointSystem>,
        args: &[Tensor<R>],
    ) -> DiffResult<Vec<Tensor<R>>> {
        adjoint_outputs_impl(self.client, system, args)
    }
}
