//! Two-dimensional shapes of expression nodes.

use std::fmt;

/// Shape of a node value: every value is a dense `rows x cols` matrix stored row-major.
///
/// Scalars are `1x1`, state and parameter vectors are columns `n x 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    /// Create a new shape.
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// The `1x1` scalar shape.
    pub const fn scalar() -> Self {
        Self { rows: 1, cols: 1 }
    }

    /// Column vector shape `n x 1`.
    pub const fn column(n: usize) -> Self {
        Self { rows: n, cols: 1 }
    }

    /// Number of scalar entries.
    pub const fn numel(&self) -> usize {
        self.rows * self.cols
    }

    pub const fn is_scalar(&self) -> bool {
        self.rows == 1 && self.cols == 1
    }

    /// True when the shape holds no entries.
    pub const fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    pub const fn is_column(&self) -> bool {
        self.cols == 1
    }

    pub const fn transposed(&self) -> Self {
        Self {
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Dimensions in numr tensor order.
    pub fn dims(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    /// Shape of a numr tensor; 0-d and 1-d tensors are read as column vectors.
    pub fn from_dims(dims: &[usize]) -> Self {
        match dims {
            [] => Self::scalar(),
            [n] => Self::column(*n),
            [rows, cols] => Self::new(*rows, *cols),
            _ => Self::new(dims[0], dims[1..].iter().product()),
        }
    }

    /// Result shape of an elementwise operation.
    ///
    /// Equal shapes combine directly; a `1x1` operand pairs with any shape.
    /// Everything else is a mismatch.
    pub fn broadcast(&self, other: &Shape) -> Option<Shape> {
        if self == other {
            Some(*self)
        } else if self.is_scalar() {
            Some(*other)
        } else if other.is_scalar() {
            Some(*self)
        } else {
            None
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}
