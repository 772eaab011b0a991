//! Reverse-mode automatic differentiation on a recording tape.
//!
//! Every arithmetic operation on a [TapeVar] appends a node to its [Tape].
//! A single call to [Tape::backward] then yields the derivative of one output
//! with respect to every recorded node, at the cost of one sweep over the tape.
//!
//! ```
//! use flowmc::domains::{float::Real, tape::Tape};
//!
//! let tape = Tape::new();
//! let x = tape.var(3.0);
//! let y = tape.var(5.0);
//! let z = x * y + x.log();
//! let adjoints = tape.backward(z);
//! assert_eq!(adjoints[x.index()], 5.0 + 1.0 / 3.0);
//! assert_eq!(adjoints[y.index()], 3.0);
//! ```

use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::ops::{Add, Div, Mul, Neg, Sub};

use super::float::{NumericalFloatLike, Real};

#[derive(Debug, Clone, Copy)]
enum Op {
    Leaf,
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Div(usize, usize),
    Neg(usize),
    /// `a + constant`
    Shift(usize),
    /// `a * constant`
    Scale(usize, f64),
    Ln(usize),
    Exp(usize),
    Sqrt(usize),
    Abs(usize),
}

#[derive(Debug, Clone, Copy)]
struct Node {
    value: f64,
    op: Op,
}

/// A recording of operations on [TapeVar]s.
///
/// The tape uses interior mutability so that variables can be freely copied
/// and combined with operators. Clear it with [Tape::clear] to reuse the allocation.
#[derive(Default)]
pub struct Tape {
    nodes: RefCell<Vec<Node>>,
}

impl Debug for Tape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tape({} nodes)", self.len())
    }
}

impl Tape {
    pub fn new() -> Tape {
        Tape::default()
    }

    pub fn with_capacity(capacity: usize) -> Tape {
        Tape {
            nodes: RefCell::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all nodes. Requires that no variables of the previous recording are alive.
    pub fn clear(&mut self) {
        self.nodes.get_mut().clear();
    }

    /// Record an independent variable.
    pub fn var(&self, value: f64) -> TapeVar<'_> {
        self.push(value, Op::Leaf)
    }

    /// Record a constant. Constants are leaves whose adjoint is simply ignored.
    pub fn constant(&self, value: f64) -> TapeVar<'_> {
        self.push(value, Op::Leaf)
    }

    #[inline]
    fn push(&self, value: f64, op: Op) -> TapeVar<'_> {
        let mut nodes = self.nodes.borrow_mut();
        let index = nodes.len();
        nodes.push(Node { value, op });
        TapeVar {
            tape: self,
            index,
            value,
        }
    }

    /// Compute the derivative of `output` with respect to every node on the tape.
    /// The result is indexed by [TapeVar::index].
    pub fn backward(&self, output: TapeVar<'_>) -> Vec<f64> {
        debug_assert!(std::ptr::eq(output.tape, self));

        let nodes = self.nodes.borrow();
        let mut adjoints = vec![0.; nodes.len()];
        adjoints[output.index] = 1.;

        for i in (0..=output.index).rev() {
            let adj = adjoints[i];
            if adj == 0. {
                continue;
            }

            match nodes[i].op {
                Op::Leaf => {}
                Op::Add(a, b) => {
                    adjoints[a] += adj;
                    adjoints[b] += adj;
                }
                Op::Sub(a, b) => {
                    adjoints[a] += adj;
                    adjoints[b] -= adj;
                }
                Op::Mul(a, b) => {
                    adjoints[a] += adj * nodes[b].value;
                    adjoints[b] += adj * nodes[a].value;
                }
                Op::Div(a, b) => {
                    let vb = nodes[b].value;
                    adjoints[a] += adj / vb;
                    adjoints[b] -= adj * nodes[i].value / vb;
                }
                Op::Neg(a) => adjoints[a] -= adj,
                Op::Shift(a) => adjoints[a] += adj,
                Op::Scale(a, c) => adjoints[a] += adj * c,
                Op::Ln(a) => adjoints[a] += adj / nodes[a].value,
                Op::Exp(a) => adjoints[a] += adj * nodes[i].value,
                Op::Sqrt(a) => adjoints[a] += adj * 0.5 / nodes[i].value,
                Op::Abs(a) => {
                    if nodes[a].value >= 0. {
                        adjoints[a] += adj;
                    } else {
                        adjoints[a] -= adj;
                    }
                }
            }
        }

        adjoints
    }
}

/// A variable on a [Tape]. Copying is cheap; every operation records a new node.
#[derive(Clone, Copy)]
pub struct TapeVar<'t> {
    tape: &'t Tape,
    index: usize,
    value: f64,
}

impl Debug for TapeVar<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TapeVar(#{}: {})", self.index, self.value)
    }
}

impl<'t> TapeVar<'t> {
    /// The position of this variable on the tape, used to look up its adjoint.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    #[inline]
    fn unary(self, value: f64, op: Op) -> TapeVar<'t> {
        self.tape.push(value, op)
    }
}

impl<'t> Add for TapeVar<'t> {
    type Output = TapeVar<'t>;

    #[inline]
    fn add(self, rhs: Self) -> Self::Output {
        self.unary(self.value + rhs.value, Op::Add(self.index, rhs.index))
    }
}

impl<'t> Sub for TapeVar<'t> {
    type Output = TapeVar<'t>;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.unary(self.value - rhs.value, Op::Sub(self.index, rhs.index))
    }
}

impl<'t> Mul for TapeVar<'t> {
    type Output = TapeVar<'t>;

    #[inline]
    fn mul(self, rhs: Self) -> Self::Output {
        self.unary(self.value * rhs.value, Op::Mul(self.index, rhs.index))
    }
}

impl<'t> Div for TapeVar<'t> {
    type Output = TapeVar<'t>;

    #[inline]
    fn div(self, rhs: Self) -> Self::Output {
        self.unary(self.value / rhs.value, Op::Div(self.index, rhs.index))
    }
}

impl<'t> Neg for TapeVar<'t> {
    type Output = TapeVar<'t>;

    #[inline]
    fn neg(self) -> Self::Output {
        self.unary(-self.value, Op::Neg(self.index))
    }
}

impl<'t> Add<f64> for TapeVar<'t> {
    type Output = TapeVar<'t>;

    #[inline]
    fn add(self, rhs: f64) -> Self::Output {
        self.unary(self.value + rhs, Op::Shift(self.index))
    }
}

impl<'t> Sub<f64> for TapeVar<'t> {
    type Output = TapeVar<'t>;

    #[inline]
    fn sub(self, rhs: f64) -> Self::Output {
        self.unary(self.value - rhs, Op::Shift(self.index))
    }
}

impl<'t> Mul<f64> for TapeVar<'t> {
    type Output = TapeVar<'t>;

    #[inline]
    fn mul(self, rhs: f64) -> Self::Output {
        self.unary(self.value * rhs, Op::Scale(self.index, rhs))
    }
}

impl<'t> Div<f64> for TapeVar<'t> {
    type Output = TapeVar<'t>;

    #[inline]
    fn div(self, rhs: f64) -> Self::Output {
        self.unary(self.value / rhs, Op::Scale(self.index, rhs.recip()))
    }
}

impl NumericalFloatLike for TapeVar<'_> {
    #[inline]
    fn mul_add(&self, a: &Self, b: &Self) -> Self {
        *self * *a + *b
    }

    #[inline]
    fn zero(&self) -> Self {
        self.tape.constant(0.)
    }

    #[inline]
    fn one(&self) -> Self {
        self.tape.constant(1.)
    }

    #[inline]
    fn inv(&self) -> Self {
        self.one() / *self
    }

    #[inline]
    fn from_f64(&self, a: f64) -> Self {
        self.tape.constant(a)
    }

    #[inline]
    fn from_usize(&self, a: usize) -> Self {
        self.tape.constant(a as f64)
    }

    #[inline]
    fn to_f64(&self) -> f64 {
        self.value
    }
}

impl Real for TapeVar<'_> {
    #[inline]
    fn norm(&self) -> Self {
        self.unary(self.value.abs(), Op::Abs(self.index))
    }

    #[inline]
    fn sqrt(&self) -> Self {
        self.unary(self.value.sqrt(), Op::Sqrt(self.index))
    }

    #[inline]
    fn log(&self) -> Self {
        self.unary(self.value.ln(), Op::Ln(self.index))
    }

    #[inline]
    fn exp(&self) -> Self {
        self.unary(self.value.exp(), Op::Exp(self.index))
    }
}
