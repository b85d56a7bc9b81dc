//! Deferred expression trees over parameter values.
//!
//! A [`Call`] is a constant leaf, a parameter-value leaf holding the
//! arguments it will be invoked with, or an operator node. Building an
//! expression performs no evaluation; [`Call::realize`] walks the tree with
//! an explicit stack, invoking the leaves (and forwarding the observer so
//! time-dependent leaves register for refresh) and folding operator nodes
//! over their numeric operands. Failures surface as evaluation errors
//! carrying the offending sub-expression.

use std::fmt;
use std::ops;

use crate::datatype::{ParameterValue, Scalar};
use crate::error::{EntwineError, Result};
use crate::evaluate::CallArgs;
use crate::timeline::Observer;

// ------------- Operators -------------
#[derive(Clone, Copy)]
pub struct Op {
    pub symbol: &'static str,
    pub apply: fn(f64, f64) -> f64,
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Op({})", self.symbol)
    }
}

fn apply_add(a: f64, b: f64) -> f64 {
    a + b
}
fn apply_sub(a: f64, b: f64) -> f64 {
    a - b
}
fn apply_mul(a: f64, b: f64) -> f64 {
    a * b
}
fn apply_div(a: f64, b: f64) -> f64 {
    a / b
}
fn apply_min(a: f64, b: f64) -> f64 {
    a.min(b)
}
fn apply_max(a: f64, b: f64) -> f64 {
    a.max(b)
}

pub const ADD: Op = Op { symbol: "+", apply: apply_add };
pub const SUB: Op = Op { symbol: "-", apply: apply_sub };
pub const MUL: Op = Op { symbol: "*", apply: apply_mul };
pub const DIV: Op = Op { symbol: "/", apply: apply_div };
pub const MIN: Op = Op { symbol: "min", apply: apply_min };
pub const MAX: Op = Op { symbol: "max", apply: apply_max };

// ------------- Call -------------
#[derive(Debug, Clone)]
pub enum Call {
    Constant(Scalar),
    Parameter {
        name: String,
        value: ParameterValue,
        args: CallArgs,
    },
    Operation {
        op: Op,
        args: Vec<Call>,
    },
}

impl Call {
    pub fn constant(scalar: Scalar) -> Call {
        Call::Constant(scalar)
    }
    /// A leaf invoking `value` with `args` at realization time; `name` is
    /// only used when rendering the expression.
    pub fn parameter(name: &str, value: ParameterValue, args: CallArgs) -> Call {
        Call::Parameter {
            name: name.to_string(),
            value,
            args,
        }
    }
    pub fn operation(op: Op, args: Vec<Call>) -> Call {
        Call::Operation { op, args }
    }
    pub fn min(a: Call, b: Call) -> Call {
        Call::operation(MIN, vec![a, b])
    }
    pub fn max(a: Call, b: Call) -> Call {
        Call::operation(MAX, vec![a, b])
    }

    /// Post-order realization with an explicit stack: children first, then
    /// the operator fold. The observer reaches every leaf invocation.
    pub fn realize(&self, observer: Option<&Observer>) -> Result<ParameterValue> {
        enum Task<'a> {
            Enter(&'a Call),
            Exit(&'a Call),
        }
        let mut stack = vec![Task::Enter(self)];
        let mut results: Vec<ParameterValue> = Vec::new();
        while let Some(task) = stack.pop() {
            match task {
                Task::Enter(call) => match call {
                    Call::Constant(scalar) => results.push(ParameterValue::Scalar(scalar.clone())),
                    Call::Parameter { value, args, .. } => results.push(value.call(args, observer)),
                    Call::Operation { args, .. } => {
                        stack.push(Task::Exit(call));
                        for child in args.iter().rev() {
                            stack.push(Task::Enter(child));
                        }
                    }
                },
                Task::Exit(call) => {
                    let (op, children) = match call {
                        Call::Operation { op, args } => (op, args),
                        _ => unreachable!(),
                    };
                    let operands = results.split_off(results.len() - children.len());
                    let mut folded: Option<f64> = None;
                    for (value, child) in operands.iter().zip(children.iter()) {
                        let number =
                            to_f64(value).map_err(|message| EntwineError::Evaluation {
                                expr: child.to_string(),
                                message,
                            })?;
                        folded = Some(match folded {
                            None => number,
                            Some(acc) => (op.apply)(acc, number),
                        });
                    }
                    results.push(match folded {
                        Some(x) => ParameterValue::real(x),
                        None => ParameterValue::Nothing,
                    });
                }
            }
        }
        Ok(results.pop().unwrap_or(ParameterValue::Nothing))
    }
}

fn to_f64(value: &ParameterValue) -> std::result::Result<f64, String> {
    match value {
        ParameterValue::Scalar(scalar) => scalar
            .as_f64()
            .ok_or_else(|| format!("operand {scalar} is not numeric")),
        ParameterValue::Nothing => Err(String::from("operand evaluates to nothing")),
        other => Err(format!("operand {other} is not a scalar")),
    }
}

impl From<f64> for Call {
    fn from(value: f64) -> Call {
        Call::Constant(Scalar::Real(value))
    }
}
impl From<i64> for Call {
    fn from(value: i64) -> Call {
        Call::Constant(Scalar::Int(value))
    }
}

impl ops::Add for Call {
    type Output = Call;
    fn add(self, rhs: Call) -> Call {
        Call::operation(ADD, vec![self, rhs])
    }
}
impl ops::Sub for Call {
    type Output = Call;
    fn sub(self, rhs: Call) -> Call {
        Call::operation(SUB, vec![self, rhs])
    }
}
impl ops::Mul for Call {
    type Output = Call;
    fn mul(self, rhs: Call) -> Call {
        Call::operation(MUL, vec![self, rhs])
    }
}
impl ops::Div for Call {
    type Output = Call;
    fn div(self, rhs: Call) -> Call {
        Call::operation(DIV, vec![self, rhs])
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Call::Constant(scalar) => write!(f, "{scalar}"),
            Call::Parameter { name, args, .. } => write!(f, "{name}({args})"),
            Call::Operation { op, args } => {
                let parts: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "({})", parts.join(&format!(" {} ", op.symbol)))
            }
        }
    }
}
