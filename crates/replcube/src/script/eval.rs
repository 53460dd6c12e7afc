//! Tree-walking evaluator
//!
//! Yields to the scheduler before every statement and checks the execution's
//! cancellation token, so timeouts and aborts stop a script between
//! statements. Integer arithmetic is checked.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::engine::{ExecutionContext, ExecutionFault};
use crate::script::check::Type;
use crate::script::parser::{AssignOp, BinaryOp, Expr, Stmt, UnaryOp};
use crate::script::{Binding, Program, ScriptState};
use crate::types::Value;

fn divide_by_zero() -> ExecutionFault {
    ExecutionFault::new("DivideByZeroException", "Attempted to divide by zero.")
}

fn overflow() -> ExecutionFault {
    ExecutionFault::new("OverflowException", "Arithmetic operation resulted in an overflow.")
}

fn invalid_operation(detail: &str) -> ExecutionFault {
    ExecutionFault::new("InvalidOperationException", detail)
}

fn null_reference() -> ExecutionFault {
    ExecutionFault::new(
        "NullReferenceException",
        "Object reference not set to an instance of an object.",
    )
}

struct Interpreter<'a> {
    bindings: BTreeMap<String, Binding>,
    ctx: &'a ExecutionContext,
}

impl Interpreter<'_> {
    fn lookup(&self, name: &str) -> Result<&Binding, ExecutionFault> {
        self.bindings
            .get(name)
            .ok_or_else(|| invalid_operation(&format!("'{name}' is not bound")))
    }

    fn int(&self, expr: &Expr) -> Result<i64, ExecutionFault> {
        match self.eval(expr)? {
            Value::Int(n) => Ok(n),
            other => Err(invalid_operation(&format!(
                "expected int, found {}",
                other.type_name()
            ))),
        }
    }

    fn bool(&self, expr: &Expr) -> Result<bool, ExecutionFault> {
        match self.eval(expr)? {
            Value::Bool(b) => Ok(b),
            other => Err(invalid_operation(&format!(
                "expected bool, found {}",
                other.type_name()
            ))),
        }
    }

    fn eval(&self, expr: &Expr) -> Result<Value, ExecutionFault> {
        match expr {
            Expr::Literal(value, _) => Ok(value.clone()),
            Expr::Name(name, _) => match name.split_once('.') {
                None => Ok(self.lookup(name)?.value.clone()),
                Some((head, "Length")) => match &self.lookup(head)?.value {
                    Value::Str(s) => Ok(Value::Int(s.encode_utf16().count() as i64)),
                    Value::Null => Err(null_reference()),
                    other => Err(invalid_operation(&format!(
                        "{} has no Length",
                        other.type_name()
                    ))),
                },
                Some(_) => Err(invalid_operation(&format!("unsupported member access '{name}'"))),
            },
            Expr::Unary { op, operand, .. } => match op {
                UnaryOp::Neg => self
                    .int(operand)?
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(overflow),
                UnaryOp::Not => Ok(Value::Bool(!self.bool(operand)?)),
            },
            Expr::Binary { op, lhs, rhs, .. } => match op {
                BinaryOp::And => Ok(Value::Bool(self.bool(lhs)? && self.bool(rhs)?)),
                BinaryOp::Or => Ok(Value::Bool(self.bool(lhs)? || self.bool(rhs)?)),
                op => {
                    let left = self.eval(lhs)?;
                    let right = self.eval(rhs)?;
                    apply(*op, left, right)
                }
            },
            Expr::Call { target, args, .. } => self.call(target, args),
            Expr::Await(..) => Err(invalid_operation("await is only valid as a statement")),
        }
    }

    fn call(&self, target: &str, args: &[Expr]) -> Result<Value, ExecutionFault> {
        match (target, args) {
            ("Console.WriteLine", []) => {
                self.ctx.output().write("\n");
                Ok(Value::Null)
            }
            ("Console.WriteLine", [arg]) => {
                let value = self.eval(arg)?;
                self.ctx.output().write_line(&value.to_string());
                Ok(Value::Null)
            }
            ("Console.Write", [arg]) => {
                let value = self.eval(arg)?;
                self.ctx.output().write(&value.to_string());
                Ok(Value::Null)
            }
            ("Math.Max", [a, b]) => Ok(Value::Int(self.int(a)?.max(self.int(b)?))),
            ("Math.Min", [a, b]) => Ok(Value::Int(self.int(a)?.min(self.int(b)?))),
            ("Math.Abs", [a]) => self.int(a)?.checked_abs().map(Value::Int).ok_or_else(|| {
                ExecutionFault::new(
                    "OverflowException",
                    "Negating the minimum value of a twos complement number is invalid.",
                )
            }),
            // not awaited: the delay starts and nobody waits for it
            ("Task.Delay", [ms]) => {
                self.int(ms)?;
                Ok(Value::Null)
            }
            _ => Err(invalid_operation(&format!("no method '{target}'"))),
        }
    }

    async fn await_task(&self, task: &Expr) -> Result<(), ExecutionFault> {
        let Expr::Call { target, args, .. } = task else {
            return Err(invalid_operation("only tasks can be awaited"));
        };
        let [ms] = args.as_slice() else {
            return Err(invalid_operation("Task.Delay takes one argument"));
        };
        if target != "Task.Delay" {
            return Err(invalid_operation(&format!("'{target}' is not awaitable")));
        }

        let cancel = self.ctx.cancellation();
        match self.int(ms)? {
            -1 => {
                cancel.cancelled().await;
                Err(ExecutionFault::cancelled())
            }
            ms if ms < -1 => Err(ExecutionFault::new(
                "ArgumentOutOfRangeException",
                "The value needs to be either -1 (signifying an infinite timeout), 0 or a positive integer.",
            )),
            ms => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ExecutionFault::cancelled()),
                    _ = tokio::time::sleep(Duration::from_millis(ms as u64)) => Ok(()),
                }
            }
        }
    }
}

fn apply(op: BinaryOp, left: Value, right: Value) -> Result<Value, ExecutionFault> {
    use Value::{Bool, Int, Str};

    let result = match (op, left, right) {
        (BinaryOp::Add, Int(a), Int(b)) => Int(a.checked_add(b).ok_or_else(overflow)?),
        // string concatenation; null concatenates as empty
        (BinaryOp::Add, a, b) => Str(format!("{a}{b}")),
        (BinaryOp::Sub, Int(a), Int(b)) => Int(a.checked_sub(b).ok_or_else(overflow)?),
        (BinaryOp::Mul, Int(a), Int(b)) => Int(a.checked_mul(b).ok_or_else(overflow)?),
        (BinaryOp::Div | BinaryOp::Rem, Int(_), Int(0)) => return Err(divide_by_zero()),
        (BinaryOp::Div, Int(a), Int(b)) => Int(a.checked_div(b).ok_or_else(overflow)?),
        (BinaryOp::Rem, Int(a), Int(b)) => Int(a.checked_rem(b).ok_or_else(overflow)?),
        (BinaryOp::Lt, Int(a), Int(b)) => Bool(a < b),
        (BinaryOp::Le, Int(a), Int(b)) => Bool(a <= b),
        (BinaryOp::Gt, Int(a), Int(b)) => Bool(a > b),
        (BinaryOp::Ge, Int(a), Int(b)) => Bool(a >= b),
        (BinaryOp::Eq, a, b) => Bool(a == b),
        (BinaryOp::Ne, a, b) => Bool(a != b),
        (op, a, b) => {
            return Err(invalid_operation(&format!(
                "operator '{}' on {} and {}",
                op.symbol(),
                a.type_name(),
                b.type_name()
            )));
        }
    };
    Ok(result)
}

/// Run a checked program on top of `prior`
///
/// Returns the trailing expression's value and the state to continue from.
/// A fault discards everything the submission defined.
pub async fn execute(
    program: &Program,
    prior: ScriptState,
    ctx: &ExecutionContext,
) -> Result<(Option<Value>, ScriptState), ExecutionFault> {
    let ScriptState { bindings, mut usings } = prior;
    let mut interpreter = Interpreter { bindings, ctx };
    let mut declared_types = program.declared_types.iter().copied();
    let mut result = None;

    for stmt in &program.statements {
        tokio::task::yield_now().await;
        if ctx.is_cancelled() {
            return Err(ExecutionFault::cancelled());
        }

        match stmt {
            Stmt::Using { namespace, .. } => {
                usings.insert(namespace.clone());
            }
            Stmt::Declare { name, init, .. } => {
                let value = interpreter.eval(init)?;
                let ty = declared_types.next().unwrap_or_else(|| Type::of(&value));
                interpreter
                    .bindings
                    .insert(name.clone(), Binding { ty, value });
            }
            Stmt::Assign { name, op, value, .. } => {
                let rhs = interpreter.eval(value)?;
                let current = interpreter.lookup(name)?.value.clone();
                let updated = match op {
                    AssignOp::Set => rhs,
                    AssignOp::Add => apply(BinaryOp::Add, current, rhs)?,
                    AssignOp::Sub => apply(BinaryOp::Sub, current, rhs)?,
                };
                if let Some(binding) = interpreter.bindings.get_mut(name) {
                    binding.value = updated;
                }
            }
            Stmt::Throw {
                exception,
                message,
                ..
            } => {
                let kind = exception.rsplit('.').next().unwrap_or(exception);
                let message = match message {
                    Some(expr) => match interpreter.eval(expr)? {
                        Value::Null => format!("Exception of type 'System.{kind}' was thrown."),
                        value => value.to_string(),
                    },
                    None => format!("Exception of type 'System.{kind}' was thrown."),
                };
                return Err(ExecutionFault::new(kind, message));
            }
            Stmt::Expr {
                expr: Expr::Await(task, _),
                ..
            } => interpreter.await_task(task).await?,
            Stmt::Expr { expr, trailing } => {
                let value = interpreter.eval(expr)?;
                if *trailing && program.returns_value {
                    result = Some(value);
                }
            }
        }
    }

    Ok((
        result,
        ScriptState {
            bindings: interpreter.bindings,
            usings,
        },
    ))
}
