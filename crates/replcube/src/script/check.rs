//! Name resolution and type checking
//!
//! Runs over a parsed submission with the bindings carried over from earlier
//! submissions in scope. Every problem found is reported; nothing stops at the
//! first error.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::engine::ResolvedReference;
use crate::script::ScriptState;
use crate::script::parser::{AssignOp, BinaryOp, Expr, Stmt, UnaryOp};
use crate::types::{Diagnostic, SourceLocation, Value};

/// Namespaces available without a package reference
pub const BUILTIN_NAMESPACES: &[&str] = &[
    "System",
    "System.Collections.Generic",
    "System.IO",
    "System.Linq",
    "System.Text",
    "System.Threading",
    "System.Threading.Tasks",
];

/// Static types known to the checker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Int,
    Bool,
    String,
    /// The type of the `null` literal
    Null,
    Void,
    Task,
    /// Parameter type accepting any value
    Object,
    /// Result of an expression that already failed to check
    Error,
}

impl Type {
    pub fn of(value: &Value) -> Type {
        match value {
            Value::Null => Type::Null,
            Value::Bool(_) => Type::Bool,
            Value::Int(_) => Type::Int,
            Value::Str(_) => Type::String,
        }
    }

    fn accepts(self, other: Type) -> bool {
        self == other || (self == Type::String && other == Type::Null)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Type::Int => "int",
            Type::Bool => "bool",
            Type::String => "string",
            Type::Null => "<null>",
            Type::Void => "void",
            Type::Task => "System.Threading.Tasks.Task",
            Type::Object => "object",
            Type::Error => "?",
        })
    }
}

/// Built-in static methods: (name, parameter types, return type)
const METHODS: &[(&str, &[Type], Type)] = &[
    ("Console.WriteLine", &[], Type::Void),
    ("Console.WriteLine", &[Type::Object], Type::Void),
    ("Console.Write", &[Type::Object], Type::Void),
    ("Math.Max", &[Type::Int, Type::Int], Type::Int),
    ("Math.Min", &[Type::Int, Type::Int], Type::Int),
    ("Math.Abs", &[Type::Int], Type::Int),
    ("Task.Delay", &[Type::Int], Type::Task),
];

const KNOWN_TYPES: &[&str] = &["Console", "Math", "Task"];

/// Summary of a submission that checked cleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checked {
    /// Whether the trailing expression produces a value
    pub returns_value: bool,
    /// Static type of each `var` declaration, in source order
    pub declared_types: Vec<Type>,
    pub warnings: Vec<Diagnostic>,
}

struct Checker<'a> {
    scope: HashMap<String, Type>,
    declared_here: HashSet<String>,
    declared_types: Vec<Type>,
    usings: BTreeSet<String>,
    references: &'a [ResolvedReference],
    diagnostics: Vec<Diagnostic>,
}

impl Checker<'_> {
    fn error(&mut self, code: &str, message: String, location: SourceLocation) -> Type {
        self.diagnostics
            .push(Diagnostic::error(code, message).at(location));
        Type::Error
    }

    fn namespace_exists(&self, namespace: &str) -> bool {
        let under = |root: &str| {
            namespace == root
                || namespace
                    .strip_prefix(root)
                    .is_some_and(|rest| rest.starts_with('.'))
        };
        BUILTIN_NAMESPACES.contains(&namespace)
            || self
                .references
                .iter()
                .any(|r| under(&r.reference.name))
    }

    fn statement(&mut self, stmt: &Stmt) -> Type {
        match stmt {
            Stmt::Using {
                namespace,
                location,
            } => {
                if self.usings.contains(namespace) {
                    self.diagnostics.push(
                        Diagnostic::warning(
                            "CS0105",
                            format!(
                                "The using directive for '{namespace}' appeared previously in this namespace"
                            ),
                        )
                        .at(*location),
                    );
                } else if !self.namespace_exists(namespace) {
                    self.error(
                        "CS0246",
                        format!(
                            "The type or namespace name '{namespace}' could not be found (are you missing a using directive or an assembly reference?)"
                        ),
                        *location,
                    );
                } else {
                    self.usings.insert(namespace.clone());
                }
                Type::Void
            }
            Stmt::Declare {
                name,
                init,
                location,
            } => {
                let ty = self.expr(init);
                if !self.declared_here.insert(name.clone()) {
                    self.error(
                        "CS0128",
                        format!(
                            "A local variable or function named '{name}' is already defined in this scope"
                        ),
                        *location,
                    );
                }
                let ty = match ty {
                    Type::Null | Type::Void | Type::Task => self.error(
                        "CS0815",
                        format!("Cannot assign {ty} to an implicitly-typed variable"),
                        init.location(),
                    ),
                    other => other,
                };
                self.scope.insert(name.clone(), ty);
                self.declared_types.push(ty);
                Type::Void
            }
            Stmt::Assign {
                name,
                op,
                value,
                location,
            } => {
                let value_ty = self.expr(value);
                let Some(&target) = self.scope.get(name) else {
                    return self.error("CS0103", undefined(name), *location);
                };
                let result = match op {
                    AssignOp::Set => value_ty,
                    AssignOp::Add => self.binary_type(BinaryOp::Add, target, value_ty, *location),
                    AssignOp::Sub => self.binary_type(BinaryOp::Sub, target, value_ty, *location),
                };
                if target != Type::Error && result != Type::Error && !target.accepts(result) {
                    self.error(
                        "CS0029",
                        format!("Cannot implicitly convert type '{result}' to '{target}'"),
                        value.location(),
                    );
                }
                Type::Void
            }
            Stmt::Throw {
                exception,
                message,
                location,
            } => {
                let short = exception.rsplit('.').next().unwrap_or(exception);
                if !short.ends_with("Exception") {
                    self.error(
                        "CS0246",
                        format!(
                            "The type or namespace name '{exception}' could not be found (are you missing a using directive or an assembly reference?)"
                        ),
                        *location,
                    );
                }
                if let Some(message) = message {
                    let ty = self.expr(message);
                    if ty != Type::Error && !Type::String.accepts(ty) {
                        self.error(
                            "CS1503",
                            format!("Argument 1: cannot convert from '{ty}' to 'string'"),
                            message.location(),
                        );
                    }
                }
                Type::Void
            }
            Stmt::Expr { expr, trailing } => {
                let ty = self.expr(expr);
                let is_statement_form = matches!(expr, Expr::Call { .. } | Expr::Await(..));
                if !trailing && !is_statement_form {
                    self.error(
                        "CS0201",
                        "Only assignment, call, increment, decrement, await, and new object expressions can be used as a statement".into(),
                        expr.location(),
                    );
                }
                if ty == Type::Task {
                    self.diagnostics.push(
                        Diagnostic::warning(
                            "CS4014",
                            "Because this call is not awaited, execution of the current method continues before the call is completed",
                        )
                        .at(expr.location()),
                    );
                }
                ty
            }
        }
    }

    fn expr(&mut self, expr: &Expr) -> Type {
        match expr {
            Expr::Literal(value, _) => Type::of(value),
            Expr::Name(name, location) => self.name(name, *location),
            Expr::Unary {
                op,
                operand,
                location,
            } => {
                let ty = self.expr(operand);
                let (symbol, wanted) = match op {
                    UnaryOp::Neg => ("-", Type::Int),
                    UnaryOp::Not => ("!", Type::Bool),
                };
                match ty {
                    Type::Error => Type::Error,
                    ty if ty == wanted => ty,
                    ty => self.error(
                        "CS0023",
                        format!("Operator '{symbol}' cannot be applied to operand of type '{ty}'"),
                        *location,
                    ),
                }
            }
            Expr::Binary {
                op,
                lhs,
                rhs,
                location,
            } => {
                let left = self.expr(lhs);
                let right = self.expr(rhs);
                self.binary_type(*op, left, right, *location)
            }
            Expr::Call {
                target,
                args,
                location,
            } => {
                let arg_types: Vec<Type> = args.iter().map(|a| self.expr(a)).collect();
                self.call(target, args, &arg_types, *location)
            }
            Expr::Await(inner, location) => match self.expr(inner) {
                Type::Task => Type::Void,
                Type::Error => Type::Error,
                other => self.error("CS4001", format!("Cannot await '{other}'"), *location),
            },
        }
    }

    fn name(&mut self, name: &str, location: SourceLocation) -> Type {
        let (head, member) = match name.split_once('.') {
            Some((head, member)) => (head, Some(member)),
            None => (name, None),
        };
        match (self.scope.get(head).copied(), member) {
            (Some(ty), None) => ty,
            (Some(Type::String), Some("Length")) => Type::Int,
            (Some(Type::Error), Some(_)) => Type::Error,
            (Some(ty), Some(member)) => self.error(
                "CS1061",
                format!("'{ty}' does not contain a definition for '{member}'"),
                location,
            ),
            (None, Some(member)) if KNOWN_TYPES.contains(&head) => self.error(
                "CS0117",
                format!("'{head}' does not contain a definition for '{member}'"),
                location,
            ),
            (None, _) => self.error("CS0103", undefined(head), location),
        }
    }

    fn call(
        &mut self,
        target: &str,
        args: &[Expr],
        arg_types: &[Type],
        location: SourceLocation,
    ) -> Type {
        let overloads: Vec<_> = METHODS.iter().filter(|(name, ..)| *name == target).collect();
        if overloads.is_empty() {
            return match target.split_once('.') {
                Some((head, member)) if KNOWN_TYPES.contains(&head) => self.error(
                    "CS0117",
                    format!("'{head}' does not contain a definition for '{member}'"),
                    location,
                ),
                Some((head, member)) if self.scope.contains_key(head) => {
                    let ty = self.scope[head];
                    self.error(
                        "CS1061",
                        format!("'{ty}' does not contain a definition for '{member}'"),
                        location,
                    )
                }
                Some((head, _)) => self.error("CS0103", undefined(head), location),
                None => self.error("CS0103", undefined(target), location),
            };
        }

        let Some((_, params, returns)) = overloads
            .iter()
            .find(|(_, params, _)| params.len() == arg_types.len())
        else {
            let method = target.rsplit('.').next().unwrap_or(target);
            return self.error(
                "CS1501",
                format!(
                    "No overload for method '{method}' takes {} arguments",
                    arg_types.len()
                ),
                location,
            );
        };

        for (index, ((param, arg_ty), arg)) in params.iter().zip(arg_types).zip(args).enumerate() {
            let ok = match (param, arg_ty) {
                (_, Type::Error) => true,
                (Type::Object, ty) => !matches!(ty, Type::Void | Type::Task),
                (param, ty) => param.accepts(*ty),
            };
            if !ok {
                self.error(
                    "CS1503",
                    format!(
                        "Argument {}: cannot convert from '{arg_ty}' to '{param}'",
                        index + 1
                    ),
                    arg.location(),
                );
            }
        }
        *returns
    }

    fn binary_type(
        &mut self,
        op: BinaryOp,
        left: Type,
        right: Type,
        location: SourceLocation,
    ) -> Type {
        use BinaryOp::*;
        use Type::{Bool, Int, Null};

        if left == Type::Error || right == Type::Error {
            return Type::Error;
        }
        let valid = |ty: Type| !matches!(ty, Type::Void | Type::Task);
        let result = match op {
            Add if left == Int && right == Int => Some(Int),
            Add if (left == Type::String && valid(right)) || (right == Type::String && valid(left)) => {
                Some(Type::String)
            }
            Sub | Mul | Div | Rem if left == Int && right == Int => Some(Int),
            Lt | Le | Gt | Ge if left == Int && right == Int => Some(Bool),
            Eq | Ne
                if valid(left)
                    && valid(right)
                    && (left == right
                        || (left == Null && right == Type::String)
                        || (left == Type::String && right == Null)) =>
            {
                Some(Bool)
            }
            And | Or if left == Bool && right == Bool => Some(Bool),
            _ => None,
        };
        result.unwrap_or_else(|| {
            self.error(
                "CS0019",
                format!(
                    "Operator '{}' cannot be applied to operands of type '{left}' and '{right}'",
                    op.symbol()
                ),
                location,
            )
        })
    }
}

fn undefined(name: &str) -> String {
    format!("The name '{name}' does not exist in the current context")
}

/// Check a parsed submission against the prior state and references
pub fn check(
    statements: &[Stmt],
    prior: &ScriptState,
    references: &[ResolvedReference],
) -> Result<Checked, Vec<Diagnostic>> {
    let mut checker = Checker {
        scope: prior
            .bindings
            .iter()
            .map(|(name, binding)| (name.clone(), binding.ty))
            .collect(),
        declared_here: HashSet::new(),
        declared_types: Vec::new(),
        usings: prior.usings.clone(),
        references,
        diagnostics: Vec::new(),
    };

    let mut last = Type::Void;
    for stmt in statements {
        last = checker.statement(stmt);
    }

    let trailing = matches!(statements.last(), Some(Stmt::Expr { trailing: true, .. }));
    if checker.diagnostics.iter().any(Diagnostic::is_error) {
        return Err(checker.diagnostics);
    }
    Ok(Checked {
        returns_value: trailing && !matches!(last, Type::Void | Type::Task),
        declared_types: checker.declared_types,
        warnings: checker.diagnostics,
    })
}
