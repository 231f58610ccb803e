use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::expression::{BinaryOp, CollectionOp, Expression, Literal, UnaryOp};
use crate::{EvaluationError, Widget};

/// One operation an expression may need from its evaluation context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadProperty,
    InvokeMethod,
    ResolveType,
}

impl Capability {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadProperty => "read_property",
            Self::InvokeMethod => "invoke_method",
            Self::ResolveType => "resolve_type",
        }
    }
}

pub type CapabilitySet = BTreeSet<Capability>;

/// Types reachable through `T(...)` when [`Capability::ResolveType`] is granted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum HostType {
    Runtime,
    Math,
    System,
}

impl HostType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Runtime => "Runtime",
            Self::Math => "Math",
            Self::System => "System",
        }
    }

    /// Resolve a possibly dotted type name by its final segment.
    #[must_use]
    pub fn resolve(name: &str) -> Option<Self> {
        match name.rsplit('.').next()? {
            "Runtime" => Some(Self::Runtime),
            "Math" => Some(Self::Math),
            "System" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostValue {
    Type(HostType),
    Runtime,
    Process { exit_code: i32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Widget(Widget),
    List(Vec<Value>),
    Host(HostValue),
}

impl Value {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "decimal",
            Self::Str(_) => "string",
            Self::Widget(_) => "widget",
            Self::List(_) => "collection",
            Self::Host(HostValue::Type(_)) => "type",
            Self::Host(HostValue::Runtime) => "runtime",
            Self::Host(HostValue::Process { .. }) => "process",
        }
    }

    #[must_use]
    pub fn widgets(widgets: &[Widget]) -> Self {
        Self::List(widgets.iter().cloned().map(Self::Widget).collect())
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value}"),
            Self::Widget(widget) => write!(f, "Widget#{}", widget.id),
            Self::List(items) => {
                write!(f, "[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Host(HostValue::Type(host_type)) => write!(f, "T({})", host_type.as_str()),
            Self::Host(HostValue::Runtime) => write!(f, "Runtime"),
            Self::Host(HostValue::Process { exit_code }) => write!(f, "Process[exit={exit_code}]"),
        }
    }
}

/// Evaluates parsed expressions with an explicit, enumerated set of capabilities.
///
/// The context holds no mutable state; one instance can serve every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationContext {
    capabilities: CapabilitySet,
}

impl EvaluationContext {
    /// Property reads only. Method invocation and type resolution are denied.
    #[must_use]
    pub fn read_only() -> Self {
        Self::with_capabilities([Capability::ReadProperty])
    }

    /// Every capability, including host type resolution and process execution.
    #[must_use]
    pub fn unrestricted() -> Self {
        Self::with_capabilities([
            Capability::ReadProperty,
            Capability::InvokeMethod,
            Capability::ResolveType,
        ])
    }

    #[must_use]
    pub fn with_capabilities<I>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        Self { capabilities: capabilities.into_iter().collect() }
    }

    #[must_use]
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    #[must_use]
    pub fn permits(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    fn require(&self, capability: Capability) -> Result<(), EvaluationError> {
        if self.permits(capability) {
            Ok(())
        } else {
            Err(EvaluationError::CapabilityDenied(capability))
        }
    }

    /// Reject an expression up front if any path through it needs an ungranted capability.
    ///
    /// # Errors
    /// Returns [`EvaluationError::CapabilityDenied`] naming the first missing capability.
    pub fn check(&self, expression: &Expression) -> Result<(), EvaluationError> {
        expression.required_capabilities().into_iter().try_for_each(|cap| self.require(cap))
    }

    /// Evaluate `expression` with `root` as both `#root` and the initial `#this`.
    ///
    /// # Errors
    /// Returns an error when the expression needs an ungranted capability, or when
    /// evaluation fails (type mismatch, unknown property, arithmetic failure, ...).
    pub fn evaluate(
        &self,
        expression: &Expression,
        root: &Value,
    ) -> Result<Value, EvaluationError> {
        self.check(expression)?;
        self.eval(expression, root, root)
    }

    fn eval(
        &self,
        expression: &Expression,
        root: &Value,
        this: &Value,
    ) -> Result<Value, EvaluationError> {
        match expression {
            Expression::Literal(literal) => Ok(match literal {
                Literal::Null => Value::Null,
                Literal::Bool(value) => Value::Bool(*value),
                Literal::Int(value) => Value::Int(*value),
                Literal::Float(value) => Value::Float(*value),
                Literal::Str(value) => Value::Str(value.clone()),
            }),
            Expression::Variable(name) => match name.as_str() {
                "this" => Ok(this.clone()),
                "root" => Ok(root.clone()),
                _ => Err(EvaluationError::UnknownVariable(name.clone())),
            },
            Expression::Property { target, name, null_safe } => {
                self.require(Capability::ReadProperty)?;
                let target = self.eval_target(target.as_deref(), root, this)?;
                if *null_safe && target == Value::Null {
                    return Ok(Value::Null);
                }
                read_property(&target, name)
            }
            Expression::MethodCall { target, name, args, null_safe } => {
                self.require(Capability::InvokeMethod)?;
                let target = self.eval_target(target.as_deref(), root, this)?;
                if *null_safe && target == Value::Null {
                    return Ok(Value::Null);
                }
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, root, this))
                    .collect::<Result<Vec<_>, _>>()?;
                invoke(&target, name, args)
            }
            Expression::TypeRef(name) => {
                self.require(Capability::ResolveType)?;
                HostType::resolve(name)
                    .map(|host_type| Value::Host(HostValue::Type(host_type)))
                    .ok_or_else(|| EvaluationError::UnknownType(name.clone()))
            }
            Expression::Index { target, index } => {
                let target = self.eval(target, root, this)?;
                let index = self.eval(index, root, this)?;
                index_into(target, &index)
            }
            Expression::Collection { target, op, body } => {
                let target = self.eval(target, root, this)?;
                self.apply_collection(target, *op, body, root)
            }
            Expression::Unary { op, operand } => {
                let operand = self.eval(operand, root, this)?;
                apply_unary(*op, operand)
            }
            Expression::Binary { op: BinaryOp::And, left, right } => {
                if !self.eval_condition(left, root, this, "and")? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval_condition(right, root, this, "and")?))
            }
            Expression::Binary { op: BinaryOp::Or, left, right } => {
                if self.eval_condition(left, root, this, "or")? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval_condition(right, root, this, "or")?))
            }
            Expression::Binary { op, left, right } => {
                let left = self.eval(left, root, this)?;
                let right = self.eval(right, root, this)?;
                apply_binary(*op, left, right)
            }
            Expression::Ternary { condition, then, otherwise } => {
                if self.eval_condition(condition, root, this, "?:")? {
                    self.eval(then, root, this)
                } else {
                    self.eval(otherwise, root, this)
                }
            }
            Expression::Elvis { value, fallback } => match self.eval(value, root, this)? {
                Value::Null => self.eval(fallback, root, this),
                Value::Str(text) if text.is_empty() => self.eval(fallback, root, this),
                other => Ok(other),
            },
        }
    }

    fn eval_target(
        &self,
        target: Option<&Expression>,
        root: &Value,
        this: &Value,
    ) -> Result<Value, EvaluationError> {
        match target {
            Some(target) => self.eval(target, root, this),
            None => Ok(this.clone()),
        }
    }

    fn eval_condition(
        &self,
        expression: &Expression,
        root: &Value,
        this: &Value,
        operator: &'static str,
    ) -> Result<bool, EvaluationError> {
        match self.eval(expression, root, this)? {
            Value::Bool(value) => Ok(value),
            other => Err(mismatch(operator, &other)),
        }
    }

    fn apply_collection(
        &self,
        target: Value,
        op: CollectionOp,
        body: &Expression,
        root: &Value,
    ) -> Result<Value, EvaluationError> {
        let items = match target {
            Value::List(items) => items,
            other => return Err(mismatch(collection_symbol(op), &other)),
        };

        if op == CollectionOp::Project {
            return items
                .iter()
                .map(|item| self.eval(body, root, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List);
        }

        let mut selected = Vec::new();
        for item in items {
            if self.eval_condition(body, root, &item, collection_symbol(op))? {
                if op == CollectionOp::First {
                    return Ok(item);
                }
                selected.push(item);
            }
        }

        Ok(match op {
            CollectionOp::Last => selected.pop().unwrap_or(Value::Null),
            CollectionOp::First => Value::Null,
            CollectionOp::Select | CollectionOp::Project => Value::List(selected),
        })
    }
}

fn collection_symbol(op: CollectionOp) -> &'static str {
    match op {
        CollectionOp::Select => ".?[]",
        CollectionOp::First => ".^[]",
        CollectionOp::Last => ".$[]",
        CollectionOp::Project => ".![]",
    }
}

fn mismatch(operator: &'static str, found: &Value) -> EvaluationError {
    EvaluationError::TypeMismatch { operator, found: found.type_name().to_string() }
}

fn mismatch_pair(operator: &'static str, left: &Value, right: &Value) -> EvaluationError {
    EvaluationError::TypeMismatch {
        operator,
        found: format!("{} and {}", left.type_name(), right.type_name()),
    }
}

fn read_property(target: &Value, name: &str) -> Result<Value, EvaluationError> {
    let unknown = || EvaluationError::UnknownProperty {
        property: name.to_string(),
        target: target.type_name(),
    };
    match target {
        Value::Null => Err(EvaluationError::NullTarget(name.to_string())),
        Value::Widget(widget) => match name {
            "id" => Ok(Value::Int(widget.id.0)),
            "name" => Ok(Value::Str(widget.name.clone())),
            "price" => Ok(Value::Float(widget.price)),
            "enabled" => Ok(Value::Bool(widget.enabled)),
            _ => Err(unknown()),
        },
        _ => Err(unknown()),
    }
}

fn arguments<const N: usize>(
    target: &Value,
    method: &str,
    args: Vec<Value>,
) -> Result<[Value; N], EvaluationError> {
    let arity = args.len();
    args.try_into().map_err(|_| EvaluationError::UnknownMethod {
        method: method.to_string(),
        arity,
        target: target.type_name(),
    })
}

fn invoke(target: &Value, method: &str, args: Vec<Value>) -> Result<Value, EvaluationError> {
    let unknown = |arity: usize| EvaluationError::UnknownMethod {
        method: method.to_string(),
        arity,
        target: target.type_name(),
    };
    match (target, method) {
        (Value::Null, _) => Err(EvaluationError::NullTarget(format!("{method}()"))),
        (Value::Host(HostValue::Type(HostType::Runtime)), "getRuntime") => {
            let [] = arguments::<0>(target, method, args)?;
            Ok(Value::Host(HostValue::Runtime))
        }
        (Value::Host(HostValue::Type(HostType::Math)), "abs") => {
            let [value] = arguments::<1>(target, method, args)?;
            match value {
                Value::Int(n) => n.checked_abs().map(Value::Int).ok_or_else(|| {
                    EvaluationError::Arithmetic("integer overflow in abs".to_string())
                }),
                Value::Float(n) => Ok(Value::Float(n.abs())),
                other => Err(mismatch("Math.abs", &other)),
            }
        }
        (Value::Host(HostValue::Type(HostType::Math)), "max" | "min") => {
            let [left, right] = arguments::<2>(target, method, args)?;
            let ordering = compare(&left, &right, "Math.max/min")?;
            let take_left = if method == "max" { ordering.is_ge() } else { ordering.is_le() };
            Ok(if take_left { left } else { right })
        }
        (Value::Host(HostValue::Type(HostType::System)), "getenv") => {
            match arguments::<1>(target, method, args)? {
                [Value::Str(name)] => Ok(std::env::var(name).map_or(Value::Null, Value::Str)),
                [other] => Err(mismatch("System.getenv", &other)),
            }
        }
        (Value::Host(HostValue::Type(HostType::System)), "currentTimeMillis") => {
            let [] = arguments::<0>(target, method, args)?;
            let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
            i64::try_from(millis)
                .map(Value::Int)
                .map_err(|_| EvaluationError::Arithmetic("clock value overflow".to_string()))
        }
        (Value::Host(HostValue::Runtime), "exec") => {
            match arguments::<1>(target, method, args)? {
                [Value::Str(command)] => run_command(&command),
                [other] => Err(mismatch("Runtime.exec", &other)),
            }
        }
        (Value::Host(HostValue::Runtime), "availableProcessors") => {
            let [] = arguments::<0>(target, method, args)?;
            let count = std::thread::available_parallelism().map_or(1, usize::from);
            Ok(Value::Int(i64::try_from(count).unwrap_or(i64::MAX)))
        }
        (Value::Host(HostValue::Process { exit_code }), "waitFor" | "exitValue") => {
            let [] = arguments::<0>(target, method, args)?;
            Ok(Value::Int(i64::from(*exit_code)))
        }
        (Value::Str(text), _) => {
            let arity = args.len();
            invoke_string(text, method, args).unwrap_or_else(|| Err(unknown(arity)))
        }
        (Value::List(items), "size") => {
            let [] = arguments::<0>(target, method, args)?;
            Ok(Value::Int(i64::try_from(items.len()).unwrap_or(i64::MAX)))
        }
        (Value::List(items), "isEmpty") => {
            let [] = arguments::<0>(target, method, args)?;
            Ok(Value::Bool(items.is_empty()))
        }
        (Value::Widget(_), "getId" | "getName" | "getPrice" | "isEnabled") => {
            let [] = arguments::<0>(target, method, args)?;
            let property = match method {
                "getId" => "id",
                "getName" => "name",
                "getPrice" => "price",
                _ => "enabled",
            };
            read_property(target, property)
        }
        _ => Err(unknown(args.len())),
    }
}

fn invoke_string(
    text: &str,
    method: &str,
    args: Vec<Value>,
) -> Option<Result<Value, EvaluationError>> {
    let target = Value::Str(text.to_string());
    let result = match method {
        "length" => arguments::<0>(&target, method, args)
            .map(|_| Value::Int(i64::try_from(text.chars().count()).unwrap_or(i64::MAX))),
        "toUpperCase" => {
            arguments::<0>(&target, method, args).map(|_| Value::Str(text.to_uppercase()))
        }
        "toLowerCase" => {
            arguments::<0>(&target, method, args).map(|_| Value::Str(text.to_lowercase()))
        }
        "trim" => {
            arguments::<0>(&target, method, args).map(|_| Value::Str(text.trim().to_string()))
        }
        "contains" | "startsWith" | "endsWith" => {
            arguments::<1>(&target, method, args).and_then(|[needle]| match needle {
                Value::Str(needle) => Ok(Value::Bool(match method {
                    "contains" => text.contains(needle.as_str()),
                    "startsWith" => text.starts_with(needle.as_str()),
                    _ => text.ends_with(needle.as_str()),
                })),
                other => Err(mismatch("string search", &other)),
            })
        }
        _ => return None,
    };
    Some(result)
}

fn run_command(command: &str) -> Result<Value, EvaluationError> {
    let mut parts = command.split_whitespace();
    let program =
        parts.next().ok_or_else(|| EvaluationError::HostCall("empty command".to_string()))?;
    let status = Command::new(program)
        .args(parts)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|err| EvaluationError::HostCall(format!("failed to execute `{program}`: {err}")))?;
    Ok(Value::Host(HostValue::Process { exit_code: status.code().unwrap_or(-1) }))
}

fn index_into(target: Value, index: &Value) -> Result<Value, EvaluationError> {
    match (target, index) {
        (Value::List(mut items), Value::Int(position)) => {
            let len = items.len();
            usize::try_from(*position)
                .ok()
                .filter(|slot| *slot < len)
                .map(|slot| items.swap_remove(slot))
                .ok_or(EvaluationError::IndexOutOfBounds { index: *position, len })
        }
        (Value::Null, _) => Err(EvaluationError::NullTarget("[]".to_string())),
        (target, index) => Err(mismatch_pair("[]", &target, index)),
    }
}

fn apply_unary(op: UnaryOp, operand: Value) -> Result<Value, EvaluationError> {
    match (op, operand) {
        (UnaryOp::Not, Value::Bool(value)) => Ok(Value::Bool(!value)),
        (UnaryOp::Neg, Value::Int(value)) => value
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| EvaluationError::Arithmetic("integer overflow in negation".to_string())),
        (UnaryOp::Neg, Value::Float(value)) => Ok(Value::Float(-value)),
        (UnaryOp::Not, other) => Err(mismatch("not", &other)),
        (UnaryOp::Neg, other) => Err(mismatch("-", &other)),
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(n) => Some(*n as f64),
        Value::Float(n) => Some(*n),
        _ => None,
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) => {
            as_float(left) == as_float(right)
        }
        _ => left == right,
    }
}

fn compare(
    left: &Value,
    right: &Value,
    operator: &'static str,
) -> Result<Ordering, EvaluationError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        _ => match (as_float(left), as_float(right)) {
            (Some(a), Some(b)) => {
                a.partial_cmp(&b).ok_or_else(|| mismatch_pair(operator, left, right))
            }
            _ => Err(mismatch_pair(operator, left, right)),
        },
    }
}

fn apply_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, EvaluationError> {
    let operator = op.as_str();
    match op {
        BinaryOp::Eq => Ok(Value::Bool(equals(&left, &right))),
        BinaryOp::Ne => Ok(Value::Bool(!equals(&left, &right))),
        BinaryOp::Lt => Ok(Value::Bool(compare(&left, &right, operator)?.is_lt())),
        BinaryOp::Gt => Ok(Value::Bool(compare(&left, &right, operator)?.is_gt())),
        BinaryOp::Le => Ok(Value::Bool(compare(&left, &right, operator)?.is_le())),
        BinaryOp::Ge => Ok(Value::Bool(compare(&left, &right, operator)?.is_ge())),
        BinaryOp::Add if matches!(left, Value::Str(_)) || matches!(right, Value::Str(_)) => {
            Ok(Value::Str(format!("{left}{right}")))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, &left, &right)
        }
        BinaryOp::And | BinaryOp::Or => match (left, right) {
            (Value::Bool(a), Value::Bool(b)) => {
                Ok(Value::Bool(if op == BinaryOp::And { a && b } else { a || b }))
            }
            (left, right) => Err(mismatch_pair(operator, &left, &right)),
        },
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvaluationError> {
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        if matches!(op, BinaryOp::Div | BinaryOp::Rem) && *b == 0 {
            return Err(EvaluationError::Arithmetic("division by zero".to_string()));
        }
        let result = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            BinaryOp::Div => a.checked_div(*b),
            _ => a.checked_rem(*b),
        };
        return result.map(Value::Int).ok_or_else(|| {
            EvaluationError::Arithmetic(format!("integer overflow in `{}`", op.as_str()))
        });
    }

    let (Some(a), Some(b)) = (as_float(left), as_float(right)) else {
        return Err(mismatch_pair(op.as_str(), left, right));
    };
    Ok(Value::Float(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        _ => a % b,
    }))
}
