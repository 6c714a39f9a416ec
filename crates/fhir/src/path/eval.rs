//! Collection-based evaluation of parsed path expressions.

use super::parser::{BinaryOp, Expr, Literal};
use crate::graph::{NodeId, Primitive, ResourceGraph};
use crate::registry::TypeDescriptor;

/// One item of an evaluation result.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Node(NodeId),
    Boolean(bool),
    String(String),
    Integer(i64),
    Decimal(f64),
}

impl Value {
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Value::Node(id) => Some(*id),
            _ => None,
        }
    }
}

pub(crate) struct Evaluator<'a> {
    pub graph: &'a ResourceGraph,
    pub types: &'a dyn TypeDescriptor,
}

type Collection = Vec<Value>;

impl Evaluator<'_> {
    pub fn eval(
        &self,
        expr: &Expr,
        input: &[Value],
        this: Option<&Value>,
    ) -> Result<Collection, String> {
        match expr {
            Expr::Identifier(name) => {
                Ok(input.iter().flat_map(|v| self.navigate(v, name)).collect())
            }
            Expr::This => Ok(match this {
                Some(v) => vec![v.clone()],
                None => input.to_vec(),
            }),
            Expr::Literal(lit) => Ok(vec![literal_value(lit)]),
            Expr::Member(base, name) => {
                let base = self.eval(base, input, this)?;
                Ok(base.iter().flat_map(|v| self.navigate(v, name)).collect())
            }
            Expr::Function { base, name, args } => {
                let focus = match base {
                    Some(b) => self.eval(b, input, this)?,
                    None => input.to_vec(),
                };
                self.call(name, args, &focus, this)
            }
            Expr::Index(base, index) => {
                let base = self.eval(base, input, this)?;
                let index = self.eval(index, input, this)?;
                match index.as_slice() {
                    [Value::Integer(i)] if *i >= 0 => {
                        Ok(base.get(*i as usize).cloned().into_iter().collect())
                    }
                    _ => Err("indexer must be a non-negative integer".to_owned()),
                }
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left, input, this)?;
                let right = self.eval(right, input, this)?;
                Ok(self.binary(*op, left, right))
            }
        }
    }

    fn navigate(&self, value: &Value, name: &str) -> Collection {
        let Value::Node(node) = value else {
            return Vec::new();
        };
        let node = *node;
        let type_name = self.graph.type_name(node);

        if name.starts_with(|c: char| c.is_ascii_uppercase()) {
            return if self.types.is_a(type_name, name) {
                vec![Value::Node(node)]
            } else {
                Vec::new()
            };
        }

        let children = self.graph.children(node, name);
        if !children.is_empty() {
            return children.iter().map(|c| Value::Node(*c)).collect();
        }

        match self.types.choice_field(type_name, name) {
            Some((field, ty)) => self
                .graph
                .children(node, &field.name)
                .iter()
                .filter(|c| self.types.is_a(self.graph.type_name(**c), &ty))
                .map(|c| Value::Node(*c))
                .collect(),
            None => Vec::new(),
        }
    }

    fn call(
        &self,
        name: &str,
        args: &[Expr],
        focus: &[Value],
        this: Option<&Value>,
    ) -> Result<Collection, String> {
        match name {
            "where" => {
                let criteria = single_arg(name, args)?;
                let mut out = Vec::new();
                for item in focus {
                    let result = self.eval(criteria, std::slice::from_ref(item), Some(item))?;
                    if truthy(&result) == Some(true) {
                        out.push(item.clone());
                    }
                }
                Ok(out)
            }
            "exists" => {
                if let Some(criteria) = args.first() {
                    let filtered = self.call("where", std::slice::from_ref(criteria), focus, this)?;
                    Ok(vec![Value::Boolean(!filtered.is_empty())])
                } else {
                    Ok(vec![Value::Boolean(!focus.is_empty())])
                }
            }
            "empty" => Ok(vec![Value::Boolean(focus.is_empty())]),
            "not" => Ok(match truthy(focus) {
                Some(b) => vec![Value::Boolean(!b)],
                None => Vec::new(),
            }),
            "first" => Ok(focus.first().cloned().into_iter().collect()),
            "last" => Ok(focus.last().cloned().into_iter().collect()),
            "count" => Ok(vec![Value::Integer(focus.len() as i64)]),
            "hasValue" => Ok(vec![Value::Boolean(
                focus.len() == 1 && self.atom(&focus[0]).is_some(),
            )]),
            "as" | "ofType" => {
                let wanted = self.type_argument(name, args)?;
                Ok(focus
                    .iter()
                    .filter(|v| self.value_is_a(v, &wanted))
                    .cloned()
                    .collect())
            }
            "is" => {
                let wanted = self.type_argument(name, args)?;
                Ok(match focus {
                    [single] => vec![Value::Boolean(self.value_is_a(single, &wanted))],
                    _ => Vec::new(),
                })
            }
            "resolve" => Ok(focus
                .iter()
                .filter_map(|v| self.resolve(v))
                .map(Value::Node)
                .collect()),
            "toString" => Ok(focus
                .iter()
                .filter_map(|v| self.atom(v))
                .filter_map(|v| text_of(&v))
                .map(Value::String)
                .collect()),
            "contains" | "startsWith" | "endsWith" => {
                let needle = single_arg(name, args)?;
                let needle = self.eval(needle, focus, this)?;
                let (Some(haystack), Some(needle)) =
                    (self.single_text(focus), self.single_text(&needle))
                else {
                    return Ok(Vec::new());
                };
                let result = match name {
                    "contains" => haystack.contains(&needle),
                    "startsWith" => haystack.starts_with(&needle),
                    _ => haystack.ends_with(&needle),
                };
                Ok(vec![Value::Boolean(result)])
            }
            "extension" => {
                let url = single_arg(name, args)?;
                let url = self.eval(url, focus, this)?;
                let Some(url) = self.single_text(&url) else {
                    return Ok(Vec::new());
                };
                Ok(focus
                    .iter()
                    .filter_map(Value::as_node)
                    .flat_map(|n| self.graph.children(n, "extension").iter().copied())
                    .filter(|ext| {
                        self.graph.child_text(*ext, "url").as_deref() == Some(url.as_str())
                    })
                    .map(Value::Node)
                    .collect())
            }
            other => Err(format!("unsupported function {other}()")),
        }
    }

    fn type_argument(&self, name: &str, args: &[Expr]) -> Result<String, String> {
        let arg = single_arg(name, args)?;
        let spec = arg
            .type_specifier()
            .ok_or_else(|| format!("{name}() expects a type name"))?;
        Ok(self.types.canonical_name(spec).unwrap_or_else(|| spec.to_owned()))
    }

    fn value_is_a(&self, value: &Value, wanted: &str) -> bool {
        match value {
            Value::Node(n) => self.types.is_a(self.graph.type_name(*n), wanted),
            Value::Boolean(_) => wanted == "boolean",
            Value::String(_) => wanted == "string",
            Value::Integer(_) => wanted == "integer",
            Value::Decimal(_) => wanted == "decimal",
        }
    }

    fn resolve(&self, value: &Value) -> Option<NodeId> {
        match value {
            Value::Node(n) if self.graph.type_name(*n) == "Reference" => {
                self.graph.target(*n).or_else(|| {
                    self.graph
                        .child_text(*n, "reference")
                        .and_then(|url| self.graph.lookup_url(&url))
                })
            }
            Value::String(url) => self.graph.lookup_url(url),
            _ => None,
        }
    }

    /// Primitive view of a value; complex nodes have none.
    fn atom(&self, value: &Value) -> Option<Value> {
        match value {
            Value::Node(n) => self.graph.value(*n).map(|p| match p {
                Primitive::Boolean(b) => Value::Boolean(*b),
                Primitive::Integer(i) => Value::Integer(*i),
                Primitive::Decimal(d) => Value::Decimal(*d),
                Primitive::Text(s) => Value::String(s.clone()),
            }),
            other => Some(other.clone()),
        }
    }

    fn single_text(&self, collection: &[Value]) -> Option<String> {
        match collection {
            [single] => self.atom(single).and_then(|v| text_of(&v)),
            _ => None,
        }
    }

    fn binary(&self, op: BinaryOp, left: Collection, right: Collection) -> Collection {
        match op {
            BinaryOp::Union => {
                let mut out = left;
                for item in right {
                    if !out.contains(&item) {
                        out.push(item);
                    }
                }
                out
            }
            BinaryOp::And => match (truthy(&left), truthy(&right)) {
                (Some(false), _) | (_, Some(false)) => vec![Value::Boolean(false)],
                (Some(true), Some(true)) => vec![Value::Boolean(true)],
                _ => Vec::new(),
            },
            BinaryOp::Or => match (truthy(&left), truthy(&right)) {
                (Some(true), _) | (_, Some(true)) => vec![Value::Boolean(true)],
                (Some(false), Some(false)) => vec![Value::Boolean(false)],
                _ => Vec::new(),
            },
            BinaryOp::Equal | BinaryOp::NotEqual => {
                let (Some(l), Some(r)) = (self.single_atom(&left), self.single_atom(&right)) else {
                    return Vec::new();
                };
                let equal = atoms_equal(&l, &r);
                vec![Value::Boolean(if op == BinaryOp::Equal { equal } else { !equal })]
            }
        }
    }

    fn single_atom(&self, collection: &[Value]) -> Option<Value> {
        match collection {
            [single] => self.atom(single),
            _ => None,
        }
    }
}

fn single_arg<'e>(name: &str, args: &'e [Expr]) -> Result<&'e Expr, String> {
    match args {
        [arg] => Ok(arg),
        _ => Err(format!("{name}() expects exactly one argument")),
    }
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Boolean(b) => Value::Boolean(*b),
        Literal::String(s) => Value::String(s.clone()),
        Literal::Integer(i) => Value::Integer(*i),
        Literal::Decimal(d) => Value::Decimal(*d),
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Node(_) => None,
        Value::Boolean(b) => Some(b.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Decimal(d) => Some(crate::graph::format_decimal(*d)),
    }
}

/// Singleton boolean evaluation; a non-boolean singleton counts as true.
fn truthy(collection: &[Value]) -> Option<bool> {
    match collection {
        [] => None,
        [Value::Boolean(b)] => Some(*b),
        _ => Some(true),
    }
}

fn atoms_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => a == b,
        (Value::Integer(a), Value::Decimal(b)) | (Value::Decimal(b), Value::Integer(a)) => {
            (*a as f64) == *b
        }
        (Value::Decimal(a), Value::Decimal(b)) => a == b,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}
