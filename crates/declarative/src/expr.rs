//! Expression parsing and evaluation
//!
//! Property values and condition bodies may contain intrinsic functions,
//! written as single-key objects:
//!
//! | Form | Meaning |
//! |------|---------|
//! | `{"Ref": "Name"}` | parameter, pseudo parameter, or resource physical id |
//! | `{"Fn::GetAtt": ["Res", "Attr"]}` | attribute of another resource |
//! | `{"Fn::Sub": "text ${Name} ${Res.Attr}"}` | substitution; `${!x}` is a literal `${x}` |
//! | `{"Fn::If": ["Cond", a, b]}` | pick a branch by condition |
//! | `{"Fn::Equals": [a, b]}`, `Fn::Not`, `Fn::And`, `Fn::Or` | boolean logic |
//! | `{"Condition": "Name"}` | value of a condition |
//! | `{"Fn::Join": ["sep", [..]]}` | string join |
//!
//! `{"Ref": "Stack::NoValue"}` evaluates to [`Evaluated::Omit`], which drops
//! the enclosing map entry or list element from the resolved tree.
//!
//! Evaluation is pure: the result depends only on parameters, conditions and
//! what the [`AttributeSource`] answers.

use crate::error::ResolutionError;
use crate::template::NO_VALUE;
use crate::types::{PropertyValue, ResolvedProperties};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(!?)([^}]*)\}").unwrap_or_else(|e| panic!("invalid placeholder regex: {e}"))
});

/// A parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Scalar value (string, number, bool, null)
    Literal(Value),
    List(Vec<Expr>),
    Map(BTreeMap<String, Expr>),
    Ref(String),
    GetAtt {
        resource: String,
        attribute: String,
    },
    Sub {
        parts: Vec<SubPart>,
        vars: BTreeMap<String, Expr>,
    },
    If {
        condition: String,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Equals(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Condition(String),
    Join {
        separator: String,
        items: Box<Expr>,
    },
}

/// Piece of an `Fn::Sub` template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubPart {
    Text(String),
    Placeholder(String),
}

/// A name an expression depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'a> {
    Ref(&'a str),
    GetAtt(&'a str, &'a str),
    /// A `${...}` placeholder not bound by the substitution's own variables
    Placeholder(&'a str),
    Condition(&'a str),
}

impl Reference<'_> {
    /// Resource a reference would point at, if the name is a resource
    pub fn target(&self) -> Option<&str> {
        match *self {
            Reference::Ref(name) => Some(name),
            Reference::GetAtt(resource, _) => Some(resource),
            Reference::Placeholder(name) => {
                Some(name.split_once('.').map_or(name, |(resource, _)| resource))
            }
            Reference::Condition(_) => None,
        }
    }
}

fn invalid(from: &str, message: impl Into<String>) -> ResolutionError {
    ResolutionError::InvalidExpression {
        from: from.to_string(),
        message: message.into(),
    }
}

fn string_arg<'v>(arg: &'v Value, from: &str, function: &str) -> Result<&'v str, ResolutionError> {
    arg.as_str()
        .ok_or_else(|| invalid(from, format!("{function} expects a string")))
}

fn array_arg<'v>(
    arg: &'v Value,
    from: &str,
    function: &str,
    len: usize,
) -> Result<&'v [Value], ResolutionError> {
    match arg {
        Value::Array(items) if items.len() == len => Ok(items),
        _ => Err(invalid(
            from,
            format!("{function} expects a list of {len} arguments"),
        )),
    }
}

impl Expr {
    /// Parse a raw template value
    ///
    /// `from` names the template element being parsed and is used in errors.
    pub fn parse(value: &Value, from: &str) -> Result<Self, ResolutionError> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(|item| Self::parse(item, from))
                .collect::<Result<_, _>>()
                .map(Expr::List),
            Value::Object(map) => {
                if map.len() == 1
                    && let Some((name, arg)) = map.iter().next()
                    && let Some(expr) = Self::parse_intrinsic(name, arg, from)?
                {
                    return Ok(expr);
                }
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Self::parse(v, from)?)))
                    .collect::<Result<_, _>>()
                    .map(Expr::Map)
            }
            scalar => Ok(Expr::Literal(scalar.clone())),
        }
    }

    /// Parse every entry of a mapping
    pub fn parse_map(
        values: &BTreeMap<String, Value>,
        from: &str,
    ) -> Result<BTreeMap<String, Self>, ResolutionError> {
        values
            .iter()
            .map(|(k, v)| Ok((k.clone(), Self::parse(v, from)?)))
            .collect()
    }

    fn parse_intrinsic(name: &str, arg: &Value, from: &str) -> Result<Option<Self>, ResolutionError> {
        let expr = match name {
            "Ref" => Expr::Ref(string_arg(arg, from, "Ref")?.to_string()),
            // A property map that happens to have a single "Condition" key is
            // only an intrinsic when its value is a name.
            "Condition" => match arg.as_str() {
                Some(condition) => Expr::Condition(condition.to_string()),
                None => return Ok(None),
            },
            "Fn::GetAtt" => {
                let pair = match arg {
                    Value::String(s) => s.split_once('.'),
                    Value::Array(parts) if parts.len() == 2 => parts[0].as_str().zip(parts[1].as_str()),
                    _ => None,
                };
                let (resource, attribute) = pair.ok_or_else(|| {
                    invalid(
                        from,
                        "Fn::GetAtt expects [resource, attribute] or \"resource.attribute\"",
                    )
                })?;
                Expr::GetAtt {
                    resource: resource.to_string(),
                    attribute: attribute.to_string(),
                }
            }
            "Fn::Sub" => {
                let (text, vars) = match arg {
                    Value::String(s) => (s.as_str(), BTreeMap::new()),
                    Value::Array(parts) if parts.len() == 2 => {
                        let text = string_arg(&parts[0], from, "Fn::Sub")?;
                        let Value::Object(vars) = &parts[1] else {
                            return Err(invalid(from, "Fn::Sub variables must be a mapping"));
                        };
                        let vars = vars
                            .iter()
                            .map(|(k, v)| Ok((k.clone(), Self::parse(v, from)?)))
                            .collect::<Result<_, ResolutionError>>()?;
                        (text, vars)
                    }
                    _ => {
                        return Err(invalid(
                            from,
                            "Fn::Sub expects a string or [string, {variables}]",
                        ));
                    }
                };
                Expr::Sub {
                    parts: split_placeholders(text, from)?,
                    vars,
                }
            }
            "Fn::If" => {
                let args = array_arg(arg, from, "Fn::If", 3)?;
                Expr::If {
                    condition: string_arg(&args[0], from, "Fn::If condition")?.to_string(),
                    then: Box::new(Self::parse(&args[1], from)?),
                    otherwise: Box::new(Self::parse(&args[2], from)?),
                }
            }
            "Fn::Equals" => {
                let args = array_arg(arg, from, "Fn::Equals", 2)?;
                Expr::Equals(
                    Box::new(Self::parse(&args[0], from)?),
                    Box::new(Self::parse(&args[1], from)?),
                )
            }
            "Fn::Not" => {
                let args = array_arg(arg, from, "Fn::Not", 1)?;
                Expr::Not(Box::new(Self::parse(&args[0], from)?))
            }
            "Fn::And" | "Fn::Or" => {
                let items = match arg {
                    Value::Array(items) if !items.is_empty() => items
                        .iter()
                        .map(|item| Self::parse(item, from))
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => return Err(invalid(from, format!("{name} expects a non-empty list"))),
                };
                if name == "Fn::And" {
                    Expr::And(items)
                } else {
                    Expr::Or(items)
                }
            }
            "Fn::Join" => {
                let args = array_arg(arg, from, "Fn::Join", 2)?;
                Expr::Join {
                    separator: string_arg(&args[0], from, "Fn::Join separator")?.to_string(),
                    items: Box::new(Self::parse(&args[1], from)?),
                }
            }
            other if other.starts_with("Fn::") => {
                return Err(invalid(from, format!("unknown function '{other}'")));
            }
            _ => return Ok(None),
        };
        Ok(Some(expr))
    }

    /// Visit every reference in the tree
    ///
    /// With `chosen` conditions, only the selected branch of each `Fn::If`
    /// is visited; otherwise both branches are.
    pub fn visit<'e>(
        &'e self,
        chosen: Option<&BTreeMap<String, bool>>,
        f: &mut dyn FnMut(Reference<'e>),
    ) {
        match self {
            Expr::Literal(_) => {}
            Expr::List(items) | Expr::And(items) | Expr::Or(items) => {
                for item in items {
                    item.visit(chosen, f);
                }
            }
            Expr::Map(entries) => {
                for value in entries.values() {
                    value.visit(chosen, f);
                }
            }
            Expr::Ref(name) => f(Reference::Ref(name)),
            Expr::GetAtt {
                resource,
                attribute,
            } => f(Reference::GetAtt(resource, attribute)),
            Expr::Sub { parts, vars } => {
                for part in parts {
                    if let SubPart::Placeholder(name) = part
                        && !vars.contains_key(name)
                    {
                        f(Reference::Placeholder(name));
                    }
                }
                for value in vars.values() {
                    value.visit(chosen, f);
                }
            }
            Expr::If {
                condition,
                then,
                otherwise,
            } => {
                f(Reference::Condition(condition));
                match chosen.and_then(|c| c.get(condition)) {
                    Some(true) => then.visit(chosen, f),
                    Some(false) => otherwise.visit(chosen, f),
                    None => {
                        then.visit(chosen, f);
                        otherwise.visit(chosen, f);
                    }
                }
            }
            Expr::Equals(a, b) => {
                a.visit(chosen, f);
                b.visit(chosen, f);
            }
            Expr::Not(inner) => inner.visit(chosen, f),
            Expr::Condition(name) => f(Reference::Condition(name)),
            Expr::Join { items, .. } => items.visit(chosen, f),
        }
    }

    /// Every reference in the tree, in visit order
    pub fn references(&self, chosen: Option<&BTreeMap<String, bool>>) -> Vec<Reference<'_>> {
        let mut refs = Vec::new();
        self.visit(chosen, &mut |r| refs.push(r));
        refs
    }
}

/// Split an `Fn::Sub` template into text and placeholders
fn split_placeholders(text: &str, from: &str) -> Result<Vec<SubPart>, ResolutionError> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(text) {
        let (Some(whole), Some(bang), Some(name)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        literal.push_str(&text[last..whole.start()]);
        last = whole.end();

        if !bang.as_str().is_empty() {
            literal.push_str("${");
            literal.push_str(name.as_str());
            literal.push('}');
            continue;
        }

        let name = name.as_str().trim();
        if name.is_empty() {
            return Err(invalid(from, "empty placeholder '${}'"));
        }
        if !literal.is_empty() {
            parts.push(SubPart::Text(std::mem::take(&mut literal)));
        }
        parts.push(SubPart::Placeholder(name.to_string()));
    }

    literal.push_str(&text[last..]);
    if !literal.is_empty() {
        parts.push(SubPart::Text(literal));
    }
    Ok(parts)
}

// ============================================================================
// Static reference checks
// ============================================================================

/// Names declared by a template, for checking references before evaluation
#[derive(Debug, Default)]
pub struct DeclaredNames {
    /// Parameters and pseudo parameters
    pub parameters: BTreeSet<String>,
    pub resources: BTreeSet<String>,
    pub conditions: BTreeSet<String>,
}

impl DeclaredNames {
    /// Check every reference in `expr`, across all branches
    pub fn check(&self, expr: &Expr, from: &str) -> Result<(), ResolutionError> {
        let mut first_error = None;
        expr.visit(None, &mut |reference| {
            if first_error.is_none() {
                first_error = self.check_reference(reference, from).err();
            }
        });
        first_error.map_or(Ok(()), Err)
    }

    fn check_reference(&self, reference: Reference<'_>, from: &str) -> Result<(), ResolutionError> {
        let unresolved = |target: &str| ResolutionError::UnresolvedReference {
            from: from.to_string(),
            target: target.to_string(),
        };
        match reference {
            Reference::Ref(name) => {
                if name == NO_VALUE
                    || self.parameters.contains(name)
                    || self.resources.contains(name)
                {
                    Ok(())
                } else {
                    Err(unresolved(name))
                }
            }
            Reference::GetAtt(resource, _) => {
                if self.resources.contains(resource) {
                    Ok(())
                } else {
                    Err(unresolved(resource))
                }
            }
            Reference::Placeholder(name) => {
                let known = self.parameters.contains(name)
                    || self.resources.contains(name)
                    || name
                        .split_once('.')
                        .is_some_and(|(resource, _)| self.resources.contains(resource));
                if known {
                    Ok(())
                } else {
                    Err(ResolutionError::UnknownPlaceholder {
                        from: from.to_string(),
                        placeholder: name.to_string(),
                    })
                }
            }
            Reference::Condition(name) => {
                if self.conditions.contains(name) {
                    Ok(())
                } else {
                    Err(ResolutionError::UnknownCondition {
                        from: from.to_string(),
                        condition: name.to_string(),
                    })
                }
            }
        }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// Outcome of evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluated {
    Known(Value),
    /// Depends on something only known after apply
    Unknown,
    /// Drop the enclosing map entry or list element
    Omit,
}

/// Answer from an [`AttributeSource`]
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Known(Value),
    /// The resource exists in the graph but the value is not known yet
    Unknown,
    /// No such resource or attribute
    Missing,
}

/// Physical ids and attributes of other resources
pub trait AttributeSource {
    fn physical_id(&self, logical_id: &str) -> Lookup;
    fn attribute(&self, logical_id: &str, attribute: &str) -> Lookup;
}

/// Source with no resources, used when evaluating conditions
pub struct NoResources;

impl AttributeSource for NoResources {
    fn physical_id(&self, _logical_id: &str) -> Lookup {
        Lookup::Missing
    }

    fn attribute(&self, _logical_id: &str, _attribute: &str) -> Lookup {
        Lookup::Missing
    }
}

/// Evaluates expressions against parameters, conditions and resources
pub struct Evaluator<'a> {
    parameters: &'a BTreeMap<String, Value>,
    conditions: &'a BTreeMap<String, bool>,
    resources: &'a dyn AttributeSource,
    strict: bool,
}

impl<'a> Evaluator<'a> {
    /// Evaluator that reports not-yet-known values as [`Evaluated::Unknown`]
    pub fn new(
        parameters: &'a BTreeMap<String, Value>,
        conditions: &'a BTreeMap<String, bool>,
        resources: &'a dyn AttributeSource,
    ) -> Self {
        Self {
            parameters,
            conditions,
            resources,
            strict: false,
        }
    }

    /// Evaluator that fails with `UnavailableAttribute` on unknown values
    pub fn strict(
        parameters: &'a BTreeMap<String, Value>,
        conditions: &'a BTreeMap<String, bool>,
        resources: &'a dyn AttributeSource,
    ) -> Self {
        Self {
            strict: true,
            ..Self::new(parameters, conditions, resources)
        }
    }

    /// Evaluate a top-level property mapping, dropping omitted entries
    pub fn evaluate_properties(
        &self,
        properties: &BTreeMap<String, Expr>,
        from: &str,
    ) -> Result<ResolvedProperties, ResolutionError> {
        let mut resolved = BTreeMap::new();
        for (name, expr) in properties {
            match self.evaluate(expr, from)? {
                Evaluated::Known(value) => {
                    resolved.insert(name.clone(), PropertyValue::Known(value));
                }
                Evaluated::Unknown => {
                    resolved.insert(name.clone(), PropertyValue::Unknown);
                }
                Evaluated::Omit => {}
            }
        }
        Ok(resolved)
    }

    pub fn evaluate(&self, expr: &Expr, from: &str) -> Result<Evaluated, ResolutionError> {
        match expr {
            Expr::Literal(value) => Ok(Evaluated::Known(value.clone())),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                let mut unknown = false;
                for item in items {
                    match self.evaluate(item, from)? {
                        Evaluated::Known(value) => values.push(value),
                        Evaluated::Unknown => unknown = true,
                        Evaluated::Omit => {}
                    }
                }
                Ok(if unknown {
                    Evaluated::Unknown
                } else {
                    Evaluated::Known(Value::Array(values))
                })
            }
            Expr::Map(entries) => {
                let mut values = serde_json::Map::new();
                let mut unknown = false;
                for (key, item) in entries {
                    match self.evaluate(item, from)? {
                        Evaluated::Known(value) => {
                            values.insert(key.clone(), value);
                        }
                        Evaluated::Unknown => unknown = true,
                        Evaluated::Omit => {}
                    }
                }
                Ok(if unknown {
                    Evaluated::Unknown
                } else {
                    Evaluated::Known(Value::Object(values))
                })
            }
            Expr::Ref(name) => {
                if name == NO_VALUE {
                    return Ok(Evaluated::Omit);
                }
                if let Some(value) = self.parameters.get(name) {
                    return Ok(Evaluated::Known(value.clone()));
                }
                let lookup = self.resources.physical_id(name);
                self.settle(lookup, from, name, "Id")
            }
            Expr::GetAtt {
                resource,
                attribute,
            } => self.attribute(resource, attribute, from),
            Expr::Sub { parts, vars } => self.substitute(parts, vars, from),
            Expr::If {
                condition,
                then,
                otherwise,
            } => {
                if self.condition(condition, from)? {
                    self.evaluate(then, from)
                } else {
                    self.evaluate(otherwise, from)
                }
            }
            Expr::Equals(a, b) => {
                let a = self.evaluate(a, from)?;
                let b = self.evaluate(b, from)?;
                match (a, b) {
                    (Evaluated::Known(a), Evaluated::Known(b)) => {
                        Ok(Evaluated::Known(Value::Bool(values_equal(&a, &b))))
                    }
                    (Evaluated::Omit, _) | (_, Evaluated::Omit) => {
                        Err(invalid(from, "Stack::NoValue cannot be compared"))
                    }
                    _ => Ok(Evaluated::Unknown),
                }
            }
            Expr::Not(inner) => Ok(match self.boolean(inner, from)? {
                Some(b) => Evaluated::Known(Value::Bool(!b)),
                None => Evaluated::Unknown,
            }),
            Expr::And(items) => self.fold(items, from, true),
            Expr::Or(items) => self.fold(items, from, false),
            Expr::Condition(name) => Ok(Evaluated::Known(Value::Bool(self.condition(name, from)?))),
            Expr::Join { separator, items } => match self.evaluate(items, from)? {
                Evaluated::Known(Value::Array(values)) => {
                    let texts = values
                        .iter()
                        .map(|v| to_text(v, from))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Evaluated::Known(Value::String(texts.join(separator))))
                }
                Evaluated::Known(_) => Err(invalid(from, "Fn::Join expects a list")),
                Evaluated::Unknown => Ok(Evaluated::Unknown),
                Evaluated::Omit => Err(invalid(from, "Fn::Join cannot join Stack::NoValue")),
            },
        }
    }

    fn condition(&self, name: &str, from: &str) -> Result<bool, ResolutionError> {
        self.conditions
            .get(name)
            .copied()
            .ok_or_else(|| ResolutionError::UnknownCondition {
                from: from.to_string(),
                condition: name.to_string(),
            })
    }

    fn boolean(&self, expr: &Expr, from: &str) -> Result<Option<bool>, ResolutionError> {
        match self.evaluate(expr, from)? {
            Evaluated::Known(Value::Bool(b)) => Ok(Some(b)),
            Evaluated::Unknown => Ok(None),
            Evaluated::Known(other) => Err(invalid(from, format!("expected a boolean, got {other}"))),
            Evaluated::Omit => Err(invalid(from, "expected a boolean, got Stack::NoValue")),
        }
    }

    /// `Fn::And` when `all` is set, `Fn::Or` otherwise
    fn fold(&self, items: &[Expr], from: &str, all: bool) -> Result<Evaluated, ResolutionError> {
        let mut unknown = false;
        for item in items {
            match self.boolean(item, from)? {
                Some(b) if b != all => return Ok(Evaluated::Known(Value::Bool(b))),
                Some(_) => {}
                None => unknown = true,
            }
        }
        Ok(if unknown {
            Evaluated::Unknown
        } else {
            Evaluated::Known(Value::Bool(all))
        })
    }

    fn attribute(&self, resource: &str, attribute: &str, from: &str) -> Result<Evaluated, ResolutionError> {
        if self.resources.physical_id(resource) == Lookup::Missing {
            return Err(ResolutionError::UnresolvedReference {
                from: from.to_string(),
                target: resource.to_string(),
            });
        }
        let lookup = self.resources.attribute(resource, attribute);
        if lookup == Lookup::Missing {
            return Err(ResolutionError::UnavailableAttribute {
                from: from.to_string(),
                resource: resource.to_string(),
                attribute: attribute.to_string(),
            });
        }
        self.settle(lookup, from, resource, attribute)
    }

    /// Turn a lookup into an outcome, failing on unknowns in strict mode
    fn settle(
        &self,
        lookup: Lookup,
        from: &str,
        resource: &str,
        attribute: &str,
    ) -> Result<Evaluated, ResolutionError> {
        match lookup {
            Lookup::Known(value) => Ok(Evaluated::Known(value)),
            Lookup::Unknown if self.strict => Err(ResolutionError::UnavailableAttribute {
                from: from.to_string(),
                resource: resource.to_string(),
                attribute: attribute.to_string(),
            }),
            Lookup::Unknown => Ok(Evaluated::Unknown),
            Lookup::Missing => Err(ResolutionError::UnresolvedReference {
                from: from.to_string(),
                target: resource.to_string(),
            }),
        }
    }

    fn substitute(
        &self,
        parts: &[SubPart],
        vars: &BTreeMap<String, Expr>,
        from: &str,
    ) -> Result<Evaluated, ResolutionError> {
        let mut text = String::new();
        let mut unknown = false;

        for part in parts {
            let name = match part {
                SubPart::Text(t) => {
                    text.push_str(t);
                    continue;
                }
                SubPart::Placeholder(name) => name,
            };

            match self.placeholder(name, vars, from)? {
                Evaluated::Known(value) => text.push_str(&to_text(&value, from)?),
                Evaluated::Unknown => unknown = true,
                Evaluated::Omit => {
                    return Err(invalid(
                        from,
                        format!("placeholder '${{{name}}}' evaluated to Stack::NoValue"),
                    ));
                }
            }
        }

        Ok(if unknown {
            Evaluated::Unknown
        } else {
            Evaluated::Known(Value::String(text))
        })
    }

    /// Resolve a placeholder: local variables, then parameters, then resources
    fn placeholder(
        &self,
        name: &str,
        vars: &BTreeMap<String, Expr>,
        from: &str,
    ) -> Result<Evaluated, ResolutionError> {
        if let Some(expr) = vars.get(name) {
            return self.evaluate(expr, from);
        }
        if let Some(value) = self.parameters.get(name) {
            return Ok(Evaluated::Known(value.clone()));
        }

        let unknown_placeholder = || ResolutionError::UnknownPlaceholder {
            from: from.to_string(),
            placeholder: name.to_string(),
        };

        if let Some((resource, attribute)) = name.split_once('.') {
            if self.resources.physical_id(resource) == Lookup::Missing {
                return Err(unknown_placeholder());
            }
            return self.attribute(resource, attribute, from);
        }

        match self.resources.physical_id(name) {
            Lookup::Missing => Err(unknown_placeholder()),
            lookup => self.settle(lookup, from, name, "Id"),
        }
    }
}

/// Numbers compare by value so that `3` equals `3.0`
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn to_text(value: &Value, from: &str) -> Result<String, ResolutionError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        Value::Array(_) | Value::Object(_) => {
            Err(invalid(from, "a list or mapping cannot be used as text"))
        }
    }
}

// ============================================================================
// Conditions
// ============================================================================

/// Evaluate every declared condition once
///
/// Conditions may refer to parameters and to other conditions. A condition
/// is evaluated after the conditions it refers to, and each result is
/// memoized; a condition reached again while it is still being evaluated is
/// a cycle.
pub fn resolve_conditions(
    definitions: &BTreeMap<String, Expr>,
    parameters: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, bool>, ResolutionError> {
    let mut resolver = ConditionResolver {
        definitions,
        parameters,
        resolved: BTreeMap::new(),
        in_progress: Vec::new(),
    };
    for name in definitions.keys() {
        resolver.resolve(name, name)?;
    }
    Ok(resolver.resolved)
}

struct ConditionResolver<'a> {
    definitions: &'a BTreeMap<String, Expr>,
    parameters: &'a BTreeMap<String, Value>,
    resolved: BTreeMap<String, bool>,
    in_progress: Vec<String>,
}

impl<'a> ConditionResolver<'a> {
    fn resolve(&mut self, name: &str, from: &str) -> Result<bool, ResolutionError> {
        if let Some(value) = self.resolved.get(name) {
            return Ok(*value);
        }
        if let Some(start) = self.in_progress.iter().position(|n| n == name) {
            let mut chain = self.in_progress[start..].to_vec();
            chain.push(name.to_string());
            return Err(ResolutionError::CyclicCondition { chain });
        }

        let definitions = self.definitions;
        let expr = definitions
            .get(name)
            .ok_or_else(|| ResolutionError::UnknownCondition {
                from: from.to_string(),
                condition: name.to_string(),
            })?;

        self.in_progress.push(name.to_string());
        let mut nested = BTreeSet::new();
        expr.visit(None, &mut |reference| {
            if let Reference::Condition(c) = reference {
                nested.insert(c);
            }
        });
        for dependency in nested {
            self.resolve(dependency, name)?;
        }
        self.in_progress.pop();

        let evaluator = Evaluator::new(self.parameters, &self.resolved, &NoResources);
        let value = match evaluator.evaluate(expr, name)? {
            Evaluated::Known(Value::Bool(b)) => b,
            other => {
                return Err(invalid(
                    name,
                    format!("condition must evaluate to a boolean, got {other:?}"),
                ));
            }
        };

        log::debug!("Condition {name} = {value}");
        self.resolved.insert(name.to_string(), value);
        Ok(value)
    }
}
