//! type constraints, defaults and conversion
//!
//! Declarations carry a [TypeConstraint]: the target [Type] plus optional [Defaults] for
//! optional object attributes. Results are coerced by first applying the defaults and then
//! calling [convert]. A failed conversion is reported as a [ConversionError] which callers
//! turn into a diagnostic.
//!
//! Type expressions use the usual constraint syntax:
//!
//! ```hcl
//! type = object({
//!   name  = string
//!   ports = optional(list(number), [])
//!   size  = optional(number, 5)
//! })
//! ```
use crate::value::Value;
use hcl::eval::Evaluate;
use hcl::{Expression, ObjectKey};
use indexmap::{IndexMap, IndexSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Type {
    /// Any type; conversion is the identity
    #[default]
    Dynamic,
    Bool,
    Number,
    String,
    List(Box<Type>),
    Map(Box<Type>),
    Object(ObjectType),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectType {
    pub attributes: IndexMap<String, Type>,
    /// Attributes that may be omitted; they convert to null unless a default fills them in
    pub optional: IndexSet<String>,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Dynamic => f.write_str("any"),
            Type::Bool => f.write_str("bool"),
            Type::Number => f.write_str("number"),
            Type::String => f.write_str("string"),
            Type::List(elem) => write!(f, "list({elem})"),
            Type::Map(elem) => write!(f, "map({elem})"),
            Type::Object(object) => {
                f.write_str("object({")?;
                for (index, (name, ty)) in object.attributes.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    if object.optional.contains(name) {
                        write!(f, "{name} = optional({ty})")?;
                    } else {
                        write!(f, "{name} = {ty}")?;
                    }
                }
                f.write_str("})")
            }
        }
    }
}

/// A declared type plus the defaults for its optional attributes
#[derive(Debug, Clone, PartialEq, Default, derive_new::new)]
pub struct TypeConstraint {
    pub ty: Type,
    pub defaults: Option<Defaults>,
}

impl TypeConstraint {
    /// The "don't know" constraint: accepts any value unchanged
    pub fn dynamic() -> Self {
        Self::default()
    }
}

/// Default values for optional object attributes, nested along the type structure
///
/// For collection types the element defaults are stored under the empty key.
#[derive(Debug, Clone, PartialEq, derive_new::new)]
pub struct Defaults {
    pub ty: Type,
    #[new(default)]
    pub values: IndexMap<String, Value>,
    #[new(default)]
    pub children: IndexMap<String, Defaults>,
}

impl Defaults {
    /// Fills in default values for unset optional attributes
    ///
    /// Unknown and null values are returned unchanged.
    pub fn apply(&self, value: Value) -> Value {
        match (&self.ty, value) {
            (Type::Object(_), Value::Object(mut attrs)) => {
                for (name, default) in &self.values {
                    if attrs.get(name).map_or(true, Value::is_null) {
                        attrs.insert(name.clone(), default.clone());
                    }
                }
                for (name, child) in &self.children {
                    if let Some(attr) = attrs.get_mut(name) {
                        *attr = child.apply(std::mem::take(attr));
                    }
                }
                Value::Object(attrs)
            }
            (Type::List(_), Value::Array(items)) => match self.children.get("") {
                Some(child) => Value::Array(items.into_iter().map(|v| child.apply(v)).collect()),
                None => Value::Array(items),
            },
            (Type::Map(_), Value::Object(entries)) => match self.children.get("") {
                Some(child) => Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k, child.apply(v)))
                        .collect(),
                ),
                None => Value::Object(entries),
            },
            (_, value) => value,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TypeExprError {
    #[error("the keyword {0:?} is not a valid type constructor")]
    UnknownType(String),
    #[error("the {0} type constructor requires one argument specifying the element type")]
    MissingElementType(&'static str),
    #[error("the object type constructor requires one argument specifying the attribute types as an object")]
    InvalidObjectAttributes,
    #[error("optional() may only be used for object attribute types")]
    OptionalOutsideObject,
    #[error("optional() takes a type and, optionally, a default value")]
    InvalidOptional,
    #[error("invalid default value for optional attribute {name:?}: {message}")]
    InvalidDefault { name: String, message: String },
    #[error("a type must be a primitive type keyword or a type constructor call")]
    NotAType,
}

/// Parses a type expression, collecting defaults declared via `optional(type, default)`
pub fn parse_type_constraint(expr: &Expression) -> Result<TypeConstraint, TypeExprError> {
    let (ty, defaults) = parse_type(expr)?;
    Ok(TypeConstraint::new(ty, defaults))
}

fn parse_type(expr: &Expression) -> Result<(Type, Option<Defaults>), TypeExprError> {
    match expr {
        Expression::Variable(keyword) => match keyword.as_str() {
            "any" => Ok((Type::Dynamic, None)),
            "bool" => Ok((Type::Bool, None)),
            "number" => Ok((Type::Number, None)),
            "string" => Ok((Type::String, None)),
            "list" => Err(TypeExprError::MissingElementType("list")),
            "map" => Err(TypeExprError::MissingElementType("map")),
            "object" => Err(TypeExprError::InvalidObjectAttributes),
            other => Err(TypeExprError::UnknownType(other.to_string())),
        },
        Expression::Parenthesis(inner) => parse_type(inner),
        Expression::FuncCall(call) => match call.name.as_str() {
            constructor @ ("list" | "map") => {
                let [elem] = call.args.as_slice() else {
                    return Err(TypeExprError::MissingElementType(if constructor == "list" {
                        "list"
                    } else {
                        "map"
                    }));
                };
                let (elem, elem_defaults) = parse_type(elem)?;
                let ty = if constructor == "list" {
                    Type::List(Box::new(elem))
                } else {
                    Type::Map(Box::new(elem))
                };
                let defaults = elem_defaults.map(|child| {
                    let mut defaults = Defaults::new(ty.clone());
                    defaults.children.insert(String::new(), child);
                    defaults
                });
                Ok((ty, defaults))
            }
            "object" => {
                let [Expression::Object(attrs)] = call.args.as_slice() else {
                    return Err(TypeExprError::InvalidObjectAttributes);
                };
                parse_object_type(attrs)
            }
            "optional" => Err(TypeExprError::OptionalOutsideObject),
            other => Err(TypeExprError::UnknownType(other.to_string())),
        },
        _ => Err(TypeExprError::NotAType),
    }
}

fn parse_object_type(
    attrs: &hcl::Object<ObjectKey, Expression>,
) -> Result<(Type, Option<Defaults>), TypeExprError> {
    let mut object = ObjectType::default();
    let mut values = IndexMap::new();
    let mut children = IndexMap::new();

    for (key, attr_expr) in attrs.iter() {
        let name = object_key_name(key).ok_or(TypeExprError::InvalidObjectAttributes)?;

        let (ty, child) = match attr_expr {
            Expression::FuncCall(call) if call.name.as_str() == "optional" => {
                let (ty_expr, default_expr) = match call.args.as_slice() {
                    [ty_expr] => (ty_expr, None),
                    [ty_expr, default_expr] => (ty_expr, Some(default_expr)),
                    _ => return Err(TypeExprError::InvalidOptional),
                };
                object.optional.insert(name.clone());
                let (ty, child) = parse_type(ty_expr)?;
                if let Some(default_expr) = default_expr {
                    let default = constant_value(default_expr)
                        .and_then(|value| convert(value, &ty).map_err(|err| err.to_string()))
                        .map_err(|message| TypeExprError::InvalidDefault {
                            name: name.clone(),
                            message,
                        })?;
                    values.insert(name.clone(), default);
                }
                (ty, child)
            }
            other => parse_type(other)?,
        };

        if let Some(child) = child {
            children.insert(name.clone(), child);
        }
        object.attributes.insert(name, ty);
    }

    let ty = Type::Object(object);
    let defaults = (!values.is_empty() || !children.is_empty()).then(|| Defaults {
        ty: ty.clone(),
        values,
        children,
    });
    Ok((ty, defaults))
}

fn object_key_name(key: &ObjectKey) -> Option<String> {
    match key {
        ObjectKey::Identifier(ident) => Some(ident.to_string()),
        ObjectKey::Expression(Expression::String(s)) => Some(s.clone()),
        ObjectKey::Expression(Expression::Variable(var)) => Some(var.to_string()),
        _ => None,
    }
}

/// Evaluates an expression that must not reference anything
pub(crate) fn constant_value(expr: &Expression) -> Result<Value, String> {
    expr.evaluate(&hcl::eval::Context::new())
        .map(Value::from)
        .map_err(|errors| errors.to_string())
}

/// Why a value could not be converted, and where inside the value
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionError {
    /// e.g. `.ports[1]`, empty for the top-level value
    pub path: String,
    pub message: String,
}

impl std::error::Error for ConversionError {}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Converts `value` to `ty`
///
/// Follows the usual lenient rules: numbers and bools convert to strings and back, extra
/// object attributes are dropped, omitted optional attributes become null.
pub fn convert(value: Value, ty: &Type) -> Result<Value, ConversionError> {
    convert_at(value, ty, &mut String::new())
}

fn convert_at(value: Value, ty: &Type, path: &mut String) -> Result<Value, ConversionError> {
    let mismatch = |path: &String, message: String| ConversionError {
        path: path.clone(),
        message,
    };

    match (ty, value) {
        (Type::Dynamic, value) => Ok(value),
        (ty, Value::Unknown(from)) => {
            if convertible(&from, ty) {
                Ok(Value::Unknown(ty.clone()))
            } else {
                Err(mismatch(path, required(ty)))
            }
        }
        (_, Value::Null) => Ok(Value::Null),

        (Type::Bool, Value::Boolean(b)) => Ok(Value::Boolean(b)),
        (Type::Bool, Value::String(s)) if s == "true" || s == "false" => {
            Ok(Value::Boolean(s == "true"))
        }
        (Type::Bool, _) => Err(mismatch(path, "bool required".into())),

        (Type::Number, value @ (Value::Integer(_) | Value::Decimal(_))) => Ok(value),
        (Type::Number, Value::String(s)) => {
            if let Ok(int) = s.parse::<i64>() {
                Ok(Value::Integer(int))
            } else if let Some(decimal) = s.parse::<f64>().ok().filter(|d| d.is_finite()) {
                Ok(Value::Decimal(decimal))
            } else {
                Err(mismatch(path, "a number is required".into()))
            }
        }
        (Type::Number, _) => Err(mismatch(path, "a number is required".into())),

        (Type::String, Value::String(s)) => Ok(Value::String(s)),
        (Type::String, Value::Integer(i)) => Ok(Value::String(i.to_string())),
        (Type::String, Value::Decimal(d)) => Ok(Value::String(d.to_string())),
        (Type::String, Value::Boolean(b)) => Ok(Value::String(b.to_string())),
        (Type::String, _) => Err(mismatch(path, "string required".into())),

        (Type::List(elem), Value::Array(items)) => {
            let mut converted = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let len = path.len();
                path.push_str(&format!("[{index}]"));
                converted.push(convert_at(item, elem, path)?);
                path.truncate(len);
            }
            Ok(Value::Array(converted))
        }
        (Type::List(elem), _) => Err(mismatch(path, format!("list of {elem} required"))),

        (Type::Map(elem), Value::Object(entries)) => {
            let mut converted = IndexMap::with_capacity(entries.len());
            for (key, entry) in entries {
                let len = path.len();
                path.push_str(&format!("[{key:?}]"));
                let entry = convert_at(entry, elem, path)?;
                path.truncate(len);
                converted.insert(key, entry);
            }
            Ok(Value::Object(converted))
        }
        (Type::Map(elem), _) => Err(mismatch(path, format!("map of {elem} required"))),

        (Type::Object(object), Value::Object(mut attrs)) => {
            let mut converted = IndexMap::with_capacity(object.attributes.len());
            for (name, attr_ty) in &object.attributes {
                match attrs.shift_remove(name) {
                    Some(attr) => {
                        let len = path.len();
                        path.push_str(&format!(".{name}"));
                        let attr = convert_at(attr, attr_ty, path)?;
                        path.truncate(len);
                        converted.insert(name.clone(), attr);
                    }
                    None if object.optional.contains(name) => {
                        converted.insert(name.clone(), Value::Null);
                    }
                    None => {
                        return Err(mismatch(path, format!("attribute {name:?} is required")))
                    }
                }
            }
            Ok(Value::Object(converted))
        }
        (Type::Object(_), _) => Err(mismatch(path, "object required".into())),
    }
}

/// The message for a value that isn't convertible to `ty`
fn required(ty: &Type) -> String {
    match ty {
        Type::Dynamic => "any value required".into(),
        Type::Bool => "bool required".into(),
        Type::Number => "a number is required".into(),
        Type::String => "string required".into(),
        Type::List(elem) => format!("list of {elem} required"),
        Type::Map(elem) => format!("map of {elem} required"),
        Type::Object(_) => "object required".into(),
    }
}

/// Whether some value of type `from` may convert to `to`
///
/// Primitives are treated as convertible into each other, whether a string really holds a
/// number or bool is only known once the value is.
fn convertible(from: &Type, to: &Type) -> bool {
    use Type::*;

    match (from, to) {
        (Dynamic, _) | (_, Dynamic) => true,
        (Bool | Number | String, Bool | Number | String) => true,
        (List(from), List(to)) | (Map(from), Map(to)) => convertible(from, to),
        (Object(from), Map(to)) => from.attributes.values().all(|attr| convertible(attr, to)),
        (Object(from), Object(to)) => to.attributes.iter().all(|(name, ty)| {
            match from.attributes.get(name) {
                Some(attr) => convertible(attr, ty),
                None => to.optional.contains(name),
            }
        }),
        _ => false,
    }
}
