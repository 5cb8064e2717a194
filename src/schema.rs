//! Declarative object schemas for request validation.
//!
//! A schema is a plain value built at composition time and applied per
//! request by the validation layer. Validation never stops at the first
//! failing field: every field is checked and all errors are collected, so a
//! caller fixes its whole payload in one round trip.
//!
//! Two input shapes are supported:
//!
//! - **Structured** ([`ObjectSchema::validate_value`]) - an already-parsed
//!   JSON body. Types are checked, not coerced.
//! - **String maps** ([`ObjectSchema::validate_strings`]) - query strings and
//!   path parameters, where every value arrives as text and is coerced to
//!   the declared kind (`"10"` becomes the integer 10).
//!
//! Successful validation produces a typed `serde_json` object containing
//! only the fields the schema declares; unknown fields are dropped.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

/// Validation failures for a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub errors: Vec<String>,
}

impl FieldError {
    pub fn new(field: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            field: field.into(),
            errors,
        }
    }
}

/// The declared type of a field, with per-kind constraints.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// UTF-8 text with optional length bounds (measured in characters).
    Text {
        min_len: Option<usize>,
        max_len: Option<usize>,
    },
    /// Signed integer with optional range bounds.
    Integer { min: Option<i64>, max: Option<i64> },
    /// Boolean; string inputs accept `true/false/1/0`.
    Boolean,
    /// Text restricted to an explicit set of values.
    OneOf(Vec<String>),
    /// Text that must parse as a UUID.
    Uuid,
}

/// A single named field in an [`ObjectSchema`].
#[derive(Debug, Clone)]
pub struct FieldSpec {
    name: String,
    kind: FieldKind,
    required: bool,
}

impl FieldSpec {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Text {
                min_len: None,
                max_len: None,
            },
            required: false,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Integer {
                min: None,
                max: None,
            },
            required: false,
        }
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Boolean,
            required: false,
        }
    }

    pub fn one_of(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::OneOf(values.iter().map(|v| (*v).to_string()).collect()),
            required: false,
        }
    }

    pub fn uuid(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Uuid,
            required: false,
        }
    }

    /// Mark the field as required; absent required fields fail validation.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Minimum length constraint; only meaningful on [`FieldKind::Text`].
    pub fn min_len(mut self, len: usize) -> Self {
        if let FieldKind::Text { min_len, .. } = &mut self.kind {
            *min_len = Some(len);
        }
        self
    }

    /// Maximum length constraint; only meaningful on [`FieldKind::Text`].
    pub fn max_len(mut self, len: usize) -> Self {
        if let FieldKind::Text { max_len, .. } = &mut self.kind {
            *max_len = Some(len);
        }
        self
    }

    /// Minimum value constraint; only meaningful on [`FieldKind::Integer`].
    pub fn min(mut self, value: i64) -> Self {
        if let FieldKind::Integer { min, .. } = &mut self.kind {
            *min = Some(value);
        }
        self
    }

    /// Maximum value constraint; only meaningful on [`FieldKind::Integer`].
    pub fn max(mut self, value: i64) -> Self {
        if let FieldKind::Integer { max, .. } = &mut self.kind {
            *max = Some(value);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check an already-typed JSON value against this field's constraints.
    fn check_value(&self, value: &Value) -> Result<Value, Vec<String>> {
        match &self.kind {
            FieldKind::Text { min_len, max_len } => match value.as_str() {
                Some(s) => {
                    let mut errors = Vec::new();
                    let chars = s.chars().count();
                    if let Some(min) = min_len
                        && chars < *min
                    {
                        if *min == 1 {
                            errors.push("must not be empty".to_string());
                        } else {
                            errors.push(format!("must be at least {min} characters"));
                        }
                    }
                    if let Some(max) = max_len
                        && chars > *max
                    {
                        errors.push(format!("must be at most {max} characters"));
                    }
                    if errors.is_empty() {
                        Ok(Value::String(s.to_string()))
                    } else {
                        Err(errors)
                    }
                }
                None => Err(vec!["must be a string".to_string()]),
            },
            FieldKind::Integer { min, max } => match value.as_i64() {
                Some(n) => self.check_integer_range(n, *min, *max),
                None => Err(vec!["must be an integer".to_string()]),
            },
            FieldKind::Boolean => match value.as_bool() {
                Some(b) => Ok(Value::Bool(b)),
                None => Err(vec!["must be a boolean".to_string()]),
            },
            FieldKind::OneOf(allowed) => match value.as_str() {
                Some(s) if allowed.iter().any(|a| a == s) => Ok(Value::String(s.to_string())),
                Some(_) => Err(vec![format!("must be one of: {}", allowed.join(", "))]),
                None => Err(vec!["must be a string".to_string()]),
            },
            FieldKind::Uuid => match value.as_str() {
                Some(s) if uuid::Uuid::parse_str(s).is_ok() => Ok(Value::String(s.to_string())),
                Some(_) => Err(vec!["must be a valid UUID".to_string()]),
                None => Err(vec!["must be a string".to_string()]),
            },
        }
    }

    /// Coerce a raw string (query/path value) to the declared kind, then
    /// apply the same constraints as [`Self::check_value`].
    fn coerce_str(&self, raw: &str) -> Result<Value, Vec<String>> {
        match &self.kind {
            FieldKind::Integer { min, max } => match raw.parse::<i64>() {
                Ok(n) => self.check_integer_range(n, *min, *max),
                Err(_) => Err(vec!["must be an integer".to_string()]),
            },
            FieldKind::Boolean => match raw {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(vec!["must be a boolean".to_string()]),
            },
            // Text, OneOf and Uuid validate the string as-is
            _ => self.check_value(&Value::String(raw.to_string())),
        }
    }

    fn check_integer_range(
        &self,
        n: i64,
        min: Option<i64>,
        max: Option<i64>,
    ) -> Result<Value, Vec<String>> {
        let mut errors = Vec::new();
        if let Some(min) = min
            && n < min
        {
            errors.push(format!("must be at least {min}"));
        }
        if let Some(max) = max
            && n > max
        {
            errors.push(format!("must be at most {max}"));
        }
        if errors.is_empty() {
            Ok(Value::Number(n.into()))
        } else {
            Err(errors)
        }
    }
}

/// A declarative schema over a flat JSON object.
#[derive(Debug, Clone, Default)]
pub struct ObjectSchema {
    fields: Vec<FieldSpec>,
}

impl ObjectSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field to the schema (chainable).
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validate a parsed JSON value (a request body).
    ///
    /// The value must be a JSON object; each declared field is type checked
    /// against its kind. All failing fields are reported together.
    pub fn validate_value(&self, value: &Value) -> Result<Value, Vec<FieldError>> {
        let Some(object) = value.as_object() else {
            return Err(vec![FieldError::new(
                "body",
                vec!["must be a JSON object".to_string()],
            )]);
        };

        let mut errors = Vec::new();
        let mut validated = Map::new();

        for spec in &self.fields {
            match object.get(spec.name()) {
                Some(Value::Null) | None => {
                    if spec.required {
                        errors.push(FieldError::new(
                            spec.name(),
                            vec!["is required".to_string()],
                        ));
                    }
                }
                Some(raw) => match spec.check_value(raw) {
                    Ok(typed) => {
                        validated.insert(spec.name().to_string(), typed);
                    }
                    Err(field_errors) => errors.push(FieldError::new(spec.name(), field_errors)),
                },
            }
        }

        if errors.is_empty() {
            Ok(Value::Object(validated))
        } else {
            Err(errors)
        }
    }

    /// Validate a map of raw strings (query string or path parameters),
    /// coercing each value to its declared kind.
    pub fn validate_strings(&self, raw: &HashMap<String, String>) -> Result<Value, Vec<FieldError>> {
        let mut errors = Vec::new();
        let mut validated = Map::new();

        for spec in &self.fields {
            match raw.get(spec.name()) {
                None => {
                    if spec.required {
                        errors.push(FieldError::new(
                            spec.name(),
                            vec!["is required".to_string()],
                        ));
                    }
                }
                Some(value) => match spec.coerce_str(value) {
                    Ok(typed) => {
                        validated.insert(spec.name().to_string(), typed);
                    }
                    Err(field_errors) => errors.push(FieldError::new(spec.name(), field_errors)),
                },
            }
        }

        if errors.is_empty() {
            Ok(Value::Object(validated))
        } else {
            Err(errors)
        }
    }
}

/// Parse an URL-encoded query string into a string map.
///
/// Later duplicates win; keys without `=` map to the empty string, matching
/// how most servers treat bare flags like `?verbose`.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => {
                map.insert(url_decode(key), url_decode(value));
            }
            None => {
                map.insert(url_decode(pair), String::new());
            }
        }
    }
    map
}

/// Minimal percent-decoding for query components.
///
/// Invalid escape sequences pass through untouched rather than failing the
/// whole request; the schema layer will reject the value if it matters.
fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes.get(i) {
            Some(b'%') => {
                let pair = bytes.get(i + 1..i + 3).and_then(|hex| {
                    std::str::from_utf8(hex)
                        .ok()
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                });
                match pair {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            Some(b'+') => {
                out.push(b' ');
                i += 1;
            }
            Some(b) => {
                out.push(*b);
                i += 1;
            }
            None => break,
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}
