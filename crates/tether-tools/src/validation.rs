//! Argument validation rules, derived from JSON schemas or set by hand.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Primitive type a field must have.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl FieldType {
    /// Read a schema `type`. Unions and unknown names accept anything.
    pub fn from_schema(ty: Option<&Value>) -> Self {
        match ty.and_then(Value::as_str) {
            Some("string") => FieldType::String,
            Some("number") => FieldType::Number,
            Some("integer") => FieldType::Integer,
            Some("boolean") => FieldType::Boolean,
            Some("object") => FieldType::Object,
            Some("array") => FieldType::Array,
            _ => FieldType::Any,
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|n| n.fract() == 0.0)
            }
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra check on a present value. Returns an error message on failure.
pub type CustomValidator = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Constraints on one argument field.
#[derive(Clone, Default)]
pub struct ValidationRule {
    pub field: String,
    pub field_type: FieldType,
    pub required: bool,
    /// Filled in when an optional field is missing.
    pub default: Option<Value>,
    pub pattern: Option<Regex>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub allowed: Option<Vec<Value>>,
    pub custom: Option<CustomValidator>,
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("field", &self.field)
            .field("field_type", &self.field_type)
            .field("required", &self.required)
            .field("default", &self.default)
            .field("pattern", &self.pattern.as_ref().map(Regex::as_str))
            .field("min_length", &self.min_length)
            .field("max_length", &self.max_length)
            .field("minimum", &self.minimum)
            .field("maximum", &self.maximum)
            .field("allowed", &self.allowed)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl ValidationRule {
    pub fn new(field: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            field: field.into(),
            field_type,
            ..Self::default()
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.pattern = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn with_length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    pub fn with_range(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }

    pub fn with_allowed(mut self, values: Vec<Value>) -> Self {
        self.allowed = Some(values);
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        self.custom = Some(Arc::new(validator));
        self
    }

    /// Check a present value, appending any failures to `errors`.
    fn check(&self, value: &Value, errors: &mut Vec<String>) {
        let field = &self.field;
        if !self.field_type.matches(value) {
            errors.push(format!("{field} must be of type {}", self.field_type));
            return;
        }

        if let Some(s) = value.as_str() {
            if let Some(pattern) = &self.pattern {
                if !pattern.is_match(s) {
                    errors.push(format!("{field} does not match pattern {}", pattern.as_str()));
                }
            }
            let len = s.chars().count();
            if let Some(min) = self.min_length.filter(|min| len < *min) {
                errors.push(format!("{field} must be at least {min} characters"));
            }
            if let Some(max) = self.max_length.filter(|max| len > *max) {
                errors.push(format!("{field} must be at most {max} characters"));
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.minimum.filter(|min| n < *min) {
                errors.push(format!("{field} must be >= {min}"));
            }
            if let Some(max) = self.maximum.filter(|max| n > *max) {
                errors.push(format!("{field} must be <= {max}"));
            }
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                let options: Vec<String> = allowed.iter().map(Value::to_string).collect();
                errors.push(format!("{field} must be one of [{}]", options.join(", ")));
            }
        }

        if let Some(message) = self.custom.as_ref().and_then(|check| check(value)) {
            errors.push(message);
        }
    }
}

/// Result of validating one argument object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
    /// Arguments with defaults filled in.
    pub processed_args: Value,
}

/// Derive one rule per property of an object schema.
///
/// Rules come out in property name order. An invalid `pattern` is dropped
/// with a warning rather than rejecting the whole tool.
pub fn rules_from_schema(schema: &Value) -> Vec<ValidationRule> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    properties
        .iter()
        .map(|(field, property)| {
            let mut rule = ValidationRule::new(field.clone(), FieldType::from_schema(property.get("type")));
            rule.required = required.contains(&field.as_str());
            rule.default = property.get("default").cloned();
            rule.pattern = property
                .get("pattern")
                .and_then(Value::as_str)
                .and_then(|pattern| match Regex::new(pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::warn!("Ignoring invalid pattern for '{}': {}", field, e);
                        None
                    }
                });
            rule.min_length = schema_usize(property, "minLength");
            rule.max_length = schema_usize(property, "maxLength");
            rule.minimum = property.get("minimum").and_then(Value::as_f64);
            rule.maximum = property.get("maximum").and_then(Value::as_f64);
            rule.allowed = property.get("enum").and_then(Value::as_array).cloned();
            rule
        })
        .collect()
}

fn schema_usize(property: &Value, key: &str) -> Option<usize> {
    property
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
}

/// Validate `args` against `rules`. Never fails; the caller decides what to do
/// with an invalid outcome. Fields without a rule pass through untouched.
pub fn validate_args(rules: &[ValidationRule], args: &Value) -> ValidationOutcome {
    let mut processed = match args {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => {
            return ValidationOutcome {
                valid: false,
                errors: vec!["arguments must be an object".to_string()],
                processed_args: args.clone(),
            };
        }
    };

    let mut errors = Vec::new();
    for rule in rules {
        match processed.get(&rule.field).filter(|v| !v.is_null()) {
            Some(value) => rule.check(value, &mut errors),
            None if rule.required => errors.push(format!("{} is required", rule.field)),
            None => {
                if let Some(default) = &rule.default {
                    processed.insert(rule.field.clone(), default.clone());
                }
            }
        }
    }

    ValidationOutcome {
        valid: errors.is_empty(),
        errors,
        processed_args: Value::Object(processed),
    }
}
