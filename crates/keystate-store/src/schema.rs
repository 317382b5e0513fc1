//! Composable value schemas
//!
//! A `StateSchema<T>` checks, in order:
//!
//! 1. presence: an absent value fails only if the schema is required
//! 2. type: a value that is not a `T` fails once and nothing else runs
//! 3. rules: every failing rule contributes its message
//! 4. nested schemas: each is run against the value found at its path
//!
//! Errors from a nested schema name the full dotted location, so a schema
//! for `address` holding a required `city` reports `address.city is required`
//! and a failing rule there reports `address.city.<message>`.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use keystate_core::{resolve, NestedPath, StateError, StateResult, StateValue, TypeTag, Value};

use crate::ValidationResult;

const DEFAULT_LABEL: &str = "value";

/// Type-erased schema, so schemas of different `T` can nest and share a registry
pub(crate) trait SchemaCheck: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn collect(&self, value: Option<&Value>, location: Option<&str>, errors: &mut Vec<String>);
}

struct Rule<T> {
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    message: String,
}

/// Validator for values of type `T`
pub struct StateSchema<T> {
    label: String,
    required: bool,
    rules: Vec<Rule<T>>,
    nested: Vec<(NestedPath, Arc<dyn SchemaCheck>)>,
    _tag: PhantomData<fn() -> T>,
}

impl<T: StateValue> StateSchema<T> {
    pub fn new(_tag: TypeTag<T>) -> Self {
        StateSchema {
            label: DEFAULT_LABEL.to_string(),
            required: false,
            rules: Vec::new(),
            nested: Vec::new(),
            _tag: PhantomData,
        }
    }

    /// Fluent construction with deferred argument errors
    pub fn builder(tag: TypeTag<T>) -> SchemaBuilder<T> {
        SchemaBuilder {
            schema: StateSchema::new(tag),
            error: None,
        }
    }

    /// Mark the value mandatory
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Name used for the value in top-level error messages
    pub fn named(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Append a rule; the message must not be empty
    pub fn add_rule<F>(mut self, predicate: F, message: impl Into<String>) -> StateResult<Self>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.push_rule(Arc::new(predicate), message.into())?;
        Ok(self)
    }

    /// Validate the value found at `path` with `schema`
    pub fn add_nested_schema<U: StateValue>(
        mut self,
        path: &str,
        schema: StateSchema<U>,
    ) -> StateResult<Self> {
        self.push_nested(path, Arc::new(schema))?;
        Ok(self)
    }

    fn push_rule(
        &mut self,
        predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
        message: String,
    ) -> StateResult<()> {
        if message.trim().is_empty() {
            return Err(StateError::invalid_argument("rule message must not be empty"));
        }
        self.rules.push(Rule { predicate, message });
        Ok(())
    }

    fn push_nested(&mut self, path: &str, schema: Arc<dyn SchemaCheck>) -> StateResult<()> {
        let path = NestedPath::parse(path)?;
        match self.nested.iter_mut().find(|(p, _)| *p == path) {
            Some(entry) => entry.1 = schema,
            None => self.nested.push((path, schema)),
        }
        Ok(())
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn nested_count(&self) -> usize {
        self.nested.len()
    }

    /// Validate a stored value
    pub fn validate(&self, value: Option<&Value>) -> ValidationResult {
        let mut errors = Vec::new();
        self.check(value, None, &mut errors);
        ValidationResult::from_errors(errors)
    }

    /// Validate a typed value
    pub fn validate_typed(&self, value: Option<&T>) -> ValidationResult
    where
        T: Clone,
    {
        let value = value.map(|v| v.clone().into_value());
        self.validate(value.as_ref())
    }

    fn check(&self, value: Option<&Value>, location: Option<&str>, errors: &mut Vec<String>) {
        let field = location.unwrap_or(&self.label);

        let Some(value) = value.filter(|v| !v.is_null()) else {
            if self.required {
                errors.push(format!("{field} is required"));
            }
            return;
        };

        let Some(typed) = T::from_value(value) else {
            errors.push(format!("{field} must be of type {}", T::TYPE_NAME));
            return;
        };

        for rule in &self.rules {
            if !(rule.predicate)(&typed) {
                errors.push(match location {
                    Some(location) => format!("{location}.{}", rule.message),
                    None => rule.message.clone(),
                });
            }
        }

        for (path, schema) in &self.nested {
            let child = resolve(value, path);
            let child_location = match location {
                Some(location) => format!("{location}.{path}"),
                None => path.to_string(),
            };
            schema.collect(child, Some(&child_location), errors);
        }
    }
}

impl<T: StateValue> SchemaCheck for StateSchema<T> {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn collect(&self, value: Option<&Value>, location: Option<&str>, errors: &mut Vec<String>) {
        self.check(value, location, errors);
    }
}

impl<T: StateValue> fmt::Debug for StateSchema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSchema")
            .field("type", &T::TYPE_NAME)
            .field("label", &self.label)
            .field("required", &self.required)
            .field("rules", &self.rules.iter().map(|r| &r.message).collect::<Vec<_>>())
            .field(
                "nested",
                &self
                    .nested
                    .iter()
                    .map(|(p, s)| (p.as_str(), s.type_name()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builder for [`StateSchema`]; the first argument error is reported by `build`
pub struct SchemaBuilder<T> {
    schema: StateSchema<T>,
    error: Option<StateError>,
}

impl<T: StateValue> SchemaBuilder<T> {
    pub fn required(mut self) -> Self {
        self.schema.required = true;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.schema.label = label.into();
        self
    }

    pub fn rule<F>(mut self, predicate: F, message: impl Into<String>) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let result = self.schema.push_rule(Arc::new(predicate), message.into());
        self.record(result);
        self
    }

    pub fn nested<U: StateValue>(mut self, path: &str, schema: StateSchema<U>) -> Self {
        let result = self.schema.push_nested(path, Arc::new(schema));
        self.record(result);
        self
    }

    pub fn build(self) -> StateResult<StateSchema<T>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.schema),
        }
    }

    fn record(&mut self, result: StateResult<()>) {
        if let Err(err) = result {
            self.error.get_or_insert(err);
        }
    }
}
