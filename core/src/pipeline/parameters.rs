// rowflow/src/pipeline/parameters.rs

//! Named run parameters and `${NAME}` substitution.
//!
//! A definition declares parameters with optional defaults; the engine context
//! supplies values for one run. Graph building substitutes the merged values
//! into every stage's config blob and error thresholds before validation, so
//! stages only ever see resolved definitions.

use crate::pipeline::definition::{ErrorHandling, PipelineDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::str::FromStr;

/// A parameter a pipeline declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDefinition {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

impl ParameterDefinition {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      default: None,
      description: None,
    }
  }

  pub fn with_default(mut self, value: impl Into<String>) -> Self {
    self.default = Some(value.into());
    self
  }

  pub fn with_description(mut self, text: impl Into<String>) -> Self {
    self.description = Some(text.into());
    self
  }
}

/// Parameter values by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters {
  values: BTreeMap<String, String>,
}

impl Parameters {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style `insert`.
  pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.insert(name, value);
    self
  }

  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.values.insert(name.into(), value.into());
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.values.get(name).map(String::as_str)
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// Declared defaults overlaid with the supplied values.
  ///
  /// Supplied values for names the definition does not declare are kept too.
  pub fn merged(declared: &[ParameterDefinition], supplied: &Parameters) -> Self {
    let mut merged = Parameters::new();
    for parameter in declared {
      if let Some(default) = &parameter.default {
        merged.insert(parameter.name.clone(), default.clone());
      }
    }
    for (name, value) in supplied.iter() {
      merged.insert(name, value);
    }
    merged
  }

  /// Replaces every `${NAME}` with its value. Unknown names stay as written.
  pub fn substitute(&self, text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
      out.push_str(&rest[..start]);
      let after = &rest[start + 2..];
      match after.find('}') {
        Some(end) => {
          let name = &after[..end];
          match self.get(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 1]),
          }
          rest = &after[end + 1..];
        }
        None => {
          out.push_str(&rest[start..]);
          rest = "";
        }
      }
    }
    out.push_str(rest);
    out
  }

  /// Substitutes into every string of a JSON value, keys excluded.
  pub fn substitute_json(&self, value: &JsonValue) -> JsonValue {
    match value {
      JsonValue::String(s) => JsonValue::String(self.substitute(s)),
      JsonValue::Array(items) => JsonValue::Array(items.iter().map(|v| self.substitute_json(v)).collect()),
      JsonValue::Object(map) => JsonValue::Object(
        map
          .iter()
          .map(|(k, v)| (k.clone(), self.substitute_json(v)))
          .collect(),
      ),
      other => other.clone(),
    }
  }

  /// The definition with every stage config and error threshold resolved.
  ///
  /// Thresholds that do not parse after substitution come back as problems.
  pub(crate) fn apply(&self, definition: &PipelineDefinition) -> (PipelineDefinition, Vec<String>) {
    let mut resolved = definition.clone();
    let mut problems = Vec::new();
    for stage in &mut resolved.stages {
      stage.config = self.substitute_json(&stage.config);
      if let Some(handling) = &mut stage.error_handling {
        if let Err(problem) = self.apply_thresholds(handling) {
          problems.push(format!("stage '{}': {}", stage.name, problem));
        }
      }
    }
    (resolved, problems)
  }

  fn apply_thresholds(&self, handling: &mut ErrorHandling) -> Result<(), String> {
    handling.max_errors = handling
      .max_errors
      .as_ref()
      .map(|max| max.resolve(self, "max_errors"))
      .transpose()?;
    handling.max_percent_errors = handling
      .max_percent_errors
      .as_ref()
      .map(|percent| percent.resolve(self, "max_percent_errors"))
      .transpose()?;
    handling.min_rows_for_percent = handling.min_rows_for_percent.resolve(self, "min_rows_for_percent")?;
    Ok(())
  }
}

/// A numeric setting given literally or as text that may reference parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Setting<T> {
  Value(T),
  Expression(String),
}

impl<T: Copy + FromStr> Setting<T> {
  /// The literal value; `None` for an unresolved expression.
  pub fn value(&self) -> Option<T> {
    match self {
      Setting::Value(v) => Some(*v),
      Setting::Expression(_) => None,
    }
  }

  pub fn is_expression(&self) -> bool {
    matches!(self, Setting::Expression(_))
  }

  pub(crate) fn resolve(&self, parameters: &Parameters, what: &str) -> Result<Self, String> {
    match self {
      Setting::Value(v) => Ok(Setting::Value(*v)),
      Setting::Expression(text) => {
        let resolved = parameters.substitute(text);
        resolved
          .trim()
          .parse()
          .map(Setting::Value)
          .map_err(|_| format!("{} '{}' is not a valid number", what, resolved))
      }
    }
  }
}

impl<T> From<T> for Setting<T> {
  fn from(value: T) -> Self {
    Setting::Value(value)
  }
}

impl<T: Default> Default for Setting<T> {
  fn default() -> Self {
    Setting::Value(T::default())
  }
}
