//! `#pragma parameter` extraction.
//!
//! Shaders advertise tunables with lines of the form
//!
//! ```text
//! #pragma parameter NAME "Label" default minimum maximum step
//! ```
//!
//! Each declaration becomes a [`Parameter`] whose value is uploaded to the
//! uniform of the same name before the stage draws.

use std::fmt;

/// Upper bound on parameters collected from a single shader.
pub const MAX_PARAMETERS: usize = 32;

const PRAGMA: &str = "#pragma parameter";

/// A tunable declared by a shader.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub label: String,
    pub default: f32,
    pub min: f32,
    pub max: f32,
    pub step: f32,
    value: f32,
}

impl Parameter {
    pub fn new(
        name: impl Into<String>,
        label: impl Into<String>,
        default: f32,
        min: f32,
        max: f32,
        step: f32,
    ) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            default,
            min,
            max,
            step,
            value: default,
        }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    /// Stores `value` clamped to the declared range. Non-finite input is
    /// ignored.
    pub fn set_value(&mut self, value: f32) {
        if !value.is_finite() {
            return;
        }
        let (low, high) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        self.value = value.clamp(low, high);
    }

    pub fn reset(&mut self) {
        self.value = self.default;
    }
}

/// Formats the declaration as a `#pragma parameter` line.
impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PRAGMA} {} \"{}\" {:?} {:?} {:?} {:?}",
            self.name, self.label, self.default, self.min, self.max, self.step
        )
    }
}

/// Parameters of one stage in declaration order.
///
/// Duplicate names are kept as declared; lookups by name resolve to the
/// last declaration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterList {
    params: Vec<Parameter>,
}

impl ParameterList {
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Parameter> {
        self.params.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().rev().find(|param| param.name == name)
    }

    /// Sets every declaration named `name`. Returns `false` if there is none.
    pub fn set_value(&mut self, name: &str, value: f32) -> bool {
        let mut found = false;
        for param in self.params.iter_mut().filter(|param| param.name == name) {
            param.set_value(value);
            found = true;
        }
        found
    }

    /// Restores every declaration named `name` to its default. Returns
    /// `false` if there is none.
    pub fn reset(&mut self, name: &str) -> bool {
        let mut found = false;
        for param in self.params.iter_mut().filter(|param| param.name == name) {
            param.reset();
            found = true;
        }
        found
    }

    /// Carries user-adjusted values over from a previous list, matched by
    /// name, so a shader reload keeps the current tuning.
    pub fn merge_values(&mut self, previous: &ParameterList) {
        for param in &mut self.params {
            if let Some(old) = previous.get(&param.name) {
                param.set_value(old.value());
            }
        }
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = f32> + '_ {
        self.params.iter().map(Parameter::value)
    }
}

impl<'a> IntoIterator for &'a ParameterList {
    type Item = &'a Parameter;
    type IntoIter = std::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PragmaError {
    MissingName,
    MissingLabel,
    UnterminatedLabel,
    MissingNumber(&'static str),
    InvalidNumber(&'static str, String),
    TrailingInput(String),
}

impl fmt::Display for PragmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PragmaError::MissingName => f.write_str("missing parameter name"),
            PragmaError::MissingLabel => f.write_str("missing quoted label"),
            PragmaError::UnterminatedLabel => f.write_str("unterminated label"),
            PragmaError::MissingNumber(field) => write!(f, "missing {field} value"),
            PragmaError::InvalidNumber(field, token) => {
                write!(f, "invalid {field} value '{token}'")
            }
            PragmaError::TrailingInput(rest) => write!(f, "unexpected trailing input '{rest}'"),
        }
    }
}

/// Collects up to `capacity` parameter declarations from `source`.
///
/// Malformed declarations are skipped with a warning; nothing here fails the
/// shader load.
pub fn extract_parameters(source: &str, capacity: usize) -> ParameterList {
    let mut params = Vec::new();
    for (index, line) in source.lines().enumerate() {
        let Some(rest) = line.trim_start().strip_prefix(PRAGMA) else {
            continue;
        };
        // `#pragma parameterize` and friends are not ours.
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            continue;
        }
        if params.len() >= capacity {
            tracing::warn!(
                capacity,
                line = index + 1,
                "shader declares more parameters than supported; ignoring the rest"
            );
            break;
        }
        match parse_declaration(rest) {
            Ok(param) => params.push(param),
            Err(error) => tracing::warn!(
                line = index + 1,
                error = %error,
                "skipping malformed #pragma parameter"
            ),
        }
    }
    ParameterList { params }
}

fn parse_declaration(input: &str) -> Result<Parameter, PragmaError> {
    let input = input.trim_start();
    let name_end = input.find(char::is_whitespace).unwrap_or(input.len());
    let name = &input[..name_end];
    if name.is_empty() || name.starts_with('"') {
        return Err(PragmaError::MissingName);
    }

    let rest = input[name_end..].trim_start();
    let rest = rest.strip_prefix('"').ok_or(PragmaError::MissingLabel)?;
    let label_end = rest.find('"').ok_or(PragmaError::UnterminatedLabel)?;
    let label = &rest[..label_end];

    let mut tokens = rest[label_end + 1..].split_whitespace();
    let mut number = |field: &'static str| -> Result<f32, PragmaError> {
        let token = tokens.next().ok_or(PragmaError::MissingNumber(field))?;
        token
            .parse::<f32>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| PragmaError::InvalidNumber(field, token.to_string()))
    };
    let default = number("default")?;
    let min = number("minimum")?;
    let max = number("maximum")?;
    let step = number("step")?;

    let trailing: Vec<&str> = tokens.collect();
    if !trailing.is_empty() {
        return Err(PragmaError::TrailingInput(trailing.join(" ")));
    }

    Ok(Parameter::new(name, label, default, min, max, step))
}
