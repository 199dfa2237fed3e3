//! Environment variable parsing with type safety.
//!
//! Provides a type-safe parser for DBC environment variables with
//! validation, error collection, and source tracking.

use super::source::Sourced;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
/// Every getter returns `None` when the variable is unset so callers can
/// keep the value they already have (default or file).
pub struct EnvParser {
    prefix: String,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the DBC_ prefix.
    pub fn new() -> Self {
        Self::with_prefix("DBC_")
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn raw(&self, name: &str) -> Option<(String, String)> {
        let var = self.var_name(name);
        env::var(&var).ok().map(|value| (var, value))
    }

    /// Boolean override.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str) -> Option<Sourced<bool>> {
        let (var, value) = self.raw(name)?;
        match parse_bool(&value) {
            Some(parsed) => Some(Sourced::from_env(parsed, var)),
            None => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Numeric override constrained to `min..=max`.
    pub fn get_range<T>(&mut self, name: &str, min: T, max: T) -> Option<Sourced<T>>
    where
        T: FromStr + PartialOrd + Display + Copy,
    {
        let (var, value) = self.raw(name)?;
        match value.trim().parse::<T>() {
            Ok(n) if n >= min && n <= max => Some(Sourced::from_env(n, var)),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                None
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: format!("integer in {min}..={max}"),
                    value,
                });
                None
            }
        }
    }

    /// Override restricted to a closed set of spellings (enum values).
    pub fn get_choice<T: FromStr>(&mut self, name: &str, expected: &str) -> Option<Sourced<T>> {
        let (var, value) = self.raw(name)?;
        match value.trim().to_lowercase().parse::<T>() {
            Ok(parsed) => Some(Sourced::from_env(parsed, var)),
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: expected.to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Log level override.
    pub fn get_log_level(&mut self, name: &str) -> Option<Sourced<String>> {
        let (var, value) = self.raw(name)?;
        match parse_log_level(&value) {
            Some(level) => Some(Sourced::from_env(level, var)),
            None => {
                self.errors.push(EnvError::InvalidLogLevel { var, value });
                None
            }
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn parse_log_level(value: &str) -> Option<String> {
    let lower = value.trim().to_lowercase();
    match lower.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" | "off" => Some(lower),
        _ => None,
    }
}
