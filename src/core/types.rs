//! Shared deterministic types for the orchestrator core.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

/// Declared type of an action return value or CLI argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnType {
    Int,
    String,
    Bool,
    File,
    Directory,
}

impl ReturnType {
    /// Parse a type name as written in definition files (case-insensitive).
    pub fn parse(type_str: &str) -> Result<Self> {
        match type_str.trim().to_ascii_lowercase().as_str() {
            "int" => Ok(Self::Int),
            "string" => Ok(Self::String),
            "bool" => Ok(Self::Bool),
            "file" => Ok(Self::File),
            "directory" => Ok(Self::Directory),
            other => Err(anyhow!(
                "invalid type '{other}' (valid: int, string, bool, file, directory)"
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::String => "string",
            Self::Bool => "bool",
            Self::File => "file",
            Self::Directory => "directory",
        }
    }

    /// Whether values of this type must point at an existing filesystem path.
    pub fn is_path(&self) -> bool {
        matches!(self, Self::File | Self::Directory)
    }
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed output value as recorded in `output.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypedValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl TypedValue {
    /// Coerce a raw JSON value into a `TypedValue` matching `ty`.
    ///
    /// Bash scripts record everything they can as the right JSON kind already,
    /// but restored runs and hand-written output files go through the same
    /// coercion so mismatches fail identically everywhere.
    pub fn coerce(ty: ReturnType, raw: &serde_json::Value) -> Result<Self> {
        match ty {
            ReturnType::Int => match raw {
                serde_json::Value::Number(n) => n
                    .as_i64()
                    .map(Self::Int)
                    .ok_or_else(|| anyhow!("value {n} is not an integer")),
                serde_json::Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Self::Int)
                    .map_err(|_| anyhow!("value '{s}' is not an integer")),
                other => bail!("expected int, got {other}"),
            },
            ReturnType::Bool => match raw {
                serde_json::Value::Bool(b) => Ok(Self::Bool(*b)),
                serde_json::Value::String(s) => match s.trim() {
                    "true" | "1" => Ok(Self::Bool(true)),
                    "false" | "0" => Ok(Self::Bool(false)),
                    other => bail!("value '{other}' is not a bool"),
                },
                other => bail!("expected bool, got {other}"),
            },
            ReturnType::String | ReturnType::File | ReturnType::Directory => match raw {
                serde_json::Value::String(s) => Ok(Self::String(s.clone())),
                serde_json::Value::Number(n) => Ok(Self::String(n.to_string())),
                serde_json::Value::Bool(b) => Ok(Self::String(b.to_string())),
                other => bail!("expected string, got {other}"),
            },
        }
    }

    /// Render the value the way it is substituted into scripts.
    pub fn render(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::String(s) => s.clone(),
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Script language of an action version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Bash,
    Python,
}

impl Language {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim() {
            "bash" => Some(Self::Bash),
            "python" => Some(Self::Python),
            _ => None,
        }
    }

    /// File extension of rendered scripts for this language.
    pub fn script_ext(&self) -> &'static str {
        match self {
            Self::Bash => "sh",
            Self::Python => "py",
        }
    }
}

/// Normalized host platform used by platform conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Linux,
    Macos,
    Windows,
}

impl Platform {
    /// Platform of the running host.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::Macos
        } else {
            Self::Linux
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "linux" => Ok(Self::Linux),
            "macos" => Ok(Self::Macos),
            "windows" => Ok(Self::Windows),
            other => Err(anyhow!(
                "invalid platform '{other}' (valid: windows, linux, macos)"
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Macos => "macos",
            Self::Windows => "windows",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_type_parses_case_insensitively() {
        assert_eq!(ReturnType::parse("INT").expect("parse"), ReturnType::Int);
        assert_eq!(ReturnType::parse(" file ").expect("parse"), ReturnType::File);
        assert!(ReturnType::parse("float").is_err());
    }

    #[test]
    fn coerce_int_accepts_numbers_and_numeric_strings() {
        let v = TypedValue::coerce(ReturnType::Int, &serde_json::json!(42)).expect("coerce");
        assert_eq!(v, TypedValue::Int(42));
        let v = TypedValue::coerce(ReturnType::Int, &serde_json::json!("7")).expect("coerce");
        assert_eq!(v, TypedValue::Int(7));
        assert!(TypedValue::coerce(ReturnType::Int, &serde_json::json!("x")).is_err());
    }

    #[test]
    fn coerce_bool_accepts_bools_and_known_strings() {
        let v = TypedValue::coerce(ReturnType::Bool, &serde_json::json!(true)).expect("coerce");
        assert_eq!(v, TypedValue::Bool(true));
        let v = TypedValue::coerce(ReturnType::Bool, &serde_json::json!("0")).expect("coerce");
        assert_eq!(v, TypedValue::Bool(false));
        assert!(TypedValue::coerce(ReturnType::Bool, &serde_json::json!("maybe")).is_err());
    }

    #[test]
    fn file_values_round_trip_as_strings() {
        let v = TypedValue::coerce(ReturnType::File, &serde_json::json!("out/a.txt"))
            .expect("coerce");
        assert_eq!(v.render(), "out/a.txt");
    }
}
