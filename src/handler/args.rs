//! Typed access to a call's positional arguments.

use serde_json::Value;

use crate::error::{PassthroughError, Result};

/// Positional arguments of a host call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: Vec<Value>,
}

impl Args {
    /// Wrap an argument list.
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw argument, treating JSON `null` as absent.
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index).filter(|v| !v.is_null())
    }

    /// Required string argument.
    pub fn str(&self, index: usize, name: &str) -> Result<&str> {
        match self.value(index) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(wrong_type(name, "a string", other)),
            None => Err(missing(name)),
        }
    }

    /// Optional string argument.
    pub fn opt_str(&self, index: usize, name: &str) -> Result<Option<&str>> {
        match self.value(index) {
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(wrong_type(name, "a string", other)),
            None => Ok(None),
        }
    }

    /// Required integer argument. Integral floats are accepted.
    pub fn int(&self, index: usize, name: &str) -> Result<i64> {
        self.opt_int(index, name)?.ok_or_else(|| missing(name))
    }

    /// Optional integer argument.
    pub fn opt_int(&self, index: usize, name: &str) -> Result<Option<i64>> {
        match self.value(index) {
            None => Ok(None),
            Some(value) => as_int(value)
                .map(Some)
                .ok_or_else(|| wrong_type(name, "an integer", value)),
        }
    }

    /// Required non-negative size argument.
    pub fn size(&self, index: usize, name: &str) -> Result<usize> {
        let n = self.int(index, name)?;
        usize::try_from(n).map_err(|_| {
            PassthroughError::invalid_arg(format!("{} must not be negative (got {})", name, n))
        })
    }
}

fn as_int(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn missing(name: &str) -> PassthroughError {
    PassthroughError::invalid_arg(format!("missing argument: {}", name))
}

fn wrong_type(name: &str, expected: &str, got: &Value) -> PassthroughError {
    PassthroughError::invalid_arg(format!("{} must be {} (got {})", name, expected, got))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Args {
        match value {
            Value::Array(items) => Args::new(items),
            other => Args::new(vec![other]),
        }
    }

    #[test]
    fn test_typed_accessors() {
        let a = args(json!(["file.txt", 3, 4.0, null]));

        assert_eq!(a.str(0, "path").unwrap(), "file.txt");
        assert_eq!(a.int(1, "fd").unwrap(), 3);
        assert_eq!(a.int(2, "length").unwrap(), 4);
        assert_eq!(a.opt_int(3, "position").unwrap(), None);
        assert_eq!(a.opt_str(9, "encoding").unwrap(), None);
    }

    #[test]
    fn test_wrong_type_names_argument() {
        let a = args(json!([1.5, "x"]));

        let err = a.int(0, "length").unwrap_err();
        assert!(err.to_string().contains("length"));
        assert!(a.str(0, "path").is_err());
        assert!(a.int(1, "fd").is_err());
    }

    #[test]
    fn test_missing_required() {
        let a = Args::default();
        assert!(a.is_empty());
        assert!(matches!(
            a.str(0, "path"),
            Err(PassthroughError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_negative_size_rejected() {
        let a = args(json!([-1]));
        assert!(a.size(0, "size").is_err());
        assert_eq!(args(json!([16])).size(0, "size").unwrap(), 16);
    }
}
