//! # Utility Functions and Helper Module
//!
//! Shared helpers used throughout the bus client: human-readable duration
//! formatting for logs and error messages, validation of API, procedure and
//! event names, conversion of values into wire-safe shapes, and coercion of
//! inbound keyword arguments to declared parameter kinds.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::api::{Parameter, ParameterKind};
use crate::error::BusError;
use crate::message::Kwargs;

/// Format a duration for human eyes
///
/// Picks the largest sensible unit and keeps one decimal place, so a tenth of a
/// second renders as `0.1 seconds` and not as a pile of nanoseconds.
pub fn human_time(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs >= 3600.0 {
        format!("{:.1} hours", secs / 3600.0)
    } else if secs >= 60.0 {
        format!("{:.1} minutes", secs / 60.0)
    } else if secs >= 0.1 {
        format!("{secs:.1} seconds")
    } else {
        format!("{:.1} milliseconds", secs * 1000.0)
    }
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !segment.starts_with(|c: char| c.is_ascii_digit())
}

/// Validate an API name
///
/// API names are dotted paths of identifier segments, e.g. `company.auth`.
/// Segments starting with an underscore are reserved for internal use.
pub fn validate_api_name(api_name: &str) -> Result<(), BusError> {
    let invalid = |reason: &str| BusError::InvalidName {
        kind: "api",
        api_name: api_name.to_string(),
        name: api_name.to_string(),
        reason: reason.to_string(),
    };

    if api_name.is_empty() {
        return Err(invalid("API names may not be empty"));
    }
    for segment in api_name.split('.') {
        if segment.starts_with('_') {
            return Err(invalid("API name segments may not start with an underscore"));
        }
        if !valid_segment(segment) {
            return Err(invalid(
                "API name segments must be identifiers of letters, digits and underscores",
            ));
        }
    }
    Ok(())
}

/// Validate an event or RPC name against an API
///
/// `kind` is `"rpc"` or `"event"` and only affects the error message. Names
/// beginning with an underscore are rejected so internal attributes can never
/// be addressed over the bus.
pub fn validate_event_or_rpc_name(
    api_name: &str,
    kind: &'static str,
    name: &str,
) -> Result<(), BusError> {
    let invalid = |reason: &str| BusError::InvalidName {
        kind,
        api_name: api_name.to_string(),
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("names may not be empty"));
    }
    if name.starts_with('_') {
        return Err(invalid("names may not start with an underscore"));
    }
    if !valid_segment(name) {
        return Err(invalid(
            "names must be identifiers of letters, digits and underscores",
        ));
    }
    Ok(())
}

/// Convert a value into its bus-safe JSON shape
///
/// This is the deforming boundary between user data structures and the wire:
/// anything serialisable becomes a plain JSON value here, and anything that
/// cannot be represented (non-finite floats, map keys that are not strings)
/// is rejected before it reaches a transport.
pub fn deform_to_bus<T: Serialize>(value: &T) -> Result<Value, BusError> {
    serde_json::to_value(value).map_err(|e| BusError::Deform(e.to_string()))
}

/// Deform every value in a kwargs map
pub fn deform_kwargs(kwargs: Kwargs) -> Result<Kwargs, BusError> {
    kwargs
        .into_iter()
        .map(|(key, value)| Ok((key, deform_to_bus(&value)?)))
        .collect()
}

/// Coerce inbound kwargs to the parameter kinds a procedure declares
///
/// Used when `cast_values` is enabled for an API: values arriving over the wire
/// as strings are coerced into the declared numeric or boolean kinds where the
/// conversion is lossless. Values that do not convert are passed through
/// unchanged and left for the procedure to reject. Keys without a declared
/// parameter are passed through untouched.
pub fn cast_to_parameters(kwargs: Kwargs, parameters: &[Parameter]) -> Kwargs {
    kwargs
        .into_iter()
        .map(|(key, value)| {
            let kind = parameters
                .iter()
                .find(|p| p.name == key)
                .map(|p| p.kind)
                .unwrap_or(ParameterKind::Any);
            (key, cast_value(value, kind))
        })
        .collect()
}

fn cast_value(value: Value, kind: ParameterKind) -> Value {
    match (kind, value) {
        (ParameterKind::Integer, Value::String(s)) => match s.parse::<i64>() {
            Ok(n) => Value::from(n),
            Err(_) => Value::String(s),
        },
        (ParameterKind::Integer, Value::Number(n)) => {
            // A float that is exactly integral narrows; anything else stays put.
            match (n.as_i64(), n.as_f64()) {
                (Some(_), _) => Value::Number(n),
                (None, Some(f)) if f.fract() == 0.0 => Value::from(f as i64),
                _ => Value::Number(n),
            }
        }
        (ParameterKind::Float, Value::String(s)) => match s.parse::<f64>() {
            Ok(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::String(s)),
            Err(_) => Value::String(s),
        },
        (ParameterKind::Float, Value::Number(n)) => Value::Number(n),
        (ParameterKind::Boolean, Value::String(s)) => match s.as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => Value::String(s),
        },
        (ParameterKind::Boolean, Value::Number(n)) => match n.as_i64() {
            Some(0) => Value::Bool(false),
            Some(1) => Value::Bool(true),
            _ => Value::Number(n),
        },
        (ParameterKind::String, Value::Number(n)) => Value::String(n.to_string()),
        (ParameterKind::String, Value::Bool(b)) => Value::String(b.to_string()),
        (_, value) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn human_time_picks_sensible_units() {
        assert_eq!(human_time(Duration::from_millis(100)), "0.1 seconds");
        assert_eq!(human_time(Duration::from_millis(5)), "5.0 milliseconds");
        assert_eq!(human_time(Duration::from_secs(9)), "9.0 seconds");
        assert_eq!(human_time(Duration::from_secs(90)), "1.5 minutes");
        assert_eq!(human_time(Duration::from_secs(7200)), "2.0 hours");
    }

    #[test]
    fn api_names_are_dotted_identifiers() {
        assert!(validate_api_name("company.auth").is_ok());
        assert!(validate_api_name("auth").is_ok());
        assert!(validate_api_name("").is_err());
        assert!(validate_api_name("company._internal").is_err());
        assert!(validate_api_name("company.with-dash").is_err());
        assert!(validate_api_name("company..auth").is_err());
    }

    #[test]
    fn rpc_and_event_names_reject_reserved_forms() {
        assert!(validate_event_or_rpc_name("auth", "rpc", "check_password").is_ok());
        assert!(validate_event_or_rpc_name("auth", "rpc", "_private").is_err());
        assert!(validate_event_or_rpc_name("auth", "event", "").is_err());
        assert!(validate_event_or_rpc_name("auth", "event", "bad name").is_err());
    }

    #[test]
    fn casting_coerces_wire_strings() {
        let parameters = vec![
            Parameter {
                name: "age".to_string(),
                kind: ParameterKind::Integer,
            },
            Parameter {
                name: "active".to_string(),
                kind: ParameterKind::Boolean,
            },
            Parameter {
                name: "name".to_string(),
                kind: ParameterKind::String,
            },
        ];

        let mut kwargs = Kwargs::new();
        kwargs.insert("age".to_string(), json!("42"));
        kwargs.insert("active".to_string(), json!("true"));
        kwargs.insert("name".to_string(), json!(7));
        kwargs.insert("extra".to_string(), json!("untouched"));

        let cast = cast_to_parameters(kwargs, &parameters);
        assert_eq!(cast["age"], json!(42));
        assert_eq!(cast["active"], json!(true));
        assert_eq!(cast["name"], json!("7"));
        assert_eq!(cast["extra"], json!("untouched"));
    }

    #[test]
    fn casting_leaves_unconvertible_values_alone() {
        let parameters = vec![Parameter {
            name: "age".to_string(),
            kind: ParameterKind::Integer,
        }];
        let mut kwargs = Kwargs::new();
        kwargs.insert("age".to_string(), json!("not a number"));

        let cast = cast_to_parameters(kwargs, &parameters);
        assert_eq!(cast["age"], json!("not a number"));
    }
}
