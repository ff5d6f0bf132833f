//! Codec module - payload serialization for invocation bodies.
//!
//! The wire engine treats bodies as opaque bytes; everything
//! payload-shaped goes through the [`BodyCodec`] trait so the object-graph
//! format can be swapped without touching framing or connection code.
//!
//! [`MsgPackBodyCodec`] is the bundled implementation (self-describing
//! maps via `rmp-serde`, `to_vec_named` for cross-language field names).

mod msgpack;

use std::collections::HashMap;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::error::{DubboError, Result};

pub use msgpack::MsgPackBodyCodec;

/// First body byte of a response.
pub mod markers {
    /// Body carries a remote exception.
    pub const RESPONSE_EXCEPTION: u8 = 0x90;
    /// Body carries a return value.
    pub const RESPONSE_VALUE: u8 = 0x91;
    /// Void return, no value follows.
    pub const RESPONSE_NULL: u8 = 0x92;
}

/// JVM type codes for primitive argument classes.
const PRIMITIVE_CODES: [(&str, char); 6] = [
    ("boolean", 'Z'),
    ("int", 'I'),
    ("short", 'S'),
    ("long", 'J'),
    ("double", 'D'),
    ("float", 'F'),
];

/// One call argument: a class name plus its dynamic value.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Argument {
    /// Primitive name (`"int"`, `"long"`, ...) or dotted class name
    /// (`"java.util.Map"`).
    pub class: String,
    pub value: Value,
}

impl Argument {
    pub fn new(class: impl Into<String>, value: Value) -> Self {
        Self {
            class: class.into(),
            value,
        }
    }

    pub fn int(value: i32) -> Self {
        Self::new("int", Value::from(value))
    }

    pub fn long(value: i64) -> Self {
        Self::new("long", Value::from(value))
    }

    pub fn boolean(value: bool) -> Self {
        Self::new("boolean", Value::from(value))
    }

    pub fn double(value: f64) -> Self {
        Self::new("double", Value::from(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new("java.lang.String", Value::from(value.into()))
    }

    /// A typed object argument, e.g. `object("java.util.Map", json!({..}))`.
    pub fn object(class: impl Into<String>, value: Value) -> Self {
        Self::new(class, value)
    }
}

/// Build the argument-type descriptor string for a call.
///
/// Primitives map to their one-letter code; dotted class names map to
/// `L<slashed-name>;`.
pub fn build_type_descriptor(args: &[Argument]) -> Result<String> {
    let mut descriptor = String::new();
    for arg in args {
        if arg.class.contains('.') {
            descriptor.push('L');
            descriptor.push_str(&arg.class.replace('.', "/"));
            descriptor.push(';');
        } else {
            let code = PRIMITIVE_CODES
                .iter()
                .find(|(name, _)| *name == arg.class)
                .map(|(_, code)| *code)
                .ok_or_else(|| {
                    DubboError::Protocol(format!("unknown primitive type: {}", arg.class))
                })?;
            descriptor.push(code);
        }
    }
    Ok(descriptor)
}

/// Everything the codec serializes for one call, in wire order.
#[derive(Debug, Clone, Serialize)]
pub struct Invocation {
    pub dubbo_version: String,
    pub path: String,
    pub version: String,
    pub method: String,
    pub argument_types: String,
    pub arguments: Vec<Argument>,
    /// Out-of-band call metadata (interface, group, timeout, ...).
    pub attachments: HashMap<String, String>,
}

/// Opaque payload codec.
pub trait BodyCodec: Send + Sync {
    /// Serialize an invocation into an opaque request body.
    fn encode_invocation(&self, invocation: &Invocation) -> Result<Bytes>;

    /// Deserialize a response body into a dynamic value.
    fn decode_value(&self, body: &[u8]) -> Result<Value>;
}

/// Check a decoded value for a remote-exception shape.
///
/// Exceptions decode as maps carrying a `$class` naming an
/// `...Exception`/`...Error` type; the detail message is surfaced when
/// present.
pub fn remote_exception_message(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    let class = object.get("$class")?.as_str()?;
    if !(class.ends_with("Exception") || class.ends_with("Error")) {
        return None;
    }
    let message = object
        .get("detailMessage")
        .and_then(Value::as_str)
        .unwrap_or(class);
    Some(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primitive_type_codes() {
        let args = vec![
            Argument::boolean(true),
            Argument::int(1),
            Argument::long(2),
            Argument::double(3.0),
        ];
        assert_eq!(build_type_descriptor(&args).unwrap(), "ZIJD");
    }

    #[test]
    fn test_object_type_descriptor() {
        let args = vec![
            Argument::object("java.util.Map", json!({"dicCode": "CM_ADDRSEC"})),
            Argument::string("x"),
        ];
        assert_eq!(
            build_type_descriptor(&args).unwrap(),
            "Ljava/util/Map;Ljava/lang/String;"
        );
    }

    #[test]
    fn test_unknown_primitive_rejected() {
        let args = vec![Argument::new("char", Value::from("c"))];
        let err = build_type_descriptor(&args).unwrap_err();
        assert!(err.to_string().contains("unknown primitive"));
    }

    #[test]
    fn test_empty_args_descriptor() {
        assert_eq!(build_type_descriptor(&[]).unwrap(), "");
    }

    #[test]
    fn test_remote_exception_detection() {
        let exception = json!({
            "$class": "java.lang.RuntimeException",
            "detailMessage": "boom",
        });
        assert_eq!(remote_exception_message(&exception).unwrap(), "boom");

        let no_message = json!({"$class": "java.lang.StackOverflowError"});
        assert_eq!(
            remote_exception_message(&no_message).unwrap(),
            "java.lang.StackOverflowError"
        );

        let plain = json!({"$class": "java.util.HashMap", "k": "v"});
        assert!(remote_exception_message(&plain).is_none());
        assert!(remote_exception_message(&json!(42)).is_none());
    }
}
