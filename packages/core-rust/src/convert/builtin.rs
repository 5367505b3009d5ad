//! Converters every registry starts with.

use std::sync::Arc;

use super::registry::{FallbackConverter, TypeConverterRegistry};
use crate::error::ConversionError;
use crate::payload::{Payload, TypeKey};
use crate::value::Value;

/// Renders payloads that carry a formatting capability to `String`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToStringFallback;

impl FallbackConverter for ToStringFallback {
    fn name(&self) -> &'static str {
        "to-string"
    }

    fn try_convert(
        &self,
        value: &Payload,
        target: TypeKey,
    ) -> Option<Result<Payload, ConversionError>> {
        if target != TypeKey::of::<String>() {
            return None;
        }
        value.render_text().map(|text| Ok(Payload::displayable(text)))
    }
}

/// Registers the standard promotions, scalar/text/JSON converters and the
/// to-string fallback.
pub fn register_defaults(registry: &TypeConverterRegistry) {
    register_promotions(registry);
    register_text(registry);
    register_json(registry);
    registry.add_fallback(Arc::new(ToStringFallback));
}

fn register_promotions(registry: &TypeConverterRegistry) {
    registry.register_promotion::<&'static str, String, _>(|s| (*s).to_string());
    registry.register_promotion::<i32, i64, _>(|i| i64::from(*i));
    registry.register_promotion::<String, Value, _>(|s| Value::String(s.clone()));
    registry.register_promotion::<i64, Value, _>(|i| Value::Int(*i));
    registry.register_promotion::<f64, Value, _>(|f| Value::Float(*f));
    registry.register_promotion::<bool, Value, _>(|b| Value::Bool(*b));
    registry.register_promotion::<Vec<u8>, Value, _>(|b| Value::Bytes(b.clone()));
    registry.register_promotion::<serde_json::Value, Value, _>(|j| Value::from(j.clone()));
}

fn register_text(registry: &TypeConverterRegistry) {
    registry.register::<Vec<u8>, String, _>(|bytes| {
        String::from_utf8(bytes.clone())
            .map_err(|e| ConversionError::failed::<Vec<u8>, String>(e.to_string()))
    });
    registry.register::<String, Vec<u8>, _>(|s| Ok(s.clone().into_bytes()));

    registry.register::<String, i64, _>(|s| {
        s.trim()
            .parse::<i64>()
            .map_err(|e| ConversionError::failed::<String, i64>(format!("{s:?}: {e}")))
    });
    registry.register::<String, f64, _>(|s| {
        s.trim()
            .parse::<f64>()
            .map_err(|e| ConversionError::failed::<String, f64>(format!("{s:?}: {e}")))
    });
    registry.register::<String, bool, _>(|s| match s.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConversionError::failed::<String, bool>(format!(
            "{s:?} is not a boolean"
        ))),
    });

    registry.register::<i64, String, _>(|i| Ok(i.to_string()));
    registry.register::<f64, String, _>(|f| Ok(f.to_string()));
    registry.register::<bool, String, _>(|b| Ok(b.to_string()));
    registry.register::<(), String, _>(|_| Ok(String::new()));

    registry.register::<Value, String, _>(|v| Ok(v.to_string()));
    registry.register::<Value, i64, _>(|v| match v {
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| ConversionError::failed::<Value, i64>(e.to_string())),
        other => other.as_i64().ok_or_else(|| {
            ConversionError::failed::<Value, i64>(format!("{} is not an integer", other.kind()))
        }),
    });
    registry.register::<Value, bool, _>(|v| {
        v.as_bool().ok_or_else(|| {
            ConversionError::failed::<Value, bool>(format!("{} is not a boolean", v.kind()))
        })
    });
}

fn register_json(registry: &TypeConverterRegistry) {
    registry.register::<Value, serde_json::Value, _>(|v| Ok(v.to_json()));
    registry.register::<serde_json::Value, String, _>(|j| Ok(j.to_string()));
    registry.register::<String, serde_json::Value, _>(|s| {
        serde_json::from_str(s)
            .map_err(|e| ConversionError::failed::<String, serde_json::Value>(e.to_string()))
    });
    registry.register::<Vec<u8>, serde_json::Value, _>(|b| {
        serde_json::from_slice(b)
            .map_err(|e| ConversionError::failed::<Vec<u8>, serde_json::Value>(e.to_string()))
    });
}
