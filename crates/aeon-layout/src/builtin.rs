//! [`LayoutValue`] implementations for the built-in event kinds declared in
//! `aeon-types`.
//!
//! These live here rather than in `aeon-types` itself so that the base
//! crate stays free of layout/codec knowledge (the orphan rule permits it:
//! the trait is local to this crate, only the types are foreign).

use aeon_types::{
    CommandTerminatedExceptionally, EntityId, EntityLayoutIntroduced, EventCausalityEstablished,
    HostErrorOccurred, LayoutFingerprint,
};

use crate::{take_field, value_as_uuid, EntityDescriptor, FieldType, LayoutError, LayoutValue, Value};

impl LayoutValue for EventCausalityEstablished {
    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::new(
            "EventCausalityEstablished",
            vec![("event_id", FieldType::Uuid), ("cause_id", FieldType::Uuid)],
        )
    }

    fn to_value(&self) -> Value {
        Value::Layout(vec![
            ("cause_id".to_string(), Value::Uuid(self.cause_id.0)),
            ("event_id".to_string(), Value::Uuid(self.event_id.0)),
        ])
    }

    fn from_value(value: Value) -> Result<Self, LayoutError> {
        let mut fields = value
            .into_fields()
            .ok_or_else(|| LayoutError::MalformedSchema("expected layout value".into()))?;
        let event_id = EntityId(value_as_uuid(take_field(&mut fields, "event_id")?)?);
        let cause_id = EntityId(value_as_uuid(take_field(&mut fields, "cause_id")?)?);
        Ok(EventCausalityEstablished { event_id, cause_id })
    }
}

impl LayoutValue for CommandTerminatedExceptionally {
    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::new("CommandTerminatedExceptionally", vec![("message", FieldType::Str)])
    }

    fn to_value(&self) -> Value {
        Value::Layout(vec![("message".to_string(), Value::Str(self.message.clone()))])
    }

    fn from_value(value: Value) -> Result<Self, LayoutError> {
        let mut fields = value
            .into_fields()
            .ok_or_else(|| LayoutError::MalformedSchema("expected layout value".into()))?;
        let message = match take_field(&mut fields, "message")? {
            Value::Str(s) => s,
            other => {
                return Err(LayoutError::MalformedSchema(format!("expected string, got {other:?}")))
            }
        };
        Ok(CommandTerminatedExceptionally { message })
    }
}

impl LayoutValue for EntityLayoutIntroduced {
    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::new(
            "EntityLayoutIntroduced",
            vec![("fingerprint", FieldType::Bytes), ("schema", FieldType::Bytes)],
        )
    }

    fn to_value(&self) -> Value {
        Value::Layout(vec![
            ("fingerprint".to_string(), Value::Bytes(self.fingerprint.0.to_vec())),
            ("schema".to_string(), Value::Bytes(self.schema.clone())),
        ])
    }

    fn from_value(value: Value) -> Result<Self, LayoutError> {
        let mut fields = value
            .into_fields()
            .ok_or_else(|| LayoutError::MalformedSchema("expected layout value".into()))?;
        let fingerprint_bytes = match take_field(&mut fields, "fingerprint")? {
            Value::Bytes(b) => b,
            other => {
                return Err(LayoutError::MalformedSchema(format!("expected bytes, got {other:?}")))
            }
        };
        if fingerprint_bytes.len() != 20 {
            return Err(LayoutError::MalformedSchema(format!(
                "fingerprint must be 20 bytes, got {}",
                fingerprint_bytes.len()
            )));
        }
        let mut fingerprint = [0u8; 20];
        fingerprint.copy_from_slice(&fingerprint_bytes);
        let schema = match take_field(&mut fields, "schema")? {
            Value::Bytes(b) => b,
            other => {
                return Err(LayoutError::MalformedSchema(format!("expected bytes, got {other:?}")))
            }
        };
        Ok(EntityLayoutIntroduced { fingerprint: LayoutFingerprint(fingerprint), schema })
    }
}

impl LayoutValue for HostErrorOccurred {
    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::new("HostErrorOccurred", vec![("detail", FieldType::Str)])
    }

    fn to_value(&self) -> Value {
        Value::Layout(vec![("detail".to_string(), Value::Str(self.detail.clone()))])
    }

    fn from_value(value: Value) -> Result<Self, LayoutError> {
        let mut fields = value
            .into_fields()
            .ok_or_else(|| LayoutError::MalformedSchema("expected layout value".into()))?;
        let detail = match take_field(&mut fields, "detail")? {
            Value::Str(s) => s,
            other => {
                return Err(LayoutError::MalformedSchema(format!("expected string, got {other:?}")))
            }
        };
        Ok(HostErrorOccurred { detail })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{canonicalize, LayoutCache};

    #[test]
    fn host_error_roundtrips_through_value() {
        let original = HostErrorOccurred { detail: "boom".to_string() };
        let value = original.to_value();
        let back = HostErrorOccurred::from_value(value).unwrap();
        assert_eq!(original, back);
    }

    #[test]
    fn causality_descriptor_canonicalizes() {
        let cache = LayoutCache::new();
        let layout = canonicalize(&EventCausalityEstablished::descriptor(), &cache).unwrap();
        assert_eq!(layout.properties.len(), 2);
        assert_eq!(layout.properties[0].name, "cause_id");
        assert_eq!(layout.properties[1].name, "event_id");
    }
}
