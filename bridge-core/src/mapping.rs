//! Field mapping resolution: document in, typed payload out.
//!
//! Each mapping resolves a raw value from its source variant, falls back to
//! the configured default when the value is absent, then coerces to the
//! declared primitive. A nullable mapping degrades to null on failure; a
//! non-nullable one aborts the whole build, because a partial payload must
//! never reach the wire.

use std::collections::HashMap;

use apache_avro::types::Value as AvroValue;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::error::BridgeError;
use crate::expr::{self, Scope};
use crate::types::{AvroType, Document, FieldMapping, MappingSource};

/// A named pure function invokable from a `Method` mapping.
pub type MappingMethod = fn(&Document) -> Result<JsonValue, BridgeError>;

/// Registry of mapping methods. Only functions registered here are callable
/// from rule configuration.
#[derive(Default, Clone)]
pub struct MethodRegistry {
    methods: HashMap<String, MappingMethod>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, method: MappingMethod) {
        self.methods.insert(name.to_string(), method);
    }

    fn get(&self, name: &str) -> Option<MappingMethod> {
        self.methods.get(name).copied()
    }
}

/// Resolve and coerce every mapping against `doc`, in declaration order.
pub fn build_payload(
    doc: &Document,
    mappings: &[FieldMapping],
    methods: &MethodRegistry,
) -> Result<Vec<(String, AvroValue)>, BridgeError> {
    let mut fields = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        let value = match resolve_one(doc, mapping, methods) {
            Ok(value) => value,
            Err(err) if mapping.nullable => {
                warn!(
                    field = %mapping.target_field,
                    error = %err,
                    "nullable mapping failed, emitting null"
                );
                AvroValue::Null
            }
            Err(err) => return Err(err),
        };
        fields.push((mapping.target_field.clone(), value));
    }
    Ok(fields)
}

fn resolve_one(
    doc: &Document,
    mapping: &FieldMapping,
    methods: &MethodRegistry,
) -> Result<AvroValue, BridgeError> {
    let mut raw = match &mapping.source {
        MappingSource::Field { field } => doc.field(field).cloned().unwrap_or(JsonValue::Null),
        MappingSource::Expression { expression } => {
            let scope = Scope::new().bind("doc", doc.as_json());
            expr::eval(expression, &scope)?
        }
        MappingSource::Static { value } => value.clone(),
        MappingSource::Method { method } => {
            let function = methods.get(method).ok_or_else(|| {
                BridgeError::Validation(format!("mapping method {method:?} is not registered"))
            })?;
            function(doc)?
        }
    };

    if raw.is_null() {
        if let Some(default) = &mapping.default_value {
            raw = JsonValue::String(default.clone());
        }
    }

    coerce(raw, mapping)
}

fn coerce(raw: JsonValue, mapping: &FieldMapping) -> Result<AvroValue, BridgeError> {
    if raw.is_null() {
        return if mapping.nullable {
            Ok(AvroValue::Null)
        } else {
            Err(coercion_error(mapping, "value is absent and not nullable"))
        };
    }

    match mapping.avro_type {
        AvroType::String => match raw {
            JsonValue::String(s) => Ok(AvroValue::String(s)),
            JsonValue::Number(n) => Ok(AvroValue::String(n.to_string())),
            JsonValue::Bool(b) => Ok(AvroValue::String(b.to_string())),
            other => Err(coercion_error(
                mapping,
                &format!("cannot stringify {other}"),
            )),
        },
        AvroType::Int => {
            let n = coerce_integer(&raw, mapping)?;
            i32::try_from(n)
                .map(AvroValue::Int)
                .map_err(|_| coercion_error(mapping, &format!("{n} is out of int range")))
        }
        AvroType::Long => coerce_integer(&raw, mapping).map(AvroValue::Long),
        AvroType::Boolean => match &raw {
            JsonValue::Bool(b) => Ok(AvroValue::Boolean(*b)),
            JsonValue::Number(n) => Ok(AvroValue::Boolean(
                n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            )),
            JsonValue::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(AvroValue::Boolean(true)),
                "false" | "0" => Ok(AvroValue::Boolean(false)),
                other => Err(coercion_error(
                    mapping,
                    &format!("{other:?} is not a boolean"),
                )),
            },
            other => Err(coercion_error(
                mapping,
                &format!("cannot read {other} as boolean"),
            )),
        },
        AvroType::Bytes => match raw {
            JsonValue::String(s) => Ok(AvroValue::Bytes(s.into_bytes())),
            other => Err(coercion_error(
                mapping,
                &format!("cannot read {other} as bytes"),
            )),
        },
    }
}

fn coerce_integer(raw: &JsonValue, mapping: &FieldMapping) -> Result<i64, BridgeError> {
    match raw {
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    Ok(f as i64)
                } else {
                    Err(coercion_error(
                        mapping,
                        &format!("{f} is not a whole number in range"),
                    ))
                }
            } else {
                Err(coercion_error(mapping, "unrepresentable number"))
            }
        }
        JsonValue::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| coercion_error(mapping, &format!("{s:?} is not numeric"))),
        other => Err(coercion_error(
            mapping,
            &format!("cannot read {other} as integer"),
        )),
    }
}

fn coercion_error(mapping: &FieldMapping, reason: &str) -> BridgeError {
    BridgeError::Coercion {
        field: mapping.target_field.clone(),
        target: mapping.avro_type.as_str().to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AvroType;
    use serde_json::json;

    fn mapping(
        target: &str,
        avro_type: AvroType,
        nullable: bool,
        source: MappingSource,
    ) -> FieldMapping {
        FieldMapping {
            target_field: target.to_string(),
            avro_type,
            nullable,
            default_value: None,
            source,
        }
    }

    fn field(name: &str) -> MappingSource {
        MappingSource::Field {
            field: name.to_string(),
        }
    }

    fn customer() -> Document {
        Document::new("Customer", "CUST-0001")
            .with_field("fineract_client_id", json!(42))
            .with_field("first_name", json!("John"))
            .with_field("last_name", json!("Doe"))
            .with_field("active", json!("yes"))
            .with_field("balance", json!("1550"))
    }

    #[test]
    fn resolves_the_client_create_payload() {
        let mappings = vec![
            mapping("clientId", AvroType::Long, false, field("fineract_client_id")),
            mapping("firstname", AvroType::String, false, field("first_name")),
            mapping("lastname", AvroType::String, false, field("last_name")),
        ];
        let payload = build_payload(&customer(), &mappings, &MethodRegistry::new()).unwrap();
        assert_eq!(
            payload,
            vec![
                ("clientId".to_string(), AvroValue::Long(42)),
                ("firstname".to_string(), AvroValue::String("John".into())),
                ("lastname".to_string(), AvroValue::String("Doe".into())),
            ]
        );
    }

    #[test]
    fn coerces_strings_booleans_and_numerics() {
        let mappings = vec![
            mapping("active", AvroType::Boolean, false, field("active")),
            mapping("balance", AvroType::Long, false, field("balance")),
            mapping("id_text", AvroType::String, false, field("fineract_client_id")),
            mapping("raw", AvroType::Bytes, false, field("first_name")),
        ];
        let payload = build_payload(&customer(), &mappings, &MethodRegistry::new()).unwrap();
        assert_eq!(payload[0].1, AvroValue::Boolean(true));
        assert_eq!(payload[1].1, AvroValue::Long(1550));
        assert_eq!(payload[2].1, AvroValue::String("42".into()));
        assert_eq!(payload[3].1, AvroValue::Bytes(b"John".to_vec()));
    }

    #[test]
    fn absent_nullable_field_yields_null_without_error() {
        let mappings = vec![mapping("middle", AvroType::String, true, field("middle_name"))];
        let payload = build_payload(&customer(), &mappings, &MethodRegistry::new()).unwrap();
        assert_eq!(payload[0].1, AvroValue::Null);
    }

    #[test]
    fn absent_non_nullable_field_aborts_the_build() {
        let mappings = vec![
            mapping("firstname", AvroType::String, false, field("first_name")),
            mapping("missing", AvroType::String, false, field("not_there")),
        ];
        let err = build_payload(&customer(), &mappings, &MethodRegistry::new()).unwrap_err();
        assert!(matches!(err, BridgeError::Coercion { ref field, .. } if field == "missing"));
    }

    #[test]
    fn default_applies_only_when_resolved_value_is_absent() {
        let mut with_default = mapping("status", AvroType::String, false, field("status"));
        with_default.default_value = Some("unknown".to_string());
        let payload =
            build_payload(&customer(), &[with_default.clone()], &MethodRegistry::new()).unwrap();
        assert_eq!(payload[0].1, AvroValue::String("unknown".into()));

        let doc = customer().with_field("status", json!("Active"));
        let payload = build_payload(&doc, &[with_default], &MethodRegistry::new()).unwrap();
        assert_eq!(payload[0].1, AvroValue::String("Active".into()));
    }

    #[test]
    fn expression_and_static_sources_resolve() {
        let mappings = vec![
            mapping(
                "fullName",
                AvroType::String,
                false,
                MappingSource::Expression {
                    expression: "doc.first_name + ' ' + doc.last_name".to_string(),
                },
            ),
            mapping(
                "origin",
                AvroType::String,
                false,
                MappingSource::Static {
                    value: json!("erp"),
                },
            ),
        ];
        let payload = build_payload(&customer(), &mappings, &MethodRegistry::new()).unwrap();
        assert_eq!(payload[0].1, AvroValue::String("John Doe".into()));
        assert_eq!(payload[1].1, AvroValue::String("erp".into()));
    }

    #[test]
    fn method_source_calls_the_registered_function() {
        fn upper_last(doc: &Document) -> Result<JsonValue, BridgeError> {
            Ok(doc
                .field("last_name")
                .and_then(|v| v.as_str())
                .map(|s| json!(s.to_uppercase()))
                .unwrap_or(JsonValue::Null))
        }
        let mut methods = MethodRegistry::new();
        methods.register("upper_last", upper_last);

        let mappings = vec![mapping(
            "lastUpper",
            AvroType::String,
            false,
            MappingSource::Method {
                method: "upper_last".to_string(),
            },
        )];
        let payload = build_payload(&customer(), &mappings, &methods).unwrap();
        assert_eq!(payload[0].1, AvroValue::String("DOE".into()));

        let unregistered = vec![mapping(
            "x",
            AvroType::String,
            false,
            MappingSource::Method {
                method: "nope".to_string(),
            },
        )];
        assert!(build_payload(&customer(), &unregistered, &methods).is_err());
    }

    #[test]
    fn boolean_coercion_rejects_unknown_strings() {
        let doc = customer().with_field("flag", json!("maybe"));
        let strict = vec![mapping("flag", AvroType::Boolean, false, field("flag"))];
        assert!(build_payload(&doc, &strict, &MethodRegistry::new()).is_err());

        let lenient = vec![mapping("flag", AvroType::Boolean, true, field("flag"))];
        let payload = build_payload(&doc, &lenient, &MethodRegistry::new()).unwrap();
        assert_eq!(payload[0].1, AvroValue::Null);
    }

    #[test]
    fn int_range_is_enforced() {
        let doc = customer().with_field("big", json!(1_099_511_627_777_i64));
        let as_int = vec![mapping("big", AvroType::Int, false, field("big"))];
        assert!(build_payload(&doc, &as_int, &MethodRegistry::new()).is_err());

        let as_long = vec![mapping("big", AvroType::Long, false, field("big"))];
        let payload = build_payload(&doc, &as_long, &MethodRegistry::new()).unwrap();
        assert_eq!(payload[0].1, AvroValue::Long(1_099_511_627_777));
    }
}
