//! Two-tier binary codec.
//!
//! The inner payload is a schemaless Avro datum: just the encoded fields,
//! with its schema carried by name in the outer envelope. The envelope
//! itself is a fixed `MessageV1` record framed in the Confluent wire format,
//! `[0x00][u32 schema id, big endian][avro datum]`, so any registry-aware
//! consumer can self-describe it.
//!
//! Inner decode failures and envelope decode failures are distinct errors:
//! the former dead-letters one message, the latter is a transport problem.

use std::io::Cursor;
use std::sync::Arc;

use apache_avro::types::{Record, Value as AvroValue};
use apache_avro::{from_avro_datum, to_avro_datum, Schema};
use chrono::{NaiveDate, Utc};
use moka::sync::Cache;
use once_cell::sync::Lazy;
use serde_json::{json, Value as JsonValue};
use tokio::sync::OnceCell;

use crate::error::BridgeError;
use crate::registry::SchemaRegistry;

/// Registry subject for the envelope, per the record-name subject strategy.
pub const ENVELOPE_SUBJECT: &str = "org.apache.fineract.avro.MessageV1";

pub const MESSAGE_V1_SCHEMA: &str = r#"{
    "type": "record",
    "name": "MessageV1",
    "namespace": "org.apache.fineract.avro",
    "fields": [
        {"name": "id", "type": "int"},
        {"name": "source", "type": "string"},
        {"name": "type", "type": "string"},
        {"name": "category", "type": "string"},
        {"name": "createdAt", "type": "string"},
        {"name": "businessDate", "type": "string"},
        {"name": "tenantId", "type": "string"},
        {"name": "idempotencyKey", "type": "string"},
        {"name": "dataschema", "type": "string"},
        {"name": "data", "type": "bytes"}
    ]
}"#;

static ENVELOPE_SCHEMA: Lazy<Schema> = Lazy::new(|| {
    // The constant above is a valid Avro schema; parsing it cannot fail.
    Schema::parse_str(MESSAGE_V1_SCHEMA).unwrap()
});

/// The fixed outer message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: i32,
    pub source: String,
    pub event_type: String,
    pub category: String,
    pub created_at: String,
    pub business_date: String,
    pub tenant_id: String,
    pub idempotency_key: String,
    pub dataschema: String,
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn new(
        source: &str,
        event_type: &str,
        category: &str,
        tenant_id: &str,
        idempotency_key: &str,
        dataschema: &str,
        data: Vec<u8>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 1,
            source: source.to_string(),
            event_type: event_type.to_string(),
            category: category.to_string(),
            created_at: now.to_rfc3339(),
            business_date: now.date_naive().to_string(),
            tenant_id: tenant_id.to_string(),
            idempotency_key: idempotency_key.to_string(),
            dataschema: dataschema.to_string(),
            data,
        }
    }

    /// JSON view without the binary payload, used for job contexts and
    /// audit snapshots where carrying the raw bytes would be dead weight.
    pub fn stripped_json(&self) -> JsonValue {
        json!({
            "id": self.id,
            "source": self.source,
            "type": self.event_type,
            "category": self.category,
            "createdAt": self.created_at,
            "businessDate": self.business_date,
            "tenantId": self.tenant_id,
            "idempotencyKey": self.idempotency_key,
            "dataschema": self.dataschema,
        })
    }

    pub fn business_date_parsed(&self) -> Option<NaiveDate> {
        self.business_date.parse().ok()
    }
}

/// Encode payload fields against a named schema as a bare datum.
pub fn encode_inner(
    schema: &Schema,
    fields: &[(String, AvroValue)],
) -> Result<Vec<u8>, BridgeError> {
    let mut record = Record::new(schema).ok_or_else(|| {
        BridgeError::Validation("inner schema is not a record schema".to_string())
    })?;
    for (name, value) in fields {
        record.put(name, value.clone());
    }
    Ok(to_avro_datum(schema, record)?)
}

/// Decode a bare datum against its schema. Union wrappers are stripped so
/// callers see plain values.
pub fn decode_inner(schema: &Schema, bytes: &[u8]) -> Result<AvroValue, BridgeError> {
    let mut reader = Cursor::new(bytes);
    let value = from_avro_datum(schema, &mut reader, None)
        .map_err(|err| BridgeError::InnerDecode(err.to_string()))?;
    Ok(unwrap_unions(value))
}

pub struct EnvelopeCodec {
    registry: Arc<dyn SchemaRegistry>,
    auto_register: bool,
    schema_id: OnceCell<i32>,
    // Registry ids are immutable, so cached writer schemas never go stale.
    writer_schemas: Cache<i32, Arc<Schema>>,
}

impl EnvelopeCodec {
    pub fn new(registry: Arc<dyn SchemaRegistry>, auto_register: bool) -> Self {
        Self {
            registry,
            auto_register,
            schema_id: OnceCell::new(),
            writer_schemas: Cache::new(1_000),
        }
    }

    async fn envelope_schema_id(&self) -> Result<i32, BridgeError> {
        self.schema_id
            .get_or_try_init(|| async {
                if self.auto_register {
                    self.registry
                        .register(ENVELOPE_SUBJECT, MESSAGE_V1_SCHEMA)
                        .await
                } else {
                    Ok(self.registry.get_latest(ENVELOPE_SUBJECT).await?.id)
                }
            })
            .await
            .map(|id| *id)
    }

    pub async fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, BridgeError> {
        let schema_id = self.envelope_schema_id().await?;

        let mut record = Record::new(&ENVELOPE_SCHEMA).ok_or_else(|| {
            BridgeError::Validation("envelope schema is not a record schema".to_string())
        })?;
        record.put("id", AvroValue::Int(envelope.id));
        record.put("source", AvroValue::String(envelope.source.clone()));
        record.put("type", AvroValue::String(envelope.event_type.clone()));
        record.put("category", AvroValue::String(envelope.category.clone()));
        record.put("createdAt", AvroValue::String(envelope.created_at.clone()));
        record.put(
            "businessDate",
            AvroValue::String(envelope.business_date.clone()),
        );
        record.put("tenantId", AvroValue::String(envelope.tenant_id.clone()));
        record.put(
            "idempotencyKey",
            AvroValue::String(envelope.idempotency_key.clone()),
        );
        record.put("dataschema", AvroValue::String(envelope.dataschema.clone()));
        record.put("data", AvroValue::Bytes(envelope.data.clone()));

        let datum = to_avro_datum(&ENVELOPE_SCHEMA, record)?;
        let mut framed = Vec::with_capacity(datum.len() + 5);
        framed.push(0u8);
        framed.extend_from_slice(&(schema_id as u32).to_be_bytes());
        framed.extend_from_slice(&datum);
        Ok(framed)
    }

    pub async fn decode(&self, bytes: &[u8]) -> Result<Envelope, BridgeError> {
        if bytes.len() < 5 {
            return Err(BridgeError::EnvelopeDecode(format!(
                "frame too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != 0 {
            return Err(BridgeError::EnvelopeDecode(format!(
                "unknown magic byte {:#04x}",
                bytes[0]
            )));
        }
        let writer_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as i32;
        let writer_schema = match self.writer_schemas.get(&writer_id) {
            Some(schema) => schema,
            None => {
                let body = self.registry.get_by_id(writer_id).await?;
                let schema = Arc::new(
                    Schema::parse_str(&body)
                        .map_err(|err| BridgeError::EnvelopeDecode(err.to_string()))?,
                );
                self.writer_schemas.insert(writer_id, schema.clone());
                schema
            }
        };

        let mut reader = Cursor::new(&bytes[5..]);
        let value = from_avro_datum(&writer_schema, &mut reader, Some(&ENVELOPE_SCHEMA))
            .map_err(|err| BridgeError::EnvelopeDecode(err.to_string()))?;

        envelope_from_value(unwrap_unions(value))
    }
}

fn envelope_from_value(value: AvroValue) -> Result<Envelope, BridgeError> {
    let AvroValue::Record(fields) = value else {
        return Err(BridgeError::EnvelopeDecode(
            "envelope datum is not a record".to_string(),
        ));
    };

    let mut envelope = Envelope {
        id: 0,
        source: String::new(),
        event_type: String::new(),
        category: String::new(),
        created_at: String::new(),
        business_date: String::new(),
        tenant_id: String::new(),
        idempotency_key: String::new(),
        dataschema: String::new(),
        data: Vec::new(),
    };

    for (name, value) in fields {
        match (name.as_str(), value) {
            ("id", AvroValue::Int(id)) => envelope.id = id,
            ("source", AvroValue::String(s)) => envelope.source = s,
            ("type", AvroValue::String(s)) => envelope.event_type = s,
            ("category", AvroValue::String(s)) => envelope.category = s,
            ("createdAt", AvroValue::String(s)) => envelope.created_at = s,
            ("businessDate", AvroValue::String(s)) => envelope.business_date = s,
            ("tenantId", AvroValue::String(s)) => envelope.tenant_id = s,
            ("idempotencyKey", AvroValue::String(s)) => envelope.idempotency_key = s,
            ("dataschema", AvroValue::String(s)) => envelope.dataschema = s,
            ("data", AvroValue::Bytes(b)) => envelope.data = b,
            (name, other) => {
                return Err(BridgeError::EnvelopeDecode(format!(
                    "unexpected envelope field {name:?}: {other:?}"
                )));
            }
        }
    }
    Ok(envelope)
}

/// Strip union wrappers so decoded values compare cleanly against the plain
/// values they were encoded from.
pub fn unwrap_unions(value: AvroValue) -> AvroValue {
    match value {
        AvroValue::Union(_, inner) => unwrap_unions(*inner),
        AvroValue::Record(fields) => AvroValue::Record(
            fields
                .into_iter()
                .map(|(name, value)| (name, unwrap_unions(value)))
                .collect(),
        ),
        AvroValue::Array(items) => {
            AvroValue::Array(items.into_iter().map(unwrap_unions).collect())
        }
        AvroValue::Map(entries) => AvroValue::Map(
            entries
                .into_iter()
                .map(|(key, value)| (key, unwrap_unions(value)))
                .collect(),
        ),
        other => other,
    }
}

/// JSON view of a decoded Avro value, for guard scopes, job contexts and
/// audit snapshots. Bytes become lossy UTF-8 strings.
pub fn avro_to_json(value: &AvroValue) -> JsonValue {
    match value {
        AvroValue::Null => JsonValue::Null,
        AvroValue::Boolean(b) => json!(b),
        AvroValue::Int(i) => json!(i),
        AvroValue::Long(l) => json!(l),
        AvroValue::Float(f) => json!(f),
        AvroValue::Double(d) => json!(d),
        AvroValue::String(s) | AvroValue::Enum(_, s) => json!(s),
        AvroValue::Bytes(b) | AvroValue::Fixed(_, b) => {
            json!(String::from_utf8_lossy(b).to_string())
        }
        AvroValue::Union(_, inner) => avro_to_json(inner),
        AvroValue::Array(items) => JsonValue::Array(items.iter().map(avro_to_json).collect()),
        AvroValue::Map(entries) => JsonValue::Object(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), avro_to_json(value)))
                .collect(),
        ),
        AvroValue::Record(fields) => JsonValue::Object(
            fields
                .iter()
                .map(|(name, value)| (name.clone(), avro_to_json(value)))
                .collect(),
        ),
        other => json!(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CountingRegistry;

    const INNER_SCHEMA: &str = r#"{
        "type": "record",
        "name": "ClientCreateCommand",
        "fields": [
            {"name": "clientId", "type": "long"},
            {"name": "firstname", "type": "string"},
            {"name": "middlename", "type": ["null", "string"], "default": null},
            {"name": "note", "type": "string"}
        ]
    }"#;

    fn inner_schema() -> Schema {
        Schema::parse_str(INNER_SCHEMA).unwrap()
    }

    #[test]
    fn inner_payload_round_trips_exactly() {
        let schema = inner_schema();
        // Large long, null in a nullable union, and an empty string all
        // have to survive unchanged.
        let fields = vec![
            ("clientId".to_string(), AvroValue::Long(1_099_511_627_777)),
            ("firstname".to_string(), AvroValue::String("John".into())),
            ("middlename".to_string(), AvroValue::Null),
            ("note".to_string(), AvroValue::String(String::new())),
        ];
        let bytes = encode_inner(&schema, &fields).unwrap();
        let decoded = decode_inner(&schema, &bytes).unwrap();
        assert_eq!(decoded, AvroValue::Record(fields));
    }

    #[test]
    fn truncated_inner_datum_is_an_inner_decode_error() {
        let schema = inner_schema();
        let fields = vec![
            ("clientId".to_string(), AvroValue::Long(42)),
            ("firstname".to_string(), AvroValue::String("John".into())),
            ("middlename".to_string(), AvroValue::Null),
            ("note".to_string(), AvroValue::String("n".into())),
        ];
        let bytes = encode_inner(&schema, &fields).unwrap();
        let err = decode_inner(&schema, &bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, BridgeError::InnerDecode(_)));
    }

    fn sample_envelope() -> Envelope {
        Envelope::new(
            "openerp-fineract",
            "CreateClient",
            "clients",
            "default",
            "a".repeat(64).as_str(),
            "ClientCreateCommand",
            vec![1, 2, 3, 4],
        )
    }

    #[tokio::test]
    async fn envelope_uses_the_confluent_wire_framing() {
        let registry = Arc::new(CountingRegistry::default());
        let codec = EnvelopeCodec::new(registry.clone(), true);

        let bytes = codec.encode(&sample_envelope()).await.unwrap();
        assert_eq!(bytes[0], 0x00);
        let id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        assert_eq!(id as i32, registry.id_of(ENVELOPE_SUBJECT).unwrap());
    }

    #[tokio::test]
    async fn envelope_round_trips_through_the_registry() {
        let registry = Arc::new(CountingRegistry::default());
        let codec = EnvelopeCodec::new(registry, true);

        let envelope = sample_envelope();
        let bytes = codec.encode(&envelope).await.unwrap();
        let decoded = codec.decode(&bytes).await.unwrap();
        assert_eq!(decoded, envelope);
    }

    #[tokio::test]
    async fn writer_schema_is_fetched_from_the_registry_once() {
        let registry = Arc::new(CountingRegistry::default());
        let codec = EnvelopeCodec::new(registry.clone(), true);

        let bytes = codec.encode(&sample_envelope()).await.unwrap();
        codec.decode(&bytes).await.unwrap();
        codec.decode(&bytes).await.unwrap();
        codec.decode(&bytes).await.unwrap();
        assert_eq!(registry.by_id_calls(), 1);
    }

    #[tokio::test]
    async fn bad_magic_byte_is_an_envelope_error() {
        let registry = Arc::new(CountingRegistry::default());
        let codec = EnvelopeCodec::new(registry, true);

        let err = codec.decode(&[1, 0, 0, 0, 9, 5]).await.unwrap_err();
        assert!(matches!(err, BridgeError::EnvelopeDecode(_)));

        let err = codec.decode(&[0, 0]).await.unwrap_err();
        assert!(matches!(err, BridgeError::EnvelopeDecode(_)));
    }

    #[test]
    fn stripped_json_has_no_binary_payload() {
        let json = sample_envelope().stripped_json();
        assert!(json.get("data").is_none());
        assert_eq!(json["type"], "CreateClient");
        assert_eq!(json["dataschema"], "ClientCreateCommand");
    }

    #[test]
    fn business_date_is_a_parseable_calendar_date() {
        assert!(sample_envelope().business_date_parsed().is_some());
    }
}
