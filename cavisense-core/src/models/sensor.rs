use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Name of the server-stamped timestamp field inside every payload.
pub const RECEIVED_AT_FIELD: &str = "receivedAt";

/// Wire value of the envelope `type` tag for sensor updates.
pub const SENSOR_UPDATE_TYPE: &str = "sensor:update";

/// One telemetry reading from the pump unit.
///
/// Arbitrary JSON fields are carried through untouched. `receivedAt` is the
/// only statically required field and is always assigned by the server:
/// whatever the caller sent under that key is dropped when the payload is
/// stamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPayload {
    #[serde(flatten)]
    fields: Map<String, Value>,

    #[serde(rename = "receivedAt", with = "iso_millis")]
    received_at: DateTime<Utc>,
}

impl SensorPayload {
    /// Stamp a reading with the current time.
    #[must_use]
    pub fn stamp(fields: Map<String, Value>) -> Self {
        Self::stamp_at(fields, Utc::now())
    }

    /// Stamp a reading with an explicit time.
    ///
    /// The timestamp is truncated to milliseconds so that it survives a
    /// round-trip through its ISO-8601 wire form unchanged.
    #[must_use]
    pub fn stamp_at(mut fields: Map<String, Value>, at: DateTime<Utc>) -> Self {
        fields.remove(RECEIVED_AT_FIELD);
        Self {
            fields,
            received_at: at.trunc_subsecs(3),
        }
    }

    /// Parse a raw ingress body and stamp it.
    ///
    /// The body must be a JSON object; anything else is `MalformedInput`.
    pub fn from_ingress_body(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| Error::MalformedInput(format!("body is not valid JSON: {e}")))?;

        match value {
            Value::Object(fields) => Ok(Self::stamp(fields)),
            other => Err(Error::MalformedInput(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    #[must_use]
    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Sensor fields, excluding `receivedAt`.
    #[must_use]
    pub const fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Deserialization {
            context: format!("invalid sensor payload: {e}"),
        })
    }
}

/// Message carried on the broker channel and on every push connection.
///
/// New message kinds must be added as new variants, never by reusing the
/// `type` tag of an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SensorEnvelope {
    #[serde(rename = "sensor:update")]
    Update { payload: SensorPayload },
}

impl SensorEnvelope {
    #[must_use]
    pub const fn update(payload: SensorPayload) -> Self {
        Self::Update { payload }
    }

    /// Wire value of the `type` tag
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Update { .. } => SENSOR_UPDATE_TYPE,
        }
    }

    #[must_use]
    pub const fn payload(&self) -> &SensorPayload {
        match self {
            Self::Update { payload } => payload,
        }
    }

    #[must_use]
    pub fn into_payload(self) -> SensorPayload {
        match self {
            Self::Update { payload } => payload,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Encode an update envelope around a borrowed payload.
    ///
    /// Produces exactly the same JSON as `SensorEnvelope::update(p).to_json()`.
    pub fn encode_update(payload: &SensorPayload) -> Result<String> {
        #[derive(Serialize)]
        struct UpdateRef<'a> {
            #[serde(rename = "type")]
            kind: &'static str,
            payload: &'a SensorPayload,
        }

        Ok(serde_json::to_string(&UpdateRef {
            kind: SENSOR_UPDATE_TYPE,
            payload,
        })?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Deserialization {
            context: format!("invalid sensor envelope: {e}"),
        })
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `receivedAt` encoding: RFC 3339, UTC, millisecond precision, `Z` suffix.
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Format a timestamp the way `receivedAt` appears on the wire.
#[must_use]
pub fn format_received_at(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 8, 30, 0).unwrap() + chrono::Duration::microseconds(123_456)
    }

    #[test]
    fn test_stamp_overrides_caller_received_at() {
        let fields = json!({"temp": 90, "receivedAt": "1999-01-01T00:00:00.000Z"});
        let Value::Object(fields) = fields else { unreachable!() };

        let payload = SensorPayload::stamp_at(fields, fixed_time());

        assert_eq!(payload.get("temp"), Some(&json!(90)));
        assert!(payload.get(RECEIVED_AT_FIELD).is_none());
        assert_eq!(
            format_received_at(payload.received_at()),
            "2026-10-17T08:30:00.123Z"
        );
    }

    #[test]
    fn test_payload_wire_shape() {
        let Value::Object(fields) = json!({"temp": 90}) else { unreachable!() };
        let payload = SensorPayload::stamp_at(fields, fixed_time());

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({"temp": 90, "receivedAt": "2026-10-17T08:30:00.123Z"})
        );
    }

    #[test]
    fn test_envelope_wire_shape() {
        let Value::Object(fields) = json!({"pressure": [1.5, 2.0], "unit": "bar"}) else {
            unreachable!()
        };
        let envelope = SensorEnvelope::update(SensorPayload::stamp_at(fields, fixed_time()));

        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "sensor:update",
                "payload": {
                    "pressure": [1.5, 2.0],
                    "unit": "bar",
                    "receivedAt": "2026-10-17T08:30:00.123Z"
                }
            })
        );
        assert_eq!(envelope.kind(), SENSOR_UPDATE_TYPE);
    }

    #[test]
    fn test_envelope_parse_preserves_payload() {
        let Value::Object(fields) = json!({"temp": 72.5, "ok": true}) else { unreachable!() };
        let original = SensorEnvelope::update(SensorPayload::stamp_at(fields, fixed_time()));

        let parsed = SensorEnvelope::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_encode_update_matches_owned_envelope() {
        let Value::Object(fields) = json!({"temp": 90, "rpm": 1450}) else { unreachable!() };
        let payload = SensorPayload::stamp_at(fields, fixed_time());

        assert_eq!(
            SensorEnvelope::encode_update(&payload).unwrap(),
            SensorEnvelope::update(payload).to_json().unwrap()
        );
    }

    #[test]
    fn test_envelope_rejects_unknown_type() {
        let raw = r#"{"type":"sensor:delete","payload":{"receivedAt":"2026-10-17T08:30:00.000Z"}}"#;
        assert!(matches!(
            SensorEnvelope::from_json(raw),
            Err(Error::Deserialization { .. })
        ));
    }

    #[test]
    fn test_payload_requires_received_at() {
        assert!(SensorPayload::from_json(r#"{"temp": 90}"#).is_err());
        assert!(SensorPayload::from_json(r#"{"temp": 90, "receivedAt": "yesterday"}"#).is_err());
    }

    #[test]
    fn test_ingress_body_must_be_object() {
        assert!(SensorPayload::from_ingress_body(br#"{"temp": 90}"#).is_ok());
        assert!(matches!(
            SensorPayload::from_ingress_body(b"[1, 2, 3]"),
            Err(Error::MalformedInput(_))
        ));
        assert!(matches!(
            SensorPayload::from_ingress_body(b"not json"),
            Err(Error::MalformedInput(_))
        ));
        assert!(matches!(
            SensorPayload::from_ingress_body(b""),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_ingress_stamp_is_not_in_the_past() {
        let before = Utc::now().trunc_subsecs(3);
        let payload = SensorPayload::from_ingress_body(br#"{"temp": 90}"#).unwrap();
        assert!(payload.received_at() >= before);
    }
}
