//! Raw and parsed telemetry records.
//!
//! A [`RawRecord`] is a broker message exactly as captured: topic, payload
//! text, QoS and retain flag, stamped with the capture time. It is immutable
//! once buffered and is always written to the raw rotation file.
//!
//! A [`ParsedRecord`] is derived by decomposing the topic path and the
//! payload structure. Motor-pump firmware publishes to topics shaped like
//! `sensors/<source>/<channel>` with a nested single-key payload:
//!
//! ```text
//! {"ITU-693": {"P1": {"RPM": 1500}}}
//! ```
//!
//! The source identifier comes from the second topic segment, the metric
//! name from the innermost payload key, and the value from the innermost
//! scalar. Any record that does not match this shape fails decomposition;
//! the raw file remains the durable source of truth for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A message captured from the broker, exactly as received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// When the message was received by the listener.
    pub captured_at: DateTime<Utc>,

    /// Full topic path the message was published to.
    pub topic: String,

    /// Payload decoded as UTF-8 text (lossy).
    pub payload: String,

    /// Quality-of-service level of the delivery.
    pub qos: u8,

    /// Whether the broker flagged the message as retained.
    pub retain: bool,
}

/// A record decomposed into source/metric/value form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    /// Capture time inherited from the raw record.
    pub captured_at: DateTime<Utc>,

    /// Source identifier taken from the topic path.
    pub source_id: String,

    /// Metric name taken from the innermost payload key.
    pub metric_name: String,

    /// Scalar value rendered as text; the lakehouse casts it to DOUBLE.
    pub value: String,
}

impl RawRecord {
    /// Decompose this record into a [`ParsedRecord`].
    ///
    /// Fails if the topic has fewer than 2 segments or the payload does not
    /// match the nested single-key shape. Failure is expected for
    /// housekeeping topics and malformed firmware messages; callers drop the
    /// parsed form and keep the raw one.
    pub fn parse(&self) -> Result<ParsedRecord> {
        let segments: Vec<&str> = self.topic.split('/').collect();
        if segments.len() < 2 {
            return Err(Error::TopicShape(self.topic.clone()));
        }
        let source_id = segments[1].to_string();

        let payload = parse_payload_json(&self.payload)?;
        let (_device, properties) = single_key_entry(&payload)?;
        let (_property, resources) = single_key_entry(properties)?;
        let (resource, value) = single_key_entry(resources)?;

        let value = match value {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(Error::PayloadShape(format!(
                    "expected a scalar value, found {other}"
                )))
            }
        };

        Ok(ParsedRecord {
            captured_at: self.captured_at,
            source_id,
            metric_name: resource.clone(),
            value,
        })
    }
}

/// Parse the payload as JSON.
///
/// Payloads that round-tripped through CSV quoting arrive with doubled
/// quotes; retry with those collapsed before giving up.
fn parse_payload_json(payload: &str) -> Result<Value> {
    match serde_json::from_str(payload) {
        Ok(v) => Ok(v),
        Err(_) => Ok(serde_json::from_str(&payload.replace("\"\"", "\""))?),
    }
}

/// Unwrap a JSON object expected to hold exactly one key.
fn single_key_entry(value: &Value) -> Result<(&String, &Value)> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::PayloadShape(format!("expected an object, found {value}")))?;
    if obj.len() != 1 {
        return Err(Error::PayloadShape(format!(
            "expected a single key, found {}",
            obj.len()
        )));
    }
    obj.iter()
        .next()
        .ok_or_else(|| Error::PayloadShape("empty object".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(topic: &str, payload: &str) -> RawRecord {
        RawRecord {
            captured_at: Utc::now(),
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos: 0,
            retain: false,
        }
    }

    #[test]
    fn test_parse_well_formed_record() {
        let record = raw("sensors/ITU-693/EngRPM", r#"{"ITU-693":{"P1":{"RPM":1500}}}"#);
        let parsed = record.parse().unwrap();
        assert_eq!(parsed.source_id, "ITU-693");
        assert_eq!(parsed.metric_name, "RPM");
        assert_eq!(parsed.value, "1500");
    }

    #[test]
    fn test_parse_string_value() {
        let record = raw("sensors/ITU-694/Status", r#"{"ITU-694":{"P2":{"MODE":"auto"}}}"#);
        let parsed = record.parse().unwrap();
        assert_eq!(parsed.metric_name, "MODE");
        assert_eq!(parsed.value, "auto");
    }

    #[test]
    fn test_parse_fractional_value() {
        let record = raw("sensors/ITU-693/OilPress", r#"{"ITU-693":{"P1":{"PSI":42.5}}}"#);
        let parsed = record.parse().unwrap();
        assert_eq!(parsed.value, "42.5");
    }

    #[test]
    fn test_short_topic_fails() {
        let record = raw("heartbeat", r#"{"ITU-693":{"P1":{"RPM":1500}}}"#);
        assert!(matches!(record.parse(), Err(Error::TopicShape(_))));
    }

    #[test]
    fn test_non_json_payload_fails() {
        let record = raw("sensors/ITU-693/EngRPM", "ONLINE");
        assert!(record.parse().is_err());
    }

    #[test]
    fn test_multi_key_payload_fails() {
        let record = raw(
            "sensors/ITU-693/EngRPM",
            r#"{"ITU-693":{"P1":{"RPM":1500}},"ITU-694":{}}"#,
        );
        assert!(matches!(record.parse(), Err(Error::PayloadShape(_))));
    }

    #[test]
    fn test_shallow_payload_fails() {
        let record = raw("sensors/ITU-693/EngRPM", r#"{"ITU-693": 1500}"#);
        assert!(matches!(record.parse(), Err(Error::PayloadShape(_))));
    }

    #[test]
    fn test_array_value_fails() {
        let record = raw(
            "sensors/ITU-693/EngRPM",
            r#"{"ITU-693":{"P1":{"RPM":[1,2]}}}"#,
        );
        assert!(matches!(record.parse(), Err(Error::PayloadShape(_))));
    }

    #[test]
    fn test_csv_doubled_quotes_cleaned() {
        // Payload as it appears after a CSV round-trip.
        let record = raw(
            "sensors/ITU-693/EngRPM",
            r#"{""ITU-693"":{""P1"":{""RPM"":1500}}}"#,
        );
        let parsed = record.parse().unwrap();
        assert_eq!(parsed.value, "1500");
    }

    #[test]
    fn test_source_from_topic_not_payload() {
        // The topic segment wins even when the payload names another device.
        let record = raw("sensors/ITU-695/EngRPM", r#"{"ITU-693":{"P1":{"RPM":9}}}"#);
        let parsed = record.parse().unwrap();
        assert_eq!(parsed.source_id, "ITU-695");
    }
}
