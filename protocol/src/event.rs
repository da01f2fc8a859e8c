#[cfg(test)] use mockall::automock;
use serde_json::{Map, Value};
use crate::error::CourierError;

/// A structured log record: an ordered map of field names to JSON values
pub type Event = Map<String, Value>;

/// Turns events into the bytes carried in a JDAT payload and back. The client and server take
///  an implementation at construction time; [JsonSerializer] is the standard one.
#[cfg_attr(test, automock)]
pub trait EventSerializer: Send + Sync + 'static {
    fn serialize(&self, event: &Event) -> Result<Vec<u8>, CourierError>;

    /// Parses a single event. Fails if `raw` is not a JSON object.
    fn deserialize(&self, raw: &str) -> Result<Event, CourierError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl EventSerializer for JsonSerializer {
    fn serialize(&self, event: &Event) -> Result<Vec<u8>, CourierError> {
        serde_json::to_vec(event)
            .map_err(|e| CourierError::Serialization(e.to_string()))
    }

    fn deserialize(&self, raw: &str) -> Result<Event, CourierError> {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(event)) => Ok(event),
            Ok(other) => Err(CourierError::Serialization(format!("expected a JSON object, got {}", json_kind(&other)))),
            Err(e) => Err(CourierError::Serialization(e.to_string())),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_serialize() {
        let mut event = Event::new();
        event.insert("message".to_string(), json!("hello"));
        event.insert("level".to_string(), json!(3));

        let raw = JsonSerializer.serialize(&event).unwrap();
        assert_eq!(raw, br#"{"level":3,"message":"hello"}"#.to_vec());
    }

    #[rstest]
    #[case::object(r#"{"message":"x","n":1}"#, true)]
    #[case::empty_object("{}", true)]
    #[case::string(r#""just a string""#, false)]
    #[case::array("[1,2]", false)]
    #[case::number("17", false)]
    #[case::garbage("not json at all", false)]
    #[case::truncated(r#"{"message":"#, false)]
    fn test_deserialize(#[case] raw: &str, #[case] is_ok: bool) {
        assert_eq!(JsonSerializer.deserialize(raw).is_ok(), is_ok);
    }
}
