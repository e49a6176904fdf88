//! Wire protocol types for controller-worker communication.
//!
//! Two directions:
//! - **Send** (controller to worker): `call`, `event`
//! - **Return** (worker to controller): `call_result`, `call_event`, `pure_event`
//!
//! Every message travels inside an [`Envelope`] together with the buffers
//! whose ownership moves with it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::bytes::Bytes;

/// Call identifier, unique among outstanding calls of one channel.
///
/// Allocated from 1 upwards and never reused.
pub type CallId = u64;

/// Messages from controller to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SendMessage {
    Call(CallPayload),
    Event(PureEventPayload),
}

/// Messages from worker to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ReturnMessage {
    CallResult(CallResultPayload),
    /// Progress notification scoped to one outstanding call.
    CallEvent(CallEventPayload),
    PureEvent(PureEventPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    pub id: CallId,
    pub method: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEventPayload {
    pub id: CallId,
    pub event_name: String,
    pub args: Vec<Value>,
}

/// Channel-scoped broadcast, not tied to any call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PureEventPayload {
    pub event_name: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResultPayload {
    pub status: ResultStatus,
    pub id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<RemoteFault>,
}

impl CallResultPayload {
    pub fn success(id: CallId, data: Value) -> Self {
        Self {
            status: ResultStatus::Success,
            id,
            data: Some(data),
            err: None,
        }
    }

    pub fn failure(id: CallId, err: RemoteFault) -> Self {
        Self {
            status: ResultStatus::Error,
            id,
            data: None,
            err: Some(err),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    /// Success data (`null` when omitted) or the carried fault.
    pub fn into_outcome(self) -> Result<Value, RemoteFault> {
        match self.status {
            ResultStatus::Success => Ok(self.data.unwrap_or(Value::Null)),
            ResultStatus::Error => Err(self.err.unwrap_or(RemoteFault::Value(Value::Null))),
        }
    }
}

/// Transportable rendering of a failure raised while handling a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorRecord {
    pub message: String,
    pub name: String,
    pub trace: String,
}

/// A failure as carried on the wire.
///
/// Raised values that are not error records travel verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteFault {
    Record(ErrorRecord),
    Value(Value),
}

impl RemoteFault {
    pub fn message(&self) -> String {
        match self {
            Self::Record(record) => record.message.clone(),
            Self::Value(Value::String(s)) => s.clone(),
            Self::Value(other) => other.to_string(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Record(record) => Some(&record.name),
            Self::Value(_) => None,
        }
    }

    pub fn record(&self) -> Option<&ErrorRecord> {
        match self {
            Self::Record(record) => Some(record),
            Self::Value(_) => None,
        }
    }
}

impl std::fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

/// A message plus the storage transferred with it.
///
/// On byte streams the buffers are base64-encoded next to the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    pub message: M,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "transfer_encoding")]
    pub transfers: Vec<Bytes>,
}

impl<M> Envelope<M> {
    pub fn new(message: M) -> Self {
        Self {
            message,
            transfers: Vec::new(),
        }
    }

    pub fn with_transfers(message: M, transfers: Vec<Bytes>) -> Self {
        Self { message, transfers }
    }
}

mod transfer_encoding {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};
    use tokio_util::bytes::Bytes;

    pub fn serialize<S: Serializer>(transfers: &[Bytes], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(transfers.iter().map(|b| STANDARD.encode(b)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Bytes>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .into_iter()
            .map(|s| {
                STANDARD
                    .decode(s)
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_serializes() {
        let msg = SendMessage::Call(CallPayload {
            id: 7,
            method: "foo".to_string(),
            args: vec![json!("bar")],
        });
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "call",
          "payload": {
            "id": 7,
            "method": "foo",
            "args": [
              "bar"
            ]
          }
        }
        "#);
    }

    #[test]
    fn pure_event_serializes() {
        let msg = SendMessage::Event(PureEventPayload {
            event_name: "reload".to_string(),
            args: vec![],
        });
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "event",
          "payload": {
            "event_name": "reload",
            "args": []
          }
        }
        "#);
    }

    #[test]
    fn success_result_serializes() {
        let msg = ReturnMessage::CallResult(CallResultPayload::success(3, json!("foobar")));
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "call_result",
          "payload": {
            "status": "success",
            "id": 3,
            "data": "foobar"
          }
        }
        "#);
    }

    #[test]
    fn error_result_serializes() {
        let fault = RemoteFault::Record(ErrorRecord {
            message: "Method foo is unhandled".to_string(),
            name: "UnhandledMethodError".to_string(),
            trace: "UnhandledMethodError: Method foo is unhandled".to_string(),
        });
        let msg = ReturnMessage::CallResult(CallResultPayload::failure(4, fault));
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "call_result",
          "payload": {
            "status": "error",
            "id": 4,
            "err": {
              "message": "Method foo is unhandled",
              "name": "UnhandledMethodError",
              "trace": "UnhandledMethodError: Method foo is unhandled"
            }
          }
        }
        "#);
    }

    #[test]
    fn call_event_serializes() {
        let msg = ReturnMessage::CallEvent(CallEventPayload {
            id: 9,
            event_name: "progress".to_string(),
            args: vec![json!(0.5)],
        });
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "call_event",
          "payload": {
            "id": 9,
            "event_name": "progress",
            "args": [
              0.5
            ]
          }
        }
        "#);
    }

    #[test]
    fn fault_without_record_fields_stays_verbatim() {
        let fault: RemoteFault = serde_json::from_value(json!({"code": 42})).unwrap();
        assert_eq!(fault, RemoteFault::Value(json!({"code": 42})));
        assert_eq!(fault.name(), None);
        assert_eq!(fault.message(), r#"{"code":42}"#);

        let fault: RemoteFault = serde_json::from_value(json!("plain")).unwrap();
        assert_eq!(fault.message(), "plain");
    }

    #[test]
    fn fault_with_record_fields_parses_as_record() {
        let fault: RemoteFault = serde_json::from_value(json!({
            "message": "FooError",
            "name": "Error",
            "trace": "Error: FooError"
        }))
        .unwrap();
        assert_eq!(fault.name(), Some("Error"));
        assert_eq!(fault.to_string(), "FooError");
    }

    #[test]
    fn record_shaped_fault_with_extra_keys_stays_verbatim() {
        let raised = json!({
            "message": "FooError",
            "name": "Error",
            "trace": "Error: FooError",
            "code": 7
        });
        let fault: RemoteFault = serde_json::from_value(raised.clone()).unwrap();
        assert_eq!(fault, RemoteFault::Value(raised.clone()));
        assert_eq!(serde_json::to_value(&fault).unwrap(), raised);
    }

    #[test]
    fn null_success_data_reads_as_null() {
        let payload: CallResultPayload =
            serde_json::from_value(json!({"status": "success", "id": 1, "data": null})).unwrap();
        assert_eq!(payload.into_outcome().unwrap(), Value::Null);
    }

    #[test]
    fn error_without_err_field_reads_as_null_fault() {
        let payload: CallResultPayload =
            serde_json::from_value(json!({"status": "error", "id": 1})).unwrap();
        assert_eq!(
            payload.into_outcome().unwrap_err(),
            RemoteFault::Value(Value::Null)
        );
    }

    #[test]
    fn unknown_message_kind_is_rejected() {
        let parsed = serde_json::from_value::<ReturnMessage>(json!({
            "type": "telemetry",
            "payload": {}
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn envelope_carries_transfers_as_base64() {
        let envelope = Envelope::with_transfers(
            SendMessage::Event(PureEventPayload {
                event_name: "blob".to_string(),
                args: vec![],
            }),
            vec![Bytes::from_static(b"hi")],
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["transfers"], json!(["aGk="]));

        let back: Envelope<SendMessage> = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn envelope_without_transfers_omits_field() {
        let envelope = Envelope::new(ReturnMessage::PureEvent(PureEventPayload {
            event_name: "tick".to_string(),
            args: vec![json!(1)],
        }));
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("transfers").is_none());
    }
}
