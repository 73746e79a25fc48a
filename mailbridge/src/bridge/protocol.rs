//! Message vocabulary for the extension channel.
//!
//! Inbound frames are loose JSON objects from an extension we don't control,
//! so they are classified by shape rather than deserialized into a closed
//! enum: anything unrecognised is logged and skipped. Outbound frames are
//! tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{EmailPayload, JobDescriptor, JobId};
use crate::version::MAILBRIDGE_VERSION;

/// A decoded frame body. Always a JSON object.
pub type Frame = serde_json::Map<String, Value>;

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Outcome of a forwarded job. Recognised by an `id` plus a `success` or
    /// `error` key, regardless of `type`.
    JobResult {
        id: String,
        success: bool,
        error: Option<String>,
    },
    /// Handshake; the peer is ready for jobs.
    Hello,
    /// The extension wants the bytes of a local attachment.
    GetFileData {
        id: Option<Value>,
        file_path: String,
    },
    Ping {
        timestamp: Option<Value>,
        request_id: Option<Value>,
    },
    /// Anything else. Logged and ignored.
    Other,
}

impl Inbound {
    pub fn classify(frame: &Frame) -> Self {
        let has_outcome = frame.contains_key("success") || frame.contains_key("error");
        if has_outcome && let Some(id) = frame.get("id").and_then(id_string) {
            return Inbound::JobResult {
                id,
                success: frame.get("success").and_then(Value::as_bool).unwrap_or(false),
                error: frame.get("error").and_then(error_string),
            };
        }

        match message_type(frame) {
            Some("hello") => Inbound::Hello,
            Some("getFileData") => Inbound::GetFileData {
                id: frame.get("id").cloned(),
                file_path: frame
                    .get("filePath")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            Some("ping") => Inbound::Ping {
                timestamp: frame.get("timestamp").cloned(),
                request_id: frame.get("requestId").cloned(),
            },
            _ => Inbound::Other,
        }
    }
}

/// The `type` field of a frame, if it is a string.
pub fn message_type(frame: &Frame) -> Option<&str> {
    frame.get("type").and_then(Value::as_str)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn error_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Messages the bridge sends to the extension.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Outbound {
    #[serde(rename = "sendEmail")]
    SendEmail { id: JobId, payload: EmailPayload },

    #[serde(rename = "hello_ack")]
    HelloAck { ts: i64, version: String },

    #[serde(rename = "fileDataResponse")]
    FileData(FileDataResponse),

    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
    },
}

impl Outbound {
    pub fn hello_ack() -> Self {
        Outbound::HelloAck {
            ts: chrono::Utc::now().timestamp_millis(),
            version: MAILBRIDGE_VERSION.to_string(),
        }
    }

    /// Wire `type` of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::SendEmail { .. } => "sendEmail",
            Outbound::HelloAck { .. } => "hello_ack",
            Outbound::FileData(_) => "fileDataResponse",
            Outbound::Pong { .. } => "pong",
        }
    }
}

impl From<&JobDescriptor> for Outbound {
    fn from(job: &JobDescriptor) -> Self {
        Outbound::SendEmail {
            id: job.id.clone(),
            payload: job.payload.clone(),
        }
    }
}

/// Reply to `getFileData`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDataResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileDataResponse {
    pub fn success(
        id: Option<Value>,
        data: String,
        name: String,
        size: u64,
        mime_type: String,
    ) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            name: Some(name),
            size: Some(size),
            mime_type: Some(mime_type),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            data: None,
            name: None,
            size: None,
            mime_type: None,
            error: Some(error.into()),
        }
    }
}

/// Requests the socket channel issues; `requestId` is added when sent.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelRequest {
    SendEmail {
        #[serde(rename = "emailData")]
        email_data: EmailPayload,
    },
    CheckAvailability,
    GetAccounts,
    Ping {
        timestamp: i64,
    },
}

/// Reply to a `sendEmail` request on the socket channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A mail account as reported by the extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub identities: Vec<Identity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::AttachmentRef;
    use serde_json::json;

    fn frame(value: Value) -> Frame {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn result_recognised_by_shape() {
        let msg = frame(json!({"id": "job-1", "success": true}));
        assert_eq!(
            Inbound::classify(&msg),
            Inbound::JobResult {
                id: "job-1".into(),
                success: true,
                error: None
            }
        );

        let msg = frame(json!({"type": "sendError", "id": "job-2", "error": "SMTP refused"}));
        assert_eq!(
            Inbound::classify(&msg),
            Inbound::JobResult {
                id: "job-2".into(),
                success: false,
                error: Some("SMTP refused".into())
            }
        );
    }

    #[test]
    fn result_check_precedes_type() {
        let msg = frame(json!({"type": "hello", "id": 7, "success": true}));
        assert!(matches!(
            Inbound::classify(&msg),
            Inbound::JobResult { id, .. } if id == "7"
        ));
    }

    #[test]
    fn empty_error_is_dropped() {
        let msg = frame(json!({"id": "job-3", "success": true, "error": ""}));
        assert!(matches!(
            Inbound::classify(&msg),
            Inbound::JobResult { error: None, .. }
        ));
    }

    #[test]
    fn classify_control_messages() {
        assert_eq!(Inbound::classify(&frame(json!({"type": "hello"}))), Inbound::Hello);
        assert_eq!(
            Inbound::classify(&frame(json!({"type": "getFileData", "id": 4, "filePath": "/tmp/a.pdf"}))),
            Inbound::GetFileData {
                id: Some(json!(4)),
                file_path: "/tmp/a.pdf".into()
            }
        );
        assert!(matches!(
            Inbound::classify(&frame(json!({"type": "ping", "timestamp": 10}))),
            Inbound::Ping { timestamp: Some(_), request_id: None }
        ));
        assert_eq!(Inbound::classify(&frame(json!({"type": "status"}))), Inbound::Other);
        assert_eq!(Inbound::classify(&frame(json!({"id": "x"}))), Inbound::Other);
    }

    #[test]
    fn kind_matches_serialized_type() {
        let messages = [
            Outbound::hello_ack(),
            Outbound::FileData(FileDataResponse::failure(None, "File not found")),
            Outbound::Pong {
                timestamp: None,
                request_id: None,
            },
        ];
        for msg in messages {
            assert_eq!(serde_json::to_value(&msg).unwrap()["type"], msg.kind());
        }
    }

    #[test]
    fn outbound_send_email_shape() {
        let msg = Outbound::SendEmail {
            id: JobId::parse("job-1").unwrap(),
            payload: EmailPayload {
                to: vec!["a@x.com".into()],
                cc: vec![],
                bcc: vec![],
                subject: "S".into(),
                body_html: "<p>B</p>".into(),
                attachments: vec![AttachmentRef::new("/tmp/report.pdf")],
            },
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "sendEmail",
          "id": "job-1",
          "payload": {
            "to": [
              "a@x.com"
            ],
            "cc": [],
            "bcc": [],
            "subject": "S",
            "bodyHtml": "<p>B</p>",
            "attachments": [
              {
                "path": "/tmp/report.pdf"
              }
            ]
          }
        }
        "#);
    }

    #[test]
    fn outbound_file_data_shapes() {
        let ok = Outbound::FileData(FileDataResponse::success(
            Some(json!(3)),
            "aGk=".into(),
            "a.txt".into(),
            2,
            "text/plain".into(),
        ));
        insta::assert_json_snapshot!(ok, @r#"
        {
          "type": "fileDataResponse",
          "id": 3,
          "success": true,
          "data": "aGk=",
          "name": "a.txt",
          "size": 2,
          "mimeType": "text/plain"
        }
        "#);

        let err = Outbound::FileData(FileDataResponse::failure(None, "File not found"));
        insta::assert_json_snapshot!(err, @r#"
        {
          "type": "fileDataResponse",
          "success": false,
          "error": "File not found"
        }
        "#);
    }

    #[test]
    fn hello_ack_carries_version() {
        let value = serde_json::to_value(Outbound::hello_ack()).unwrap();
        assert_eq!(value["type"], "hello_ack");
        assert_eq!(value["version"], MAILBRIDGE_VERSION);
        assert!(value["ts"].as_i64().unwrap() > 0);
    }

    #[test]
    fn channel_request_tags() {
        insta::assert_json_snapshot!(ChannelRequest::CheckAvailability, @r#"
        {
          "type": "checkAvailability"
        }
        "#);
        insta::assert_json_snapshot!(ChannelRequest::GetAccounts, @r#"
        {
          "type": "getAccounts"
        }
        "#);
    }

    #[test]
    fn accounts_tolerate_missing_fields() {
        let accounts: Vec<Account> = serde_json::from_value(json!([
            {"id": "account1", "name": "Work", "type": "imap",
             "identities": [{"id": "id1", "email": "me@work.example"}]},
            {"id": "account2"}
        ]))
        .unwrap();

        assert_eq!(accounts[0].identities[0].email, "me@work.example");
        assert_eq!(accounts[1].kind, "");
    }
}
