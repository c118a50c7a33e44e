//! Wire types for the control connection between a Bifrost server and a
//! backend agent: one newline-delimited JSON record per line, a `type`
//! tag selecting the variant, as described by the tunnel data-plane spec.

use serde::{Deserialize, Serialize};

use crate::request_id::RequestId;

/// Default port the control listener binds to, overridable by `BACKEND_PORT`
/// on the server and `SERVER_PORT` on the agent.
pub const CONTROL_PORT: u16 = 9041;

/// Hard cap on a single control-connection line. The original source never
/// enforced one; a conformant implementation closes the connection rather
/// than let an unbounded line grow the read buffer without limit.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Messages sent by the backend agent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame on a fresh control connection: presents the API key.
    Register { api_key: String },

    /// Acknowledges that the agent's dial to the target succeeded for
    /// `request_id`.
    Connect { request_id: RequestId },

    /// A chunk of bytes read from the target socket, base64-encoded.
    Data { request_id: RequestId, data: String },

    /// Graceful half-close: the target socket saw EOF.
    End { request_id: RequestId },

    /// Abortive failure on this request id (e.g. dial exhausted retries).
    Error { request_id: RequestId, error: String },
}

/// Messages sent by the server to the backend agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Registration accepted; `backend_id` is the agent's resolved identity.
    Registered { backend_id: String },

    /// Registration rejected because the presented API key did not
    /// resolve to a backend. Fatal for the agent.
    Unauthorized,

    /// Asks the agent to dial `target_ip:local_port` on behalf of a new
    /// end-user connection accepted on `tunnel_id`'s public listener.
    Request {
        request_id: RequestId,
        tunnel_id: String,
        local_port: u16,
        target_ip: String,
    },

    /// A chunk of bytes read from the end-user socket, base64-encoded.
    Data { request_id: RequestId, data: String },

    /// Graceful half-close: the end-user socket saw EOF.
    End { request_id: RequestId },

    /// Abortive failure on this request id.
    Error { request_id: RequestId, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid() -> RequestId {
        RequestId::generate()
    }

    #[test]
    fn client_message_round_trips_through_json() {
        let messages = vec![
            ClientMessage::Register {
                api_key: "sk_live_abc".into(),
            },
            ClientMessage::Connect { request_id: rid() },
            ClientMessage::Data {
                request_id: rid(),
                data: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"hi"),
            },
            ClientMessage::End { request_id: rid() },
            ClientMessage::Error {
                request_id: rid(),
                error: "boom".into(),
            },
        ];
        for m in messages {
            let line = serde_json::to_string(&m).unwrap();
            assert!(!line.contains('\n'));
            let back: ClientMessage = serde_json::from_str(&line).unwrap();
            assert_eq!(m, back);
        }
    }

    #[test]
    fn server_message_round_trips_through_json() {
        let messages = vec![
            ServerMessage::Registered {
                backend_id: "b1".into(),
            },
            ServerMessage::Unauthorized,
            ServerMessage::Request {
                request_id: rid(),
                tunnel_id: "t1".into(),
                local_port: 8080,
                target_ip: "127.0.0.1".into(),
            },
            ServerMessage::Data {
                request_id: rid(),
                data: "aGVsbG8=".into(),
            },
            ServerMessage::End { request_id: rid() },
            ServerMessage::Error {
                request_id: rid(),
                error: "unreachable".into(),
            },
        ];
        for m in messages {
            let line = serde_json::to_string(&m).unwrap();
            let back: ServerMessage = serde_json::from_str(&line).unwrap();
            assert_eq!(m, back);
        }
    }

    #[test]
    fn unknown_type_tag_fails_to_parse() {
        let err = serde_json::from_str::<ServerMessage>(r#"{"type":"bogus"}"#);
        assert!(err.is_err());
    }
}
