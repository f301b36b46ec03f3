//! ACP schema records used by the runtime.
//!
//! These are plain serde records; they carry no behavior beyond
//! (de)serialization. Only the handful the runtime itself touches
//! (handshake, cancellation, sessions, pagination) live here.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::RequestId;

/// ACP protocol version spoken by this runtime.
pub const PROTOCOL_VERSION: u16 = 1;

/// Method names.
pub mod methods {
    /// Handshake request.
    pub const INITIALIZE: &str = "initialize";
    /// Authentication request.
    pub const AUTHENTICATE: &str = "authenticate";
    /// Creates a session.
    pub const SESSION_NEW: &str = "session/new";
    /// Lists sessions, cursor-paginated.
    pub const SESSION_LIST: &str = "session/list";
    /// Starts a prompt turn.
    pub const SESSION_PROMPT: &str = "session/prompt";
    /// Streaming update notification for a prompt turn.
    pub const SESSION_UPDATE: &str = "session/update";
    /// Cancels the active prompt turn of a session.
    pub const SESSION_CANCEL: &str = "session/cancel";
    /// Protocol-level request cancellation notification.
    pub const CANCEL_REQUEST: &str = "$/cancelRequest";
}

/// Free-form `_meta` map carried by most records.
pub type Meta = Map<String, Value>;

/// Session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        SessionId(id.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        SessionId(id)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns true if `capabilities._meta.<name>` is advertised.
///
/// A capability counts as advertised when it is `true` or an object.
#[must_use]
pub fn extension_advertised(capabilities: &Value, name: &str) -> bool {
    matches!(
        capabilities.get("_meta").and_then(|meta| meta.get(name)),
        Some(Value::Bool(true) | Value::Object(_))
    )
}

/// File system capabilities offered by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemCapability {
    /// Client can serve `fs/read_text_file`.
    #[serde(default)]
    pub read_text_file: bool,
    /// Client can serve `fs/write_text_file`.
    #[serde(default)]
    pub write_text_file: bool,
}

/// Capabilities a client advertises during `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    /// File system operations.
    #[serde(default)]
    pub fs: FileSystemCapability,
    /// Client can run terminal commands.
    #[serde(default)]
    pub terminal: bool,
    /// Extension advertisements.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// Prompt content an agent accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptCapabilities {
    /// Image content blocks.
    #[serde(default)]
    pub image: bool,
    /// Audio content blocks.
    #[serde(default)]
    pub audio: bool,
    /// Embedded resource content blocks.
    #[serde(default)]
    pub embedded_context: bool,
}

/// Capabilities an agent advertises in its `initialize` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    /// Agent supports `session/load`.
    #[serde(default)]
    pub load_session: bool,
    /// Accepted prompt content.
    #[serde(default)]
    pub prompt_capabilities: PromptCapabilities,
    /// Extension advertisements.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// `initialize` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    /// Latest protocol version the client speaks.
    pub protocol_version: u16,
    /// What the client can serve.
    #[serde(default)]
    pub client_capabilities: ClientCapabilities,
    /// Extension data.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl InitializeRequest {
    /// Creates a request for the current protocol version.
    #[must_use]
    pub fn new(client_capabilities: ClientCapabilities) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            client_capabilities,
            meta: None,
        }
    }
}

/// An authentication method offered by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthMethod {
    /// Id passed back in `authenticate`.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Optional description shown to the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// `initialize` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    /// Protocol version the agent settled on.
    pub protocol_version: u16,
    /// What the agent supports.
    #[serde(default)]
    pub agent_capabilities: AgentCapabilities,
    /// Authentication methods, empty when none is required.
    #[serde(default)]
    pub auth_methods: Vec<AuthMethod>,
    /// Extension data.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// `authenticate` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    /// One of the advertised [`AuthMethod`] ids.
    pub method_id: String,
}

/// `authenticate` response.
///
/// Agents may answer with a bare `null` result, which decodes to the
/// default value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuthenticateResponse {
    /// Extension data.
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl<'de> Deserialize<'de> for AuthenticateResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr {
            #[serde(rename = "_meta", default)]
            meta: Option<Meta>,
        }

        Ok(Option::<Repr>::deserialize(deserializer)?
            .map(|repr| AuthenticateResponse { meta: repr.meta })
            .unwrap_or_default())
    }
}

/// `session/new` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionRequest {
    /// Absolute working directory of the session.
    pub cwd: String,
    /// MCP server descriptors, passed through untouched.
    #[serde(default)]
    pub mcp_servers: Vec<Value>,
}

/// `session/new` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    /// Id of the created session.
    pub session_id: SessionId,
    /// Extension data.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// Params of the `$/cancelRequest` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequestParams {
    /// The request being cancelled.
    pub request_id: RequestId,
    /// Optional human-readable reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A session summary returned by `session/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    /// Working directory the session was created with.
    pub cwd: String,
    /// Optional display title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// `session/list` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsRequest {
    /// Cursor for pagination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Restrict to sessions rooted at this directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// `session/list` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsResponse {
    /// One page of sessions.
    pub sessions: Vec<SessionInfo>,
    /// Next cursor for pagination (`null` on the last page).
    pub next_cursor: Option<String>,
}

/// Why a prompt turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
}

/// `session/update` notification params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdateNotification {
    /// Session the update belongs to.
    pub session_id: SessionId,
    /// The update payload, kept as raw JSON.
    pub update: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn authenticate_response_decodes_from_null() {
        let resp: AuthenticateResponse = serde_json::from_value(Value::Null).unwrap();
        assert_eq!(resp, AuthenticateResponse::default());

        let resp: AuthenticateResponse =
            serde_json::from_value(json!({"_meta": {"k": 1}})).unwrap();
        assert_eq!(resp.meta.unwrap()["k"], 1);
    }

    #[test]
    fn cancel_params_use_camel_case() {
        let params = CancelRequestParams {
            request_id: RequestId::Number(4),
            message: Some("user aborted".to_owned()),
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json, json!({"requestId": 4, "message": "user aborted"}));

        let parsed: CancelRequestParams =
            serde_json::from_value(json!({"requestId": "r-1"})).unwrap();
        assert_eq!(parsed.request_id, RequestId::from("r-1"));
        assert!(parsed.message.is_none());
    }

    #[test]
    fn extension_advertisement_reads_meta() {
        let caps = serde_json::to_value(ClientCapabilities {
            meta: Some(
                json!({"zed.dev/terminal-output": true, "x/off": false, "y/obj": {}})
                    .as_object()
                    .cloned()
                    .unwrap(),
            ),
            ..ClientCapabilities::default()
        })
        .unwrap();
        assert!(extension_advertised(&caps, "zed.dev/terminal-output"));
        assert!(extension_advertised(&caps, "y/obj"));
        assert!(!extension_advertised(&caps, "x/off"));
        assert!(!extension_advertised(&caps, "missing"));
        assert!(!extension_advertised(&json!({}), "missing"));
    }

    #[test]
    fn initialize_request_defaults_capabilities() {
        let req: InitializeRequest = serde_json::from_value(json!({"protocolVersion": 1})).unwrap();
        assert_eq!(req.protocol_version, PROTOCOL_VERSION);
        assert_eq!(req.client_capabilities, ClientCapabilities::default());
    }

    #[test]
    fn list_sessions_response_emits_null_cursor() {
        let json = serde_json::to_value(ListSessionsResponse::default()).unwrap();
        assert_eq!(json, json!({"sessions": [], "nextCursor": null}));
    }
}
