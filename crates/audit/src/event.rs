//! Audit event wire type. Field set is part of the external contract; once
//! an event is flushed it is immutable.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionRegister,
    SessionExpired,
    AuthFailure,
    AuthzDeny,
    ToolInvocation,
    RateLimited,
    HmacRotated,
    KillSwitchToggled,
    ProfileUpdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthzDecision {
    Permit,
    Deny,
}

/// One audit record. Serialized as newline-delimited JSON in the spill file
/// and handed to the sink as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub source_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downstream_mcp: Option<String>,
    /// Short verb phrase: `"register_session"`, `"invoke_tool"`, …
    pub action: String,
    #[serde(default)]
    pub request_summary: HashMap<String, Value>,
    #[serde(default)]
    pub response_summary: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authz_decision: Option<AuthzDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authz_policy: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        severity: Severity,
        action: impl Into<String>,
        source_ip: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            severity,
            session_id: None,
            client_id: None,
            user_id: None,
            source_ip: source_ip.into(),
            tool_name: None,
            downstream_mcp: None,
            action: action.into(),
            request_summary: HashMap::new(),
            response_summary: HashMap::new(),
            authz_decision: None,
            authz_policy: None,
            metadata: HashMap::new(),
        }
    }

    pub fn session(mut self, session_id: Uuid, user_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self.user_id = Some(user_id);
        self
    }

    pub fn tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn decision(mut self, decision: AuthzDecision) -> Self {
        self.authz_decision = Some(decision);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
