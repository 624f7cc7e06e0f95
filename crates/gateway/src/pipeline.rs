//! The AAA pipeline: authenticate → kill-switch → authorize → invoke →
//! audit.
//!
//! Every tool call funnels through [`Pipeline::invoke`]. The routing step is
//! a parameter so the HTTP layer passes the real tool router and tests pass
//! closures. Errors leaving the pipeline are taxonomy variants; the HTTP
//! layer shapes them into generic client responses.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use amb_audit::{AuditBuffer, AuditEvent, AuthzDecision, EventType, Severity};
use amb_authz::{authorize, resolve_effective_profile, EffectiveProfile};
use amb_domain::config::AuditFailureMode;
use amb_domain::entity::{SessionContext, ToolProfile};
use amb_domain::error::{Error, Result};
use amb_mcp::ToolCallResult;
use amb_sessions::{EphemeralAuthProvider, SessionRepository};

use crate::kill_switch::KillSwitchTable;

/// A tool invocation as submitted by the client.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct InvokeRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
    /// Optional caller environment, matched against profile scope.
    #[serde(default)]
    pub environment: Option<String>,
}

/// A permitted, executed invocation.
#[derive(Debug)]
pub struct InvokeOutcome {
    pub result: ToolCallResult,
    pub duration_ms: u64,
}

pub struct Pipeline {
    repo: Arc<dyn SessionRepository>,
    auth: Arc<EphemeralAuthProvider>,
    kill_switches: Arc<KillSwitchTable>,
    audit: Arc<AuditBuffer>,
    failure_mode: AuditFailureMode,
    node_name: String,
}

impl Pipeline {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        auth: Arc<EphemeralAuthProvider>,
        kill_switches: Arc<KillSwitchTable>,
        audit: Arc<AuditBuffer>,
        failure_mode: AuditFailureMode,
        node_name: String,
    ) -> Self {
        Self {
            repo,
            auth,
            kill_switches,
            audit,
            failure_mode,
            node_name,
        }
    }

    /// Run the full chain for one tool call. `route` receives the
    /// authenticated context, the tool name, and the arguments once the call
    /// is permitted.
    pub async fn invoke<F, Fut>(
        &self,
        token: &str,
        source_ip: &str,
        req: InvokeRequest,
        route: F,
    ) -> Result<InvokeOutcome>
    where
        F: FnOnce(SessionContext, String, Value) -> Fut,
        Fut: Future<Output = Result<ToolCallResult>>,
    {
        let now = Utc::now();

        // 1. Authenticate.
        let ctx = match self.auth.authenticate(token, source_ip, now).await {
            Ok(ctx) => ctx,
            Err(e) => {
                self.emit(
                    AuditEvent::new(
                        EventType::AuthFailure,
                        Severity::Warn,
                        "invoke_tool",
                        source_ip,
                    )
                    .tool(&req.tool)
                    .meta("node", Value::String(self.node_name.clone())),
                )?;
                return Err(e);
            }
        };

        // 2. Kill switches, before any policy work.
        if let Some(entry) = self.kill_switches.blocking(&req.tool, ctx.user_id) {
            self.emit(
                self.event_for(&ctx, EventType::AuthzDeny, Severity::Warn, source_ip)
                    .tool(&req.tool)
                    .decision(AuthzDecision::Deny)
                    .meta(
                        "kill_switch",
                        serde_json::json!({ "kind": entry.kind, "target": entry.target }),
                    ),
            )?;
            return Err(Error::KillSwitch(format!("{:?}", entry.kind)));
        }

        // 3. Authorize.
        let profile = self.effective_profile(ctx.profile_id).await?;
        let decision = authorize(&profile, &req.tool, req.environment.as_deref(), now);
        if !decision.permit {
            let mut event = self
                .event_for(&ctx, EventType::AuthzDeny, Severity::Warn, source_ip)
                .tool(&req.tool)
                .decision(AuthzDecision::Deny)
                .meta("reason", Value::String(decision.reason.clone()));
            event.authz_policy = decision.policy.clone();
            self.emit(event)?;
            return Err(Error::Forbidden);
        }

        // 4. Invoke through the supplied router.
        let started = Instant::now();
        let result = route(ctx.clone(), req.tool.clone(), req.arguments.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        // 5. Audit with sanitized summaries: the argument hash goes in, the
        //    arguments do not.
        let severity = if result.is_ok() {
            Severity::Info
        } else {
            Severity::Warn
        };
        let mut event = self
            .event_for(&ctx, EventType::ToolInvocation, severity, source_ip)
            .tool(&req.tool)
            .decision(AuthzDecision::Permit);
        event.authz_policy = decision.policy.clone();
        event.request_summary = request_summary(&req.arguments);
        event.response_summary = match &result {
            Ok(r) => {
                let bytes: usize = r.content.iter().map(|c| c.text.len()).sum();
                HashMap::from([
                    (
                        "status".to_owned(),
                        Value::String(if r.is_error { "tool_error" } else { "ok" }.into()),
                    ),
                    ("duration_ms".to_owned(), Value::from(duration_ms)),
                    ("content_items".to_owned(), Value::from(r.content.len())),
                    ("bytes".to_owned(), Value::from(bytes)),
                ])
            }
            Err(e) => HashMap::from([
                (
                    "status".to_owned(),
                    Value::String("downstream_error".into()),
                ),
                ("duration_ms".to_owned(), Value::from(duration_ms)),
                // Server-side record only; never echoed to the client.
                ("detail".to_owned(), Value::String(e.to_string())),
            ]),
        };
        self.emit(event)?;

        // 6. A completed call counts as session activity.
        if result.is_ok() {
            if let Err(e) = self.auth.touch_activity(ctx.session_id, now).await {
                tracing::warn!(error = %e, "failed to record session activity");
            }
        }

        result.map(|result| InvokeOutcome {
            result,
            duration_ms,
        })
    }

    /// Resolve the effective profile for a session's profile id.
    pub async fn effective_profile(&self, profile_id: Uuid) -> Result<EffectiveProfile> {
        let profiles: HashMap<Uuid, ToolProfile> = self
            .repo
            .list_profiles()
            .await?
            .into_iter()
            .map(|p| (p.profile_id, p))
            .collect();
        resolve_effective_profile(&profiles, profile_id)
    }

    /// Emit into the buffer, honoring the failure mode: `buffer` never fails
    /// the request; `block` fails it when the event could not be absorbed.
    pub fn emit(&self, event: AuditEvent) -> Result<()> {
        let absorbed = self.audit.add(event);
        if !absorbed && self.failure_mode == AuditFailureMode::Block {
            return Err(Error::AuditBacklog);
        }
        Ok(())
    }

    fn event_for(
        &self,
        ctx: &SessionContext,
        event_type: EventType,
        severity: Severity,
        source_ip: &str,
    ) -> AuditEvent {
        AuditEvent::new(event_type, severity, "invoke_tool", source_ip)
            .session(ctx.session_id, ctx.user_id)
            .meta("node", Value::String(self.node_name.clone()))
    }
}

fn request_summary(arguments: &Value) -> HashMap<String, Value> {
    let raw = serde_json::to_vec(arguments).unwrap_or_default();
    HashMap::from([
        (
            "args_sha256".to_owned(),
            Value::String(hex::encode(Sha256::digest(&raw))),
        ),
        ("args_bytes".to_owned(), Value::from(raw.len())),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use amb_audit::MemorySink;
    use amb_domain::config::{AuditConfig, SessionsConfig};
    use amb_domain::entity::{KeyStatus, PresharedKey, RateLimits, User, UserStatus};
    use amb_mcp::protocol::ToolCallContent;
    use amb_sessions::{keys::generate_key, HmacSecret, MemoryRepository};

    struct Fixture {
        pipeline: Pipeline,
        audit: Arc<AuditBuffer>,
        sink: Arc<MemorySink>,
        kill_switches: Arc<KillSwitchTable>,
        token: String,
        _dir: tempfile::TempDir,
    }

    async fn fixture(profile: ToolProfile, audit_config: AuditConfig) -> Fixture {
        fixture_with_mode(profile, audit_config, AuditFailureMode::Buffer).await
    }

    async fn fixture_with_mode(
        profile: ToolProfile,
        audit_config: AuditConfig,
        mode: AuditFailureMode,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(MemoryRepository::new());
        let secret_path = dir.path().join("hmac.secret");
        let secret = Arc::new(HmacSecret::load_or_create(&secret_path).unwrap());

        let user_id = Uuid::new_v4();
        repo.insert_user(User {
            user_id,
            display_name: "dev".into(),
            status: UserStatus::Active,
            auth_source: "seed".into(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
        let profile_id = profile.profile_id;
        repo.upsert_profile(profile).await.unwrap();

        let generated = generate_key();
        repo.insert_key(PresharedKey {
            key_id: Uuid::new_v4(),
            key_prefix: generated.prefix.clone(),
            key_salt: generated.salt_hex.clone(),
            key_hash: generated.hash_hex.clone(),
            user_id,
            profile_id,
            status: KeyStatus::Active,
            created_at: Utc::now(),
            expires_at: None,
        })
        .await
        .unwrap();

        let auth = Arc::new(EphemeralAuthProvider::new(
            repo.clone(),
            secret,
            secret_path,
            SessionsConfig::default(),
        ));
        let registered = auth
            .register_session(&generated.raw, "10.0.0.1", Utc::now())
            .await
            .unwrap();

        let sink = Arc::new(MemorySink::default());
        let audit = Arc::new(AuditBuffer::new(audit_config, sink.clone()));
        let kill_switches = Arc::new(KillSwitchTable::new());

        Fixture {
            pipeline: Pipeline::new(
                repo,
                auth,
                kill_switches.clone(),
                audit.clone(),
                mode,
                "ambassador-test".into(),
            ),
            audit,
            sink,
            kill_switches,
            token: registered.session_token,
            _dir: dir,
        }
    }

    fn profile(allowed: &[&str], denied: &[&str]) -> ToolProfile {
        ToolProfile {
            profile_id: Uuid::new_v4(),
            name: "test".into(),
            allowed_tools: allowed.iter().map(|s| s.to_string()).collect(),
            denied_tools: denied.iter().map(|s| s.to_string()).collect(),
            rate_limits: RateLimits::default(),
            environment_scope: Vec::new(),
            time_restrictions: Vec::new(),
            inherited_from: None,
        }
    }

    fn echo_result(text: &str) -> ToolCallResult {
        ToolCallResult {
            content: vec![ToolCallContent {
                content_type: "text".into(),
                text: text.into(),
            }],
            is_error: false,
        }
    }

    #[tokio::test]
    async fn happy_path_invoke_audits_permit() {
        let f = fixture(profile(&["*"], &[]), AuditConfig::default()).await;
        let outcome = f
            .pipeline
            .invoke(
                &f.token,
                "10.0.0.1",
                InvokeRequest {
                    tool: "demo.echo".into(),
                    arguments: serde_json::json!({ "x": 1 }),
                    environment: None,
                },
                |_, _, args| async move { Ok(echo_result(&args.to_string())) },
            )
            .await
            .unwrap();
        assert!(outcome.result.content[0].text.contains("\"x\":1"));

        f.audit.flush().await;
        let events = f.sink.all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ToolInvocation);
        assert_eq!(events[0].authz_decision, Some(AuthzDecision::Permit));
        assert_eq!(events[0].tool_name.as_deref(), Some("demo.echo"));
        // Arguments are hashed, never recorded raw.
        assert!(events[0].request_summary.contains_key("args_sha256"));
        assert!(!serde_json::to_string(&events[0]).unwrap().contains("\"x\":1"));
    }

    #[tokio::test]
    async fn deny_glob_beats_allow_and_audits_deny() {
        let f = fixture(profile(&["*"], &["*.write_*"]), AuditConfig::default()).await;
        let err = f
            .pipeline
            .invoke(
                &f.token,
                "10.0.0.1",
                InvokeRequest {
                    tool: "fs.write_file".into(),
                    arguments: serde_json::json!({}),
                    environment: None,
                },
                |_, _, _| async move { panic!("router must not run on deny") },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden));

        f.audit.flush().await;
        let events = f.sink.all();
        assert_eq!(events[0].event_type, EventType::AuthzDeny);
        assert_eq!(events[0].severity, Severity::Warn);
        assert_eq!(events[0].authz_policy.as_deref(), Some("*.write_*"));
    }

    #[tokio::test]
    async fn bad_token_audits_auth_failure() {
        let f = fixture(profile(&["*"], &[]), AuditConfig::default()).await;
        let err = f
            .pipeline
            .invoke(
                "garbage-token",
                "10.0.0.9",
                InvokeRequest {
                    tool: "demo.echo".into(),
                    arguments: Value::Null,
                    environment: None,
                },
                |_, _, _| async move { panic!("router must not run unauthenticated") },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized));

        f.audit.flush().await;
        let events = f.sink.all();
        assert_eq!(events[0].event_type, EventType::AuthFailure);
        assert!(events[0].session_id.is_none());
    }

    #[tokio::test]
    async fn kill_switch_short_circuits_before_authorization() {
        let f = fixture(profile(&["*"], &[]), AuditConfig::default()).await;
        f.kill_switches
            .engage(crate::kill_switch::KillSwitchKind::Global, "", None);

        let err = f
            .pipeline
            .invoke(
                &f.token,
                "10.0.0.1",
                InvokeRequest {
                    tool: "demo.echo".into(),
                    arguments: Value::Null,
                    environment: None,
                },
                |_, _, _| async move { panic!("router must not run while killed") },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KillSwitch(_)));

        f.audit.flush().await;
        assert_eq!(f.sink.all()[0].event_type, EventType::AuthzDeny);
    }

    #[tokio::test]
    async fn downstream_error_is_surfaced_and_audited() {
        let f = fixture(profile(&["*"], &[]), AuditConfig::default()).await;
        let err = f
            .pipeline
            .invoke(
                &f.token,
                "10.0.0.1",
                InvokeRequest {
                    tool: "demo.echo".into(),
                    arguments: Value::Null,
                    environment: None,
                },
                |_, _, _| async move { Err(Error::DownstreamTimeout("MCP demo".into())) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DownstreamTimeout(_)));

        f.audit.flush().await;
        let events = f.sink.all();
        assert_eq!(events[0].event_type, EventType::ToolInvocation);
        assert_eq!(events[0].severity, Severity::Warn);
        assert_eq!(
            events[0].response_summary["status"],
            Value::String("downstream_error".into())
        );
    }

    #[tokio::test]
    async fn tool_error_payload_is_preserved() {
        let f = fixture(profile(&["*"], &[]), AuditConfig::default()).await;
        let outcome = f
            .pipeline
            .invoke(
                &f.token,
                "10.0.0.1",
                InvokeRequest {
                    tool: "demo.echo".into(),
                    arguments: Value::Null,
                    environment: None,
                },
                |_, _, _| async move {
                    Ok(ToolCallResult {
                        content: vec![ToolCallContent {
                            content_type: "text".into(),
                            text: "file not found".into(),
                        }],
                        is_error: true,
                    })
                },
            )
            .await
            .unwrap();
        // The MCP-level tool error is a successful pipeline outcome.
        assert!(outcome.result.is_error);
        assert_eq!(outcome.result.content[0].text, "file not found");
    }

    #[tokio::test]
    async fn buffer_mode_full_ring_still_succeeds() {
        let audit_config = AuditConfig {
            ring_capacity: 1,
            spill_path: None,
            ..Default::default()
        };
        let f = fixture(profile(&["*"], &[]), audit_config).await;
        // Prime the ring so the next emission overflows.
        f.audit.add(AuditEvent::new(
            EventType::ToolInvocation,
            Severity::Info,
            "filler",
            "test",
        ));

        let outcome = f
            .pipeline
            .invoke(
                &f.token,
                "10.0.0.1",
                InvokeRequest {
                    tool: "demo.echo".into(),
                    arguments: Value::Null,
                    environment: None,
                },
                |_, _, _| async move { Ok(echo_result("ok")) },
            )
            .await;
        assert!(outcome.is_ok(), "buffer mode is failure-open");
        assert_eq!(f.audit.dropped_count(), 1);
    }

    #[tokio::test]
    async fn block_mode_full_ring_fails_the_request() {
        let audit_config = AuditConfig {
            ring_capacity: 1,
            spill_path: None,
            ..Default::default()
        };
        let f = fixture_with_mode(
            profile(&["*"], &[]),
            audit_config,
            AuditFailureMode::Block,
        )
        .await;
        f.audit.add(AuditEvent::new(
            EventType::ToolInvocation,
            Severity::Info,
            "filler",
            "test",
        ));

        let err = f
            .pipeline
            .invoke(
                &f.token,
                "10.0.0.1",
                InvokeRequest {
                    tool: "demo.echo".into(),
                    arguments: Value::Null,
                    environment: None,
                },
                |_, _, _| async move { Ok(echo_result("ok")) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuditBacklog));
    }
}
