//! Per-call authorization decisions.

use chrono::{DateTime, Utc};

use crate::profile::EffectiveProfile;

/// The outcome of an authorization check. `policy` names the rule that
/// decided, for the audit record; it is never surfaced to clients.
#[derive(Debug, Clone)]
pub struct Decision {
    pub permit: bool,
    pub reason: String,
    pub policy: Option<String>,
}

impl Decision {
    fn deny(reason: impl Into<String>, policy: Option<String>) -> Self {
        Self {
            permit: false,
            reason: reason.into(),
            policy,
        }
    }

    fn permit(policy: Option<String>) -> Self {
        Self {
            permit: true,
            reason: "allowed by profile".into(),
            policy,
        }
    }
}

/// Decide whether `tool_name` may be invoked under `profile`.
///
/// Order: deny globs win over allow globs, no match is a deny
/// (default-deny), and a permitted call is still gated by environment scope
/// and UTC time windows.
pub fn authorize(
    profile: &EffectiveProfile,
    tool_name: &str,
    environment: Option<&str>,
    now: DateTime<Utc>,
) -> Decision {
    if let Some(rule) = profile.denied.matched_pattern(tool_name) {
        return Decision::deny(
            format!("tool denied by profile {}", profile.name),
            Some(rule.to_owned()),
        );
    }

    let allow_rule = match profile.allowed.matched_pattern(tool_name) {
        Some(rule) => rule.to_owned(),
        None => {
            return Decision::deny(
                format!("tool not allowed by profile {}", profile.name),
                None,
            )
        }
    };

    if !profile.environment_scope.is_empty() {
        let in_scope = environment
            .map(|env| profile.environment_scope.iter().any(|s| s == env))
            .unwrap_or(false);
        if !in_scope {
            return Decision::deny(
                format!("environment out of scope for profile {}", profile.name),
                Some(allow_rule),
            );
        }
    }

    if !profile.time_restrictions.is_empty()
        && !profile.time_restrictions.iter().any(|w| w.contains(now))
    {
        return Decision::deny(
            format!("outside access window for profile {}", profile.name),
            Some(allow_rule),
        );
    }

    Decision::permit(Some(allow_rule))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glob::ToolGlobSet;
    use amb_domain::entity::{RateLimits, TimeWindow};
    use chrono::NaiveTime;
    use uuid::Uuid;

    fn effective(allowed: &[&str], denied: &[&str]) -> EffectiveProfile {
        EffectiveProfile {
            profile_id: Uuid::new_v4(),
            name: "test".into(),
            allowed: ToolGlobSet::compile(
                &allowed.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            )
            .unwrap(),
            denied: ToolGlobSet::compile(
                &denied.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            )
            .unwrap(),
            rate_limits: RateLimits::default(),
            environment_scope: Vec::new(),
            time_restrictions: Vec::new(),
        }
    }

    #[test]
    fn deny_wins_over_allow() {
        let profile = effective(&["*"], &["*.write_*"]);
        let decision = authorize(&profile, "fs.write_file", None, Utc::now());
        assert!(!decision.permit);
        assert_eq!(decision.policy.as_deref(), Some("*.write_*"));
    }

    #[test]
    fn default_deny_when_nothing_matches() {
        let profile = effective(&["fs.*"], &[]);
        let decision = authorize(&profile, "db.query", None, Utc::now());
        assert!(!decision.permit);
        assert!(decision.policy.is_none());
    }

    #[test]
    fn allow_match_permits() {
        let profile = effective(&["*"], &[]);
        let decision = authorize(&profile, "demo.echo", None, Utc::now());
        assert!(decision.permit);
        assert_eq!(decision.policy.as_deref(), Some("*"));
    }

    #[test]
    fn environment_scope_gates_permit() {
        let mut profile = effective(&["*"], &[]);
        profile.environment_scope = vec!["production".into()];

        assert!(!authorize(&profile, "demo.echo", None, Utc::now()).permit);
        assert!(!authorize(&profile, "demo.echo", Some("staging"), Utc::now()).permit);
        assert!(authorize(&profile, "demo.echo", Some("production"), Utc::now()).permit);
    }

    #[test]
    fn time_window_gates_permit() {
        let mut profile = effective(&["*"], &[]);
        profile.time_restrictions = vec![TimeWindow {
            days: vec![],
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        }];

        let noon = Utc::now()
            .date_naive()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc();
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 30, 0)
            .unwrap()
            .and_utc();
        assert!(authorize(&profile, "demo.echo", None, noon).permit);
        assert!(!authorize(&profile, "demo.echo", None, midnight).permit);
    }
}
