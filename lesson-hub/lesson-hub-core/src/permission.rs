//! Permission evaluation: required-role directives checked against a
//! principal's roles and view preferences.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::preferences::{flag_is, load_preferences, AttributeStore, Preferences};
use crate::principal::Principal;
use crate::roles::{resolve_roles, RoleSet};

static DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*@@@(.*)").expect("directive regex is valid"));

/// Required roles, lowercased and trimmed, empty tokens dropped. Tokens
/// starting with `#` are view pseudo-roles.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PermissionSpec(Vec<String>);

impl PermissionSpec {
    pub fn public() -> Self {
        Self::default()
    }

    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            tokens
                .into_iter()
                .map(|t| t.as_ref().trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        )
    }

    /// Parses `@@@role1,role2` (leading whitespace allowed). Returns `None`
    /// when the line is not a directive.
    pub fn parse_directive(line: &str) -> Option<Self> {
        let caps = DIRECTIVE.captures(line)?;
        Some(Self::from_tokens(caps[1].split(',')))
    }

    pub fn is_public(&self) -> bool {
        self.0.is_empty()
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchMode {
    All,
    Any,
}

/// Roles and preferences resolved once for a request.
#[derive(Clone, Debug)]
pub struct AccessContext {
    pub roles: RoleSet,
    /// `None` when the stored preference blob is unreadable.
    pub preferences: Option<Preferences>,
}

impl AccessContext {
    pub fn new(roles: RoleSet, preferences: Option<Preferences>) -> Self {
        Self { roles, preferences }
    }

    pub fn permits(&self, spec: &PermissionSpec, mode: MatchMode, allow_override: bool) -> bool {
        if spec.is_public() {
            return true;
        }
        let Some(prefs) = self.preferences.as_ref() else {
            return false;
        };

        let (views, plain): (Vec<&str>, Vec<&str>) = spec
            .tokens()
            .iter()
            .map(String::as_str)
            .partition(|t| t.starts_with('#'));

        let mut roles = self.roles.clone();
        let mut is_admin = roles.contains("admin") || plain.contains(&"admin");
        let mut is_teacher = roles.contains("teacher") || plain.contains(&"teacher");
        if is_teacher {
            roles.insert("teachers");
        }
        if (is_admin || is_teacher) && allow_override && flag_is(prefs.vt, 0.0) {
            is_admin = false;
            is_teacher = false;
            roles.remove("teacher");
        }

        let mut decision = if is_admin {
            Some(true)
        } else if plain.is_empty() {
            None
        } else {
            Some(match mode {
                MatchMode::All => plain.iter().all(|r| roles.contains(r)),
                MatchMode::Any => plain.iter().any(|r| roles.contains(r)),
            })
        };

        // The last recognized view token decides.
        if decision != Some(false) {
            for view in views {
                match &view[1..] {
                    "exam" => decision = Some(flag_is(prefs.ve, 1.0) && (is_admin || is_teacher)),
                    "practice" => decision = Some(flag_is(prefs.ve, 0.0)),
                    "answer" => decision = Some(flag_is(prefs.va, 1.0)),
                    _ => {}
                }
            }
        }
        decision.unwrap_or(false)
    }
}

/// Which UI toggles the page chrome should offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Affordances {
    pub teacher_toggle: bool,
    pub exam_toggle: bool,
}

#[derive(Clone)]
pub struct Evaluator {
    store: Arc<dyn AttributeStore>,
    client_id: String,
}

impl Evaluator {
    pub fn new(store: Arc<dyn AttributeStore>, client_id: impl Into<String>) -> Self {
        Self {
            store,
            client_id: client_id.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn AttributeStore> {
        &self.store
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// One attribute fetch; reuse the result for every check in a request.
    pub async fn access_context(&self, principal: &Principal) -> AccessContext {
        let roles = resolve_roles(principal, &self.client_id);
        let preferences = load_preferences(self.store.as_ref(), principal).await;
        AccessContext::new(roles, preferences)
    }

    pub async fn evaluate(
        &self,
        principal: &Principal,
        spec: &PermissionSpec,
        mode: MatchMode,
        allow_override: bool,
    ) -> bool {
        if spec.is_public() {
            return true;
        }
        let ctx = self.access_context(principal).await;
        if ctx.preferences.is_none() {
            warn!(user = %principal.subject, ?spec, "denying: preferences unreadable");
            return false;
        }
        ctx.permits(spec, mode, allow_override)
    }

    pub async fn has_all_roles(&self, principal: &Principal, spec: &PermissionSpec, allow_override: bool) -> bool {
        self.evaluate(principal, spec, MatchMode::All, allow_override).await
    }

    pub async fn has_some_roles(&self, principal: &Principal, spec: &PermissionSpec, allow_override: bool) -> bool {
        self.evaluate(principal, spec, MatchMode::Any, allow_override).await
    }

    pub async fn affordances(&self, principal: &Principal) -> Affordances {
        let ctx = self.access_context(principal).await;
        let teacher = PermissionSpec::from_tokens(["teacher"]);
        Affordances {
            teacher_toggle: ctx.permits(&teacher, MatchMode::Any, false),
            exam_toggle: ctx.permits(&teacher, MatchMode::Any, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::{MemoryAttributeStore, CONFIG_ATTRIBUTE};
    use crate::principal::test_tokens;
    use serde_json::json;

    fn spec(tokens: &[&str]) -> PermissionSpec {
        PermissionSpec::from_tokens(tokens)
    }

    fn ctx(roles: &[&str], prefs: &str) -> AccessContext {
        AccessContext::new(
            roles.iter().copied().collect(),
            Some(Preferences::from_json(prefs).unwrap()),
        )
    }

    #[test]
    fn parses_directives() {
        assert_eq!(
            PermissionSpec::parse_directive("  @@@ Teacher, ,#Exam"),
            Some(spec(&["teacher", "#exam"]))
        );
        assert_eq!(PermissionSpec::parse_directive("@@@"), Some(PermissionSpec::public()));
        assert_eq!(PermissionSpec::parse_directive("# Title"), None);
        assert_eq!(PermissionSpec::parse_directive("text @@@teacher"), None);
    }

    #[test]
    fn empty_spec_always_allows() {
        let ctx = AccessContext::new(RoleSet::new(), None);
        assert!(ctx.permits(&PermissionSpec::public(), MatchMode::All, true));
    }

    #[test]
    fn admin_short_circuits_plain_roles() {
        let admin = ctx(&["admin", "root"], r#"{"vt":1}"#);
        assert!(admin.permits(&spec(&["gluppy", "nobody"]), MatchMode::All, true));
        assert!(admin.permits(&spec(&["gluppy"]), MatchMode::Any, false));
    }

    #[test]
    fn teacher_downgrade_only_with_override_and_vt_zero() {
        let forced_student = ctx(&["teacher", "jane"], r#"{"vt":0}"#);
        assert!(!forced_student.permits(&spec(&["teacher"]), MatchMode::Any, true));
        assert!(forced_student.permits(&spec(&["teacher"]), MatchMode::Any, false));

        let teacher_view = ctx(&["teacher", "jane"], r#"{"vt":1}"#);
        assert!(teacher_view.permits(&spec(&["teacher"]), MatchMode::Any, true));

        // Without a stored vt the downgrade does not apply.
        let unset = ctx(&["teacher"], r#"{}"#);
        assert!(unset.permits(&spec(&["teacher"]), MatchMode::Any, true));
    }

    #[test]
    fn downgrade_keeps_plural_group() {
        let forced_student = ctx(&["teacher"], r#"{"vt":0}"#);
        assert!(forced_student.permits(&spec(&["teachers"]), MatchMode::Any, true));
    }

    #[test]
    fn all_versus_any() {
        let student = ctx(&["student", "jane"], r#"{"vt":1}"#);
        assert!(student.permits(&spec(&["student", "other"]), MatchMode::Any, false));
        assert!(!student.permits(&spec(&["student", "other"]), MatchMode::All, false));
        assert!(student.permits(&spec(&["student", "jane"]), MatchMode::All, false));
    }

    #[test]
    fn exam_token_is_reserved_for_staff() {
        let exam_on = r#"{"ve":1,"vt":1}"#;
        assert!(!ctx(&["student"], exam_on).permits(&spec(&["#exam"]), MatchMode::Any, true));
        assert!(ctx(&["teacher"], exam_on).permits(&spec(&["#exam"]), MatchMode::Any, true));
        assert!(ctx(&["admin"], exam_on).permits(&spec(&["#exam"]), MatchMode::Any, true));

        let exam_off = r#"{"ve":0,"vt":1}"#;
        assert!(!ctx(&["teacher"], exam_off).permits(&spec(&["#exam"]), MatchMode::Any, true));
        assert!(ctx(&["student"], exam_off).permits(&spec(&["#practice"]), MatchMode::Any, true));
        assert!(!ctx(&["student"], exam_on).permits(&spec(&["#practice"]), MatchMode::Any, true));
    }

    #[test]
    fn view_tokens_cannot_rescue_a_denied_plain_check() {
        let student = ctx(&["student"], r#"{"ve":0,"va":1}"#);
        assert!(!student.permits(&spec(&["teacher", "#answer"]), MatchMode::Any, true));
        assert!(student.permits(&spec(&["student", "#answer"]), MatchMode::Any, true));
    }

    #[test]
    fn last_view_token_wins() {
        let student = ctx(&["student"], r#"{"ve":0,"va":0}"#);
        assert!(!student.permits(&spec(&["#practice", "#answer"]), MatchMode::Any, true));
        assert!(student.permits(&spec(&["#answer", "#practice"]), MatchMode::Any, true));
    }

    #[test]
    fn unknown_view_tokens_leave_decision_unset() {
        let student = ctx(&["student"], r#"{}"#);
        assert!(!student.permits(&spec(&["#bogus"]), MatchMode::Any, true));
        assert!(student.permits(&spec(&["student", "#bogus"]), MatchMode::Any, true));
    }

    #[test]
    fn unreadable_preferences_deny() {
        let ctx = AccessContext::new(["admin"].into_iter().collect(), None);
        assert!(!ctx.permits(&spec(&["admin"]), MatchMode::Any, false));
    }

    fn principal(claims: serde_json::Value) -> Principal {
        Principal::from_access_token(test_tokens::mint(claims), None).unwrap()
    }

    #[tokio::test]
    async fn evaluator_reads_store_once_per_call() {
        let store = Arc::new(MemoryAttributeStore::new());
        let evaluator = Evaluator::new(store.clone(), "lessons");
        let teacher = principal(json!({"sub": "t", "name": "Tom", "ldap": "OU=Teachers"}));

        // No config stored: missing-config defaults force the student view.
        assert!(!evaluator.has_some_roles(&teacher, &spec(&["teacher"]), true).await);
        assert!(evaluator.has_some_roles(&teacher, &spec(&["teacher"]), false).await);

        store.insert("tom", CONFIG_ATTRIBUTE, r#"{"vt":1}"#);
        assert!(evaluator.has_some_roles(&teacher, &spec(&["teacher"]), true).await);

        store.set_failing(true);
        assert!(!evaluator.has_some_roles(&teacher, &spec(&["teacher"]), true).await);
        assert!(evaluator.has_all_roles(&teacher, &PermissionSpec::public(), true).await);
    }

    #[tokio::test]
    async fn client_roles_come_from_configured_client() {
        let store = Arc::new(MemoryAttributeStore::new());
        let evaluator = Evaluator::new(store, "lessons");
        let editor = principal(json!({
            "sub": "e", "name": "Eve",
            "resource_access": {"lessons": {"roles": ["Editor"]}, "other": {"roles": ["admin"]}}
        }));
        assert!(evaluator.has_some_roles(&editor, &spec(&["editor"]), true).await);
        assert!(!evaluator.has_some_roles(&editor, &spec(&["ops"]), true).await);
        assert!(evaluator.has_some_roles(&editor, &spec(&["eve"]), true).await);
    }

    #[tokio::test]
    async fn affordances_follow_override_rules() {
        let store = Arc::new(MemoryAttributeStore::new());
        let evaluator = Evaluator::new(store.clone(), "lessons");
        let teacher = principal(json!({"sub": "t", "name": "Tom", "ldap": "OU=Teachers"}));
        store.insert("tom", CONFIG_ATTRIBUTE, r#"{"vt":0}"#);
        assert_eq!(
            evaluator.affordances(&teacher).await,
            Affordances { teacher_toggle: true, exam_toggle: false }
        );

        let student = principal(json!({"sub": "s", "name": "Sue", "ldap": "OU=Students"}));
        assert_eq!(
            evaluator.affordances(&student).await,
            Affordances { teacher_toggle: false, exam_toggle: false }
        );
    }
}
