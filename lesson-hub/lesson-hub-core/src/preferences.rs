//! Per-user preference blob kept in the identity provider's attribute store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{AttributeStoreError, PreferenceError};
use crate::principal::Principal;

/// Attribute under which the preference blob is stored.
pub const CONFIG_ATTRIBUTE: &str = "config";
pub const LAST_VISITED_ATTRIBUTE: &str = "lastVisitedUrl";

/// Recognized preference fields. Values compare loosely: numbers, numeric
/// strings and booleans are all read as numbers. Fields that are absent in
/// the stored blob stay `None`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Preferences {
    /// Dark mode.
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub dm: Option<f64>,
    /// Start from the last visited page.
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub sl: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub fs: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub t: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub nt: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub s: Option<f64>,
    /// View as teacher; `0` forces the student view.
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub vt: Option<f64>,
    /// View answers.
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub va: Option<f64>,
    /// Exam mode.
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub ve: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if b { 1.0 } else { 0.0 }),
        Value::String(s) if s.trim().is_empty() => Some(0.0),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Loose equality against an optional preference value.
pub fn flag_is(value: Option<f64>, expected: f64) -> bool {
    value == Some(expected)
}

impl Preferences {
    pub fn from_json(raw: &str) -> Result<Self, PreferenceError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Defaults used when a user has never stored preferences or the store
    /// could not be reached: student view, no answers, no exam mode.
    pub fn missing_config() -> Self {
        Self {
            vt: Some(0.0),
            va: Some(0.0),
            ve: Some(0.0),
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> Result<String, PreferenceError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns a copy with one field replaced, recognized or not.
    pub fn with_value(&self, key: &str, value: Value) -> Result<Self, PreferenceError> {
        let mut map = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        map.insert(key.to_string(), value);
        Ok(serde_json::from_value(Value::Object(map))?)
    }
}

/// What the attribute store knows about a user. Attribute values arrive as
/// arrays and only their first element is kept.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct UserAttributes {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub profile: serde_json::Map<String, Value>,
}

impl UserAttributes {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

#[async_trait]
pub trait AttributeStore: Send + Sync {
    async fn attributes(&self, principal: &Principal) -> Result<UserAttributes, AttributeStoreError>;

    /// Writes one attribute, keeping every other attribute as it was.
    async fn set_attribute(
        &self,
        principal: &Principal,
        key: &str,
        value: &str,
    ) -> Result<(), AttributeStoreError>;
}

/// Preferences for permission checks.
///
/// `None` means a `config` attribute exists but cannot be read; callers
/// must deny every non-empty permission check in that case. A blank
/// attribute counts as missing.
pub async fn load_preferences(store: &dyn AttributeStore, principal: &Principal) -> Option<Preferences> {
    match store.attributes(principal).await {
        Ok(attributes) => match attributes.get(CONFIG_ATTRIBUTE).filter(|raw| !raw.trim().is_empty()) {
            None => Some(Preferences::missing_config()),
            Some(raw) => match Preferences::from_json(raw) {
                Ok(prefs) => Some(prefs),
                Err(e) => {
                    warn!(user = %principal.subject, error = %e, "stored preferences are unreadable");
                    None
                }
            },
        },
        Err(e) => {
            warn!(user = %principal.subject, error = %e, "failed to fetch user attributes");
            Some(Preferences::missing_config())
        }
    }
}

/// Read-modify-write of a single preference field. Concurrent writers for
/// the same user can lose updates; the last write wins.
pub async fn set_preference(
    store: &dyn AttributeStore,
    principal: &Principal,
    key: &str,
    value: Value,
) -> bool {
    let current = match store.attributes(principal).await {
        Ok(attributes) => match attributes.get(CONFIG_ATTRIBUTE).filter(|raw| !raw.trim().is_empty()) {
            Some(raw) => match Preferences::from_json(raw) {
                Ok(prefs) => prefs,
                Err(e) => {
                    warn!(user = %principal.subject, error = %e, "refusing to overwrite unreadable preferences");
                    return false;
                }
            },
            None => Preferences::default(),
        },
        Err(e) => {
            warn!(user = %principal.subject, error = %e, "failed to fetch user attributes");
            return false;
        }
    };
    match current.with_value(key, value) {
        Ok(updated) => set_config(store, principal, &updated).await,
        Err(e) => {
            warn!(user = %principal.subject, key, error = %e, "preference value rejected");
            false
        }
    }
}

pub async fn set_config(store: &dyn AttributeStore, principal: &Principal, prefs: &Preferences) -> bool {
    let raw = match prefs.to_json() {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "failed to serialize preferences");
            return false;
        }
    };
    match store.set_attribute(principal, CONFIG_ATTRIBUTE, &raw).await {
        Ok(()) => true,
        Err(e) => {
            warn!(user = %principal.subject, error = %e, "failed to store preferences");
            false
        }
    }
}

/// In-process attribute store keyed by normalized principal name.
#[derive(Default)]
pub struct MemoryAttributeStore {
    users: Mutex<HashMap<String, UserAttributes>>,
    failing: AtomicBool,
}

impl MemoryAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: &str, key: &str, value: &str) {
        self.users
            .lock()
            .entry(user.trim().to_lowercase())
            .or_default()
            .attributes
            .insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, user: &str, key: &str) -> Option<String> {
        self.users
            .lock()
            .get(&user.trim().to_lowercase())
            .and_then(|attrs| attrs.attributes.get(key).cloned())
    }

    /// Every call fails while set, as if the store were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), AttributeStoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AttributeStoreError::Unavailable("memory store is in failing mode".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AttributeStore for MemoryAttributeStore {
    async fn attributes(&self, principal: &Principal) -> Result<UserAttributes, AttributeStoreError> {
        self.check()?;
        let mut attrs = self
            .users
            .lock()
            .get(&principal.normalized_name())
            .cloned()
            .unwrap_or_default();
        attrs
            .profile
            .insert("username".into(), Value::String(principal.name.clone()));
        Ok(attrs)
    }

    async fn set_attribute(
        &self,
        principal: &Principal,
        key: &str,
        value: &str,
    ) -> Result<(), AttributeStoreError> {
        self.check()?;
        self.insert(&principal.normalized_name(), key, value);
        Ok(())
    }
}
