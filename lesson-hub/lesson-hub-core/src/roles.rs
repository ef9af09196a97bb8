//! Effective role set for a principal: directory groups, client roles and
//! the principal's own name.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::principal::Principal;

static OU_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)OU=[^,]*").expect("OU regex is valid"));

/// Lowercase role tokens attributed to one principal for one evaluation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleSet(BTreeSet<String>);

impl RoleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, role: &str) -> bool {
        self.0.contains(role)
    }

    pub fn insert(&mut self, role: impl Into<String>) -> bool {
        self.0.insert(role.into())
    }

    pub fn remove(&mut self, role: &str) -> bool {
        self.0.remove(role)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for RoleSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Organizational units named in a directory-group string, with the
/// plural group names folded onto their singular role.
pub fn directory_groups(ldap: &str) -> Vec<String> {
    OU_SEGMENT
        .find_iter(ldap)
        .filter_map(|m| m.as_str().split_once('='))
        .map(|(_, value)| value.trim().to_lowercase())
        .map(|group| match group.as_str() {
            "teachers" => "teacher".to_string(),
            "students" => "student".to_string(),
            _ => group,
        })
        .collect()
}

/// Roles granted to `client_id` in the token's `resource_access` claim.
/// Anything that is not an array of strings is ignored.
pub fn client_roles(resource_access: Option<&Value>, client_id: &str) -> Vec<String> {
    resource_access
        .and_then(|access| access.get(client_id))
        .and_then(|client| client.get("roles"))
        .and_then(Value::as_array)
        .map(|roles| {
            roles
                .iter()
                .filter_map(Value::as_str)
                .map(|role| role.trim().to_lowercase())
                .filter(|role| !role.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub fn resolve_roles(principal: &Principal, client_id: &str) -> RoleSet {
    let mut roles = RoleSet::new();
    if let Some(ldap) = principal.ldap.as_deref() {
        for group in directory_groups(ldap) {
            roles.insert(group);
        }
    }
    for role in client_roles(principal.claims.resource_access.as_ref(), client_id) {
        roles.insert(role);
    }
    roles.insert(principal.normalized_name());
    roles
}
