//! Keycloak-backed attribute store and session refresher.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AttributeStoreError, RefreshError};
use crate::preferences::{AttributeStore, UserAttributes};
use crate::principal::{Principal, SessionRefresher, UserInfo};

/// Account fields the account endpoint refuses to accept back on write.
const READ_ONLY_ACCOUNT_FIELDS: &[&str] = &["userProfileMetadata", "id", "username", "emailVerified"];

/// Adapter configuration as found in `keycloak.json`.
#[derive(Deserialize, Clone, Debug)]
pub struct KeycloakConfig {
    #[serde(rename = "auth-server-url")]
    pub auth_server_url: String,
    pub realm: String,
    /// Client id; also the key for client roles in `resource_access`.
    pub resource: String,
    #[serde(default)]
    pub credentials: Credentials,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct Credentials {
    #[serde(default)]
    pub secret: Option<String>,
}

impl KeycloakConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn issuer(&self) -> String {
        format!("{}/realms/{}", self.auth_server_url.trim_end_matches('/'), self.realm)
    }

    pub fn account_url(&self) -> String {
        format!("{}/account", self.issuer())
    }

    pub fn token_url(&self) -> String {
        format!("{}/protocol/openid-connect/token", self.issuer())
    }

    pub fn userinfo_url(&self) -> String {
        format!("{}/protocol/openid-connect/userinfo", self.issuer())
    }
}

#[derive(Clone)]
pub struct KeycloakClient {
    config: KeycloakConfig,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl KeycloakClient {
    pub fn new(config: KeycloakConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &KeycloakConfig {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        &self.config.resource
    }

    async fn fetch_account(&self, principal: &Principal) -> Result<Value, AttributeStoreError> {
        let response = self
            .http
            .get(self.config.account_url())
            .bearer_auth(&principal.tokens.access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AttributeStoreError::Rejected(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }
}

/// Splits an account representation into attributes (first array element
/// of each value) and the remaining profile fields.
pub fn flatten_account(account: Value) -> Result<UserAttributes, AttributeStoreError> {
    let Value::Object(mut profile) = account else {
        return Err(AttributeStoreError::Payload("account is not an object".into()));
    };
    let mut attributes = std::collections::BTreeMap::new();
    if let Some(Value::Object(raw)) = profile.remove("attributes") {
        for (key, value) in raw {
            let first = match value {
                Value::Array(items) => items.into_iter().next(),
                other => Some(other),
            };
            match first {
                Some(Value::String(s)) => {
                    attributes.insert(key, s);
                }
                Some(Value::Null) | None => {}
                Some(other) => {
                    attributes.insert(key, other.to_string());
                }
            }
        }
    }
    Ok(UserAttributes { attributes, profile })
}

/// Merges one attribute into a fetched account and drops the fields the
/// endpoint rejects on write.
pub fn prepare_account_update(account: Value, key: &str, value: &str) -> Result<Value, AttributeStoreError> {
    let Value::Object(mut account) = account else {
        return Err(AttributeStoreError::Payload("account is not an object".into()));
    };
    for field in READ_ONLY_ACCOUNT_FIELDS {
        account.remove(*field);
    }
    let attributes = account
        .entry("attributes")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    match attributes {
        Value::Object(map) => {
            map.insert(key.to_string(), Value::Array(vec![Value::String(value.to_string())]));
        }
        _ => return Err(AttributeStoreError::Payload("account attributes are not an object".into())),
    }
    Ok(Value::Object(account))
}

#[async_trait]
impl AttributeStore for KeycloakClient {
    async fn attributes(&self, principal: &Principal) -> Result<UserAttributes, AttributeStoreError> {
        flatten_account(self.fetch_account(principal).await?)
    }

    async fn set_attribute(
        &self,
        principal: &Principal,
        key: &str,
        value: &str,
    ) -> Result<(), AttributeStoreError> {
        let account = prepare_account_update(self.fetch_account(principal).await?, key, value)?;
        let response = self
            .http
            .post(self.config.account_url())
            .bearer_auth(&principal.tokens.access_token)
            .json(&account)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AttributeStoreError::Rejected(response.status().as_u16()));
        }
        debug!(user = %principal.subject, key, "stored user attribute");
        Ok(())
    }
}

#[async_trait]
impl SessionRefresher for KeycloakClient {
    async fn refresh(&self, principal: &Principal) -> Result<Principal, RefreshError> {
        let refresh_token = principal
            .tokens
            .refresh_token
            .as_deref()
            .ok_or(RefreshError::NoRefreshToken)?;
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("client_id", self.config.resource.as_str()),
            ("refresh_token", refresh_token),
        ];
        if let Some(secret) = self.config.credentials.secret.as_deref() {
            form.push(("client_secret", secret));
        }
        let response = self.http.post(self.config.token_url()).form(&form).send().await?;
        if !response.status().is_success() {
            return Err(RefreshError::Rejected(response.status().as_u16()));
        }
        let tokens: TokenResponse = response.json().await?;
        let mut refreshed = Principal::from_access_token(
            tokens.access_token,
            tokens.refresh_token.or_else(|| principal.tokens.refresh_token.clone()),
        )?;

        let info = self
            .http
            .get(self.config.userinfo_url())
            .bearer_auth(&refreshed.tokens.access_token)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match info {
            Ok(response) => match response.json::<UserInfo>().await {
                Ok(info) => refreshed.merge_user_info(info),
                Err(e) => warn!(error = %e, "unreadable user info after refresh"),
            },
            Err(e) => warn!(error = %e, "user info request failed after refresh"),
        }
        Ok(refreshed)
    }
}
