use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::HeaderMap;
use mgate_storage::AuthRows;
use time::OffsetDateTime;

use crate::error::RelayError;

/// Resolved identity of one request, carried through the pipeline.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub token_id: i64,
    pub user_id: i64,
    pub shared_quota: bool,
    pub unlimited_quota: bool,
    pub groups: HashSet<String>,
    pub allowed_models: Option<HashSet<String>>,
}

impl AuthContext {
    pub fn may_use_model(&self, model: &str) -> bool {
        match &self.allowed_models {
            Some(allowed) => allowed.contains(model),
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
struct TokenEntry {
    id: i64,
    user_id: i64,
    shared_quota: bool,
    unlimited_quota: bool,
    groups: HashSet<String>,
    allowed_models: Option<HashSet<String>>,
    expires_at: Option<OffsetDateTime>,
    enabled: bool,
}

#[derive(Debug, Clone)]
struct UserEntry {
    group: String,
    enabled: bool,
}

#[derive(Debug, Default)]
pub struct AuthSnapshot {
    tokens_by_secret: HashMap<String, TokenEntry>,
    users_by_id: HashMap<i64, UserEntry>,
}

impl AuthSnapshot {
    pub fn from_rows(rows: &AuthRows) -> Self {
        let mut tokens_by_secret = HashMap::with_capacity(rows.tokens.len());
        for token in &rows.tokens {
            let allowed_models = token.allowed_models.as_ref().and_then(|value| {
                value.as_array().map(|models| {
                    models
                        .iter()
                        .filter_map(|model| model.as_str().map(|m| m.to_string()))
                        .collect::<HashSet<_>>()
                })
            });
            tokens_by_secret.insert(
                token.secret.clone(),
                TokenEntry {
                    id: token.id,
                    user_id: token.user_id,
                    shared_quota: token.shared_quota,
                    unlimited_quota: token.unlimited_quota,
                    groups: token
                        .token_groups
                        .split(',')
                        .map(|group| group.trim().to_string())
                        .filter(|group| !group.is_empty())
                        .collect(),
                    allowed_models,
                    expires_at: token.expires_at,
                    enabled: token.enabled,
                },
            );
        }
        let users_by_id = rows
            .users
            .iter()
            .map(|user| {
                (
                    user.id,
                    UserEntry {
                        group: user.user_group.clone(),
                        enabled: user.enabled,
                    },
                )
            })
            .collect();
        Self {
            tokens_by_secret,
            users_by_id,
        }
    }
}

/// Read-mostly token authenticator; writers publish whole snapshots.
#[derive(Debug)]
pub struct TokenAuth {
    snapshot: ArcSwap<AuthSnapshot>,
}

impl TokenAuth {
    pub fn new(snapshot: AuthSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn replace_snapshot(&self, snapshot: AuthSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    /// A request may proceed only when the token is enabled, unexpired, and
    /// owned by an enabled user. Quota is checked later by the pre-charge,
    /// not here.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, RelayError> {
        let secret = extract_secret(headers)
            .ok_or_else(|| RelayError::unauthorized("missing api key"))?;

        let snapshot = self.snapshot.load();
        let token = snapshot
            .tokens_by_secret
            .get(secret.as_str())
            .ok_or_else(|| RelayError::unauthorized("invalid api key"))?;

        if !token.enabled {
            return Err(RelayError::unauthorized("api key disabled"));
        }
        if let Some(expires_at) = token.expires_at
            && expires_at <= OffsetDateTime::now_utc()
        {
            return Err(RelayError::unauthorized("api key expired"));
        }

        let user = snapshot
            .users_by_id
            .get(&token.user_id)
            .ok_or_else(|| RelayError::unauthorized("user not found"))?;
        if !user.enabled {
            return Err(RelayError::unauthorized("user disabled"));
        }

        // The user's group always participates; token groups narrow within it.
        let mut groups = token.groups.clone();
        groups.insert(user.group.clone());

        Ok(AuthContext {
            token_id: token.id,
            user_id: token.user_id,
            shared_quota: token.shared_quota,
            unlimited_quota: token.unlimited_quota,
            groups,
            allowed_models: token.allowed_models.clone(),
        })
    }
}

/// Accepts `Authorization: Bearer sk-…` everywhere, plus the native header
/// conventions of the Anthropic (`x-api-key`) and Gemini (`x-goog-api-key`)
/// dialect endpoints.
fn extract_secret(headers: &HeaderMap) -> Option<String> {
    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = header_value(headers, name) {
            return Some(strip_prefix(&value));
        }
    }
    let auth = header_value(headers, "authorization")?;
    let auth = auth.trim();
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    Some(strip_prefix(token.trim()))
}

fn strip_prefix(secret: &str) -> String {
    secret.strip_prefix("sk-").unwrap_or(secret).to_string()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}
