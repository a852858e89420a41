//! Console sessions and the identities behind them
//!
//! Authenticating users is someone else's job: by the time a request reaches
//! the forwarder it carries a bearer token that a [`SessionResolver`] maps to
//! a [`Session`]. The user's groups come from a [`UserInfoProvider`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An authenticated console session
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session identifier
    pub id: String,
    /// Name of the user that owns the session
    pub user: String,
    /// When the session stops being valid
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Create a session
    pub fn new(id: impl Into<String>, user: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            user: user.into(),
            expires_at,
        }
    }
}

/// Cache key for per-session pipelines
///
/// Distinct for every (cluster, user, session) triple, so colliding session
/// ids from different users or clusters never share an entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Target cluster
    pub cluster: String,
    /// Session owner
    pub user: String,
    /// Session identifier
    pub session_id: String,
}

impl SessionKey {
    /// Key for `session` talking to `cluster`
    pub fn new(session: &Session, cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            user: session.user.clone(),
            session_id: session.id.clone(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.user, self.session_id)
    }
}

/// Identity and authorization groups of a user
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserInfo {
    /// User name
    pub identity: String,
    /// Authorization groups
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Looks up who a session belongs to
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserInfoProvider: Send + Sync {
    /// User info for the session owner; `Ok(None)` when the user is unknown
    async fn current_user_info(&self, session: &Session) -> Result<Option<UserInfo>>;
}

/// Maps bearer tokens to sessions
#[cfg_attr(test, mockall::automock)]
pub trait SessionResolver: Send + Sync {
    /// Session for a bearer token, if any
    fn resolve(&self, token: &str) -> Option<Session>;
}

/// A configured session with the groups of its user
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticSession {
    /// Bearer token presented by the console
    pub token: String,
    /// Session details
    #[serde(flatten)]
    pub session: Session,
    /// Authorization groups of the session user
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Fixed set of sessions loaded from configuration
#[derive(Debug, Default)]
pub struct StaticSessions {
    by_token: HashMap<String, Session>,
    users: HashMap<String, UserInfo>,
}

impl StaticSessions {
    /// Index the given sessions by token and user
    pub fn new(sessions: impl IntoIterator<Item = StaticSession>) -> Self {
        let mut by_token = HashMap::new();
        let mut users = HashMap::new();
        for entry in sessions {
            users.insert(
                entry.session.user.clone(),
                UserInfo {
                    identity: entry.session.user.clone(),
                    groups: entry.groups,
                },
            );
            by_token.insert(entry.token, entry.session);
        }
        Self { by_token, users }
    }

    /// Number of known sessions
    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    /// Check if no session is configured
    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

impl SessionResolver for StaticSessions {
    fn resolve(&self, token: &str) -> Option<Session> {
        self.by_token.get(token).cloned()
    }
}

#[async_trait]
impl UserInfoProvider for StaticSessions {
    async fn current_user_info(&self, session: &Session) -> Result<Option<UserInfo>> {
        Ok(self.users.get(&session.user).cloned())
    }
}
