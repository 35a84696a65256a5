use crate::accounts::Account;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CLERK_BASE_URL: &str = "https://clerk.orchids.app";
pub const DEFAULT_AGENT_URL: &str =
    "https://orchids-server.calmstone-6964e08a.westeurope.azurecontainerapps.io/agent/coding-agent";
pub const DEFAULT_AGENT_MODE: &str = "claude-opus-4.5";
pub const CLERK_QUERY: &str = "__clerk_api_version=2025-11-10&_clerk_js_version=5.117.0";

/// Where the identity provider and the agent endpoint live.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamEndpoints {
    pub clerk_base_url: String,
    pub agent_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for UpstreamEndpoints {
    fn default() -> Self {
        Self {
            clerk_base_url: DEFAULT_CLERK_BASE_URL.to_string(),
            agent_url: DEFAULT_AGENT_URL.to_string(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl UpstreamEndpoints {
    pub fn token_url(&self, session_id: &str) -> String {
        format!(
            "{}/v1/client/sessions/{}/tokens?{}",
            self.clerk_base_url.trim_end_matches('/'),
            session_id,
            CLERK_QUERY
        )
    }

    pub fn client_url(&self) -> String {
        format!(
            "{}/v1/client?{}",
            self.clerk_base_url.trim_end_matches('/'),
            CLERK_QUERY
        )
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Credentials and identity fields one adapter sends upstream.
#[derive(Clone, Deserialize, Serialize)]
pub struct SessionCredentials {
    pub session_id: String,
    pub client_cookie: String,
    pub client_uat: String,
    pub project_id: String,
    pub user_id: String,
    pub agent_mode: String,
    pub email: String,
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("session_id", &self.session_id)
            .field("project_id", &self.project_id)
            .field("user_id", &self.user_id)
            .field("agent_mode", &self.agent_mode)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

impl SessionCredentials {
    pub fn from_account(account: &Account) -> Self {
        Self {
            session_id: account.session_id.clone(),
            client_cookie: account.client_cookie.clone(),
            client_uat: account.client_uat.clone(),
            project_id: account.project_id.clone(),
            user_id: account.user_id.clone(),
            agent_mode: account.agent_mode.clone(),
            email: account.email.clone(),
        }
    }

    /// Static credentials for the single-adapter mode. Requires both
    /// `SESSION_ID` and `CLIENT_COOKIE`.
    pub fn from_env() -> Option<Self> {
        let session_id = env_non_empty("SESSION_ID")?;
        let client_cookie = env_non_empty("CLIENT_COOKIE")?;
        Some(Self {
            session_id,
            client_cookie,
            client_uat: env_non_empty("CLIENT_UAT").unwrap_or_default(),
            project_id: env_non_empty("PROJECT_ID").unwrap_or_default(),
            user_id: env_non_empty("USER_ID").unwrap_or_default(),
            agent_mode: env_non_empty("AGENT_MODE")
                .unwrap_or_else(|| DEFAULT_AGENT_MODE.to_string()),
            email: env_non_empty("EMAIL").unwrap_or_default(),
        })
    }

    pub fn cookie_header(&self) -> String {
        format!(
            "__client={}; __client_uat={}",
            self.client_cookie, self.client_uat
        )
    }
}

#[derive(Clone)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl AdminCredentials {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            username: env_non_empty("ADMIN_USER")?,
            password: env_non_empty("ADMIN_PASS")?,
        })
    }
}

pub(crate) fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
