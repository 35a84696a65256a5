use crate::config::DEFAULT_AGENT_MODE;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub session_id: String,
    pub client_cookie: String,
    pub client_uat: String,
    pub project_id: String,
    pub user_id: String,
    pub agent_mode: String,
    pub email: String,
    pub weight: i64,
    pub enabled: bool,
    pub request_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateAccountInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub client_cookie: String,
    #[serde(default)]
    pub client_uat: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_agent_mode")]
    pub agent_mode: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_weight")]
    pub weight: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAccountInput {
    pub name: Option<String>,
    pub session_id: Option<String>,
    pub client_cookie: Option<String>,
    pub client_uat: Option<String>,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub agent_mode: Option<String>,
    pub email: Option<String>,
    pub weight: Option<i64>,
    pub enabled: Option<bool>,
}

/// Portable account dump. Ids and usage counters are not carried over.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountExport {
    #[serde(default = "default_export_version")]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub export_at: DateTime<Utc>,
    pub accounts: Vec<CreateAccountInput>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub total: usize,
    pub imported: usize,
    pub skipped: usize,
}

fn default_agent_mode() -> String {
    DEFAULT_AGENT_MODE.to_string()
}

fn default_export_version() -> u32 {
    1
}

fn default_weight() -> i64 {
    1
}

fn default_enabled() -> bool {
    true
}

/// The slice of the account store that selection depends on.
#[async_trait]
pub trait AccountPool: Send + Sync {
    /// Accounts with `enabled = true`, ordered by id.
    async fn list_enabled(&self) -> Result<Vec<Account>, String>;
    /// Bumps `request_count` and stamps `last_used_at` in one step.
    async fn increment_usage(&self, id: i64) -> Result<(), String>;
}

#[derive(Clone)]
pub struct AccountStore {
    pool: Pool<Sqlite>,
}

impl AccountStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                session_id TEXT NOT NULL,
                client_cookie TEXT NOT NULL,
                client_uat TEXT NOT NULL,
                project_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                agent_mode TEXT NOT NULL DEFAULT 'claude-opus-4.5',
                email TEXT NOT NULL,
                weight INTEGER NOT NULL DEFAULT 1,
                enabled INTEGER NOT NULL DEFAULT 1,
                request_count INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_accounts_enabled ON accounts(enabled)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, String> {
        let rows = sqlx::query(&format!("{SELECT_ACCOUNT} ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_account).collect()
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>, String> {
        let row = sqlx::query(&format!("{SELECT_ACCOUNT} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.as_ref().map(row_to_account).transpose()
    }

    pub async fn create_account(&self, input: CreateAccountInput) -> Result<Account, String> {
        validate_create_input(&input)?;
        let now = Utc::now().to_rfc3339();
        let id = sqlx::query(
            r#"INSERT INTO accounts
               (name, session_id, client_cookie, client_uat, project_id, user_id, agent_mode, email, weight, enabled, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(input.name.trim())
        .bind(&input.session_id)
        .bind(&input.client_cookie)
        .bind(&input.client_uat)
        .bind(&input.project_id)
        .bind(&input.user_id)
        .bind(agent_mode_or_default(&input.agent_mode))
        .bind(&input.email)
        .bind(input.weight)
        .bind(input.enabled)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?
        .last_insert_rowid();

        self.get_account(id)
            .await?
            .ok_or_else(|| "account not found after create".to_string())
    }

    /// Applies a partial update. Empty identity strings keep the stored value.
    pub async fn update_account(
        &self,
        id: i64,
        input: UpdateAccountInput,
    ) -> Result<Option<Account>, String> {
        let Some(existing) = self.get_account(id).await? else {
            return Ok(None);
        };
        if let Some(weight) = input.weight {
            if weight < 0 {
                return Err("weight must be >= 0".to_string());
            }
        }

        let keep = |new: Option<String>, old: &str| -> String {
            new.filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| old.to_string())
        };
        let name = keep(input.name, &existing.name);
        let session_id = keep(input.session_id, &existing.session_id);
        let client_cookie = keep(input.client_cookie, &existing.client_cookie);
        let client_uat = keep(input.client_uat, &existing.client_uat);
        let project_id = keep(input.project_id, &existing.project_id);
        let user_id = keep(input.user_id, &existing.user_id);
        let agent_mode = keep(input.agent_mode, &existing.agent_mode);
        let email = keep(input.email, &existing.email);
        let weight = input.weight.unwrap_or(existing.weight);
        let enabled = input.enabled.unwrap_or(existing.enabled);

        sqlx::query(
            r#"UPDATE accounts
               SET name = ?, session_id = ?, client_cookie = ?, client_uat = ?, project_id = ?,
                   user_id = ?, agent_mode = ?, email = ?, weight = ?, enabled = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&name)
        .bind(&session_id)
        .bind(&client_cookie)
        .bind(&client_uat)
        .bind(&project_id)
        .bind(&user_id)
        .bind(&agent_mode)
        .bind(&email)
        .bind(weight)
        .bind(enabled)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        self.get_account(id).await
    }

    /// Returns false when no row matched.
    pub async fn delete_account(&self, id: i64) -> Result<bool, String> {
        let deleted = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?
            .rows_affected();
        Ok(deleted > 0)
    }

    pub async fn export_accounts(&self) -> Result<AccountExport, String> {
        let accounts = self
            .list_accounts()
            .await?
            .into_iter()
            .map(|acc| CreateAccountInput {
                name: acc.name,
                session_id: acc.session_id,
                client_cookie: acc.client_cookie,
                client_uat: acc.client_uat,
                project_id: acc.project_id,
                user_id: acc.user_id,
                agent_mode: acc.agent_mode,
                email: acc.email,
                weight: acc.weight,
                enabled: acc.enabled,
            })
            .collect();
        Ok(AccountExport {
            version: 1,
            export_at: Utc::now(),
            accounts,
        })
    }

    pub async fn import_accounts(&self, export: AccountExport) -> ImportResult {
        let mut result = ImportResult {
            total: export.accounts.len(),
            ..ImportResult::default()
        };
        for input in export.accounts {
            let name = input.name.clone();
            match self.create_account(input).await {
                Ok(_) => result.imported += 1,
                Err(err) => {
                    tracing::warn!(account = %name, "failed to import account: {err}");
                    result.skipped += 1;
                }
            }
        }
        result
    }
}

#[async_trait]
impl AccountPool for AccountStore {
    async fn list_enabled(&self) -> Result<Vec<Account>, String> {
        let rows = sqlx::query(&format!(
            "{SELECT_ACCOUNT} WHERE enabled = 1 ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_account).collect()
    }

    async fn increment_usage(&self, id: i64) -> Result<(), String> {
        sqlx::query(
            "UPDATE accounts SET request_count = request_count + 1, last_used_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Process-local pool, used where no database is wanted.
#[derive(Clone, Default)]
pub struct MemoryAccountPool {
    inner: Arc<RwLock<HashMap<i64, Account>>>,
}

impl MemoryAccountPool {
    pub fn new(accounts: Vec<Account>) -> Self {
        let map = accounts.into_iter().map(|acc| (acc.id, acc)).collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn get(&self, id: i64) -> Option<Account> {
        self.inner.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl AccountPool for MemoryAccountPool {
    async fn list_enabled(&self) -> Result<Vec<Account>, String> {
        let guard = self.inner.read().await;
        let mut out: Vec<Account> = guard.values().filter(|a| a.enabled).cloned().collect();
        out.sort_by_key(|a| a.id);
        Ok(out)
    }

    async fn increment_usage(&self, id: i64) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        let account = guard
            .get_mut(&id)
            .ok_or_else(|| format!("account {id} not found"))?;
        account.request_count += 1;
        account.last_used_at = Some(Utc::now());
        Ok(())
    }
}

const SELECT_ACCOUNT: &str = r#"SELECT id, name, session_id, client_cookie, client_uat, project_id, user_id,
    agent_mode, email, weight, enabled, request_count, last_used_at, created_at, updated_at
    FROM accounts"#;

fn agent_mode_or_default(mode: &str) -> &str {
    if mode.trim().is_empty() {
        DEFAULT_AGENT_MODE
    } else {
        mode
    }
}

fn validate_create_input(input: &CreateAccountInput) -> Result<(), String> {
    if input.name.trim().is_empty() {
        return Err("account name must not be empty".to_string());
    }
    if input.session_id.trim().is_empty() {
        return Err("session_id must not be empty".to_string());
    }
    if input.client_cookie.trim().is_empty() {
        return Err("client_cookie must not be empty".to_string());
    }
    if input.weight < 0 {
        return Err("weight must be >= 0".to_string());
    }
    Ok(())
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

fn row_to_account(row: &sqlx::sqlite::SqliteRow) -> Result<Account, String> {
    let last_used_at: Option<String> = row.try_get("last_used_at").map_err(|e| e.to_string())?;
    Ok(Account {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        session_id: row.try_get("session_id").map_err(|e| e.to_string())?,
        client_cookie: row.try_get("client_cookie").map_err(|e| e.to_string())?,
        client_uat: row.try_get("client_uat").map_err(|e| e.to_string())?,
        project_id: row.try_get("project_id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        agent_mode: row.try_get("agent_mode").map_err(|e| e.to_string())?,
        email: row.try_get("email").map_err(|e| e.to_string())?,
        weight: row.try_get("weight").map_err(|e| e.to_string())?,
        enabled: row.try_get("enabled").map_err(|e| e.to_string())?,
        request_count: row.try_get("request_count").map_err(|e| e.to_string())?,
        last_used_at: last_used_at.as_deref().map(parse_ts).transpose()?,
        created_at: parse_ts(
            &row.try_get::<String, _>("created_at")
                .map_err(|e| e.to_string())?,
        )?,
        updated_at: parse_ts(
            &row.try_get::<String, _>("updated_at")
                .map_err(|e| e.to_string())?,
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::{AccountPool, AccountStore, CreateAccountInput, UpdateAccountInput};

    async fn store() -> AccountStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect");
        AccountStore::new(pool).await.expect("store")
    }

    fn input(name: &str, weight: i64, enabled: bool) -> CreateAccountInput {
        CreateAccountInput {
            name: name.to_string(),
            session_id: format!("sess_{name}"),
            client_cookie: "cookie".to_string(),
            client_uat: "1".to_string(),
            project_id: "proj".to_string(),
            user_id: format!("user_{name}"),
            agent_mode: String::new(),
            email: format!("{name}@example.com"),
            weight,
            enabled,
        }
    }

    #[tokio::test]
    async fn list_enabled_skips_disabled_accounts() {
        let store = store().await;
        store.create_account(input("a", 1, true)).await.unwrap();
        store.create_account(input("b", 1, false)).await.unwrap();
        let enabled = store.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "a");
        assert_eq!(enabled[0].agent_mode, "claude-opus-4.5");
    }

    #[tokio::test]
    async fn increment_usage_bumps_counter_and_timestamp() {
        let store = store().await;
        let acc = store.create_account(input("a", 1, true)).await.unwrap();
        assert!(acc.last_used_at.is_none());
        store.increment_usage(acc.id).await.unwrap();
        store.increment_usage(acc.id).await.unwrap();
        let acc = store.get_account(acc.id).await.unwrap().unwrap();
        assert_eq!(acc.request_count, 2);
        assert!(acc.last_used_at.is_some());
    }

    #[tokio::test]
    async fn update_keeps_identity_fields_when_blank() {
        let store = store().await;
        let acc = store.create_account(input("a", 1, true)).await.unwrap();
        let updated = store
            .update_account(
                acc.id,
                UpdateAccountInput {
                    session_id: Some(String::new()),
                    weight: Some(5),
                    enabled: Some(false),
                    ..UpdateAccountInput::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.session_id, "sess_a");
        assert_eq!(updated.weight, 5);
        assert!(!updated.enabled);
    }

    #[tokio::test]
    async fn negative_weight_is_rejected() {
        let store = store().await;
        assert!(store.create_account(input("a", -1, true)).await.is_err());
    }

    #[tokio::test]
    async fn export_then_import_creates_fresh_rows() {
        let store = store().await;
        let acc = store.create_account(input("a", 2, true)).await.unwrap();
        store.increment_usage(acc.id).await.unwrap();
        let export = store.export_accounts().await.unwrap();
        assert_eq!(export.version, 1);

        let result = store.import_accounts(export).await;
        assert_eq!(result.total, 1);
        assert_eq!(result.imported, 1);
        let all = store.list_accounts().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].request_count, 0);
        assert_eq!(all[1].weight, 2);
    }

    #[tokio::test]
    async fn delete_reports_missing_rows() {
        let store = store().await;
        let acc = store.create_account(input("a", 1, true)).await.unwrap();
        assert!(store.delete_account(acc.id).await.unwrap());
        assert!(!store.delete_account(acc.id).await.unwrap());
    }
}
