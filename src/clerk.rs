use crate::config::UpstreamEndpoints;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_PROJECT_ID: &str = "280b7bae-cd29-41e4-a0a6-7f603c43b607";

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Session identity resolved from a raw `__client` browser cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub session_id: String,
    pub client_uat: String,
    pub project_id: String,
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
struct ClientEnvelope {
    response: ClientBody,
}

#[derive(Debug, Deserialize)]
struct ClientBody {
    #[serde(default)]
    last_active_session_id: Option<String>,
    #[serde(default)]
    sessions: Vec<ClientSession>,
}

#[derive(Debug, Deserialize)]
struct ClientSession {
    id: String,
    user: ClientUser,
}

#[derive(Debug, Deserialize)]
struct ClientUser {
    id: String,
    #[serde(default)]
    email_addresses: Vec<EmailAddress>,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    email_address: String,
}

pub async fn fetch_account_info(
    http: &reqwest::Client,
    endpoints: &UpstreamEndpoints,
    client_cookie: &str,
) -> Result<AccountInfo, String> {
    let resp = http
        .get(endpoints.client_url())
        .header(reqwest::header::COOKIE, format!("__client={client_cookie}"))
        .timeout(BOOTSTRAP_TIMEOUT)
        .send()
        .await
        .map_err(|err| format!("failed to fetch client info: {err}"))?;

    let status = resp.status();
    if status != reqwest::StatusCode::OK {
        let body = resp.text().await.unwrap_or_default();
        return Err(format!("unexpected status code {}: {body}", status.as_u16()));
    }
    let envelope: ClientEnvelope = resp
        .json()
        .await
        .map_err(|err| format!("failed to decode client info: {err}"))?;

    account_info_from_body(envelope.response)
}

fn account_info_from_body(body: ClientBody) -> Result<AccountInfo, String> {
    let session = body
        .sessions
        .first()
        .ok_or_else(|| "no active sessions found".to_string())?;
    let email = session
        .user
        .email_addresses
        .first()
        .ok_or_else(|| "no email address found".to_string())?;

    Ok(AccountInfo {
        session_id: body
            .last_active_session_id
            .clone()
            .filter(|sid| !sid.is_empty())
            .unwrap_or_else(|| session.id.clone()),
        client_uat: chrono::Utc::now().timestamp().to_string(),
        project_id: DEFAULT_PROJECT_ID.to_string(),
        user_id: session.user.id.clone(),
        email: email.email_address.clone(),
    })
}
