use crate::accounts::{AccountExport, CreateAccountInput, UpdateAccountInput};
use crate::app::AppState;
use crate::clerk::fetch_account_info;
use crate::error::{AppError, AppResult};
use crate::handlers::parse_body;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

fn extract_basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let encoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// The admin surface does not exist unless credentials are configured.
fn require_admin(headers: &HeaderMap, state: &AppState) -> AppResult<()> {
    let Some(admin) = &state.runtime.admin else {
        return Err(AppError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            "admin api is disabled",
        ));
    };
    match extract_basic_credentials(headers) {
        Some((user, pass)) if user == admin.username && pass == admin.password => Ok(()),
        _ => Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid admin credentials",
        )),
    }
}

fn store_error(err: String) -> AppError {
    AppError::internal("internal_error", err)
}

fn account_not_found() -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", "account not found")
}

pub async fn list_accounts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &state)?;
    let accounts = state
        .account_store
        .list_accounts()
        .await
        .map_err(store_error)?;
    Ok(Json(accounts))
}

pub async fn create_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &state)?;
    let mut input: CreateAccountInput = parse_body(payload)?;

    // A bare browser cookie is enough; the rest is resolved from the identity provider.
    if input.session_id.trim().is_empty() && !input.client_cookie.trim().is_empty() {
        let info = fetch_account_info(&state.http, &state.endpoints, input.client_cookie.trim())
            .await
            .map_err(|err| {
                AppError::bad_request("account_bootstrap_failed", err).with_param("client_cookie")
            })?;
        input.session_id = info.session_id;
        input.client_uat = info.client_uat;
        input.user_id = info.user_id;
        input.email = info.email;
        if input.project_id.trim().is_empty() {
            input.project_id = info.project_id;
        }
        if input.name.trim().is_empty() {
            input.name = input.email.clone();
        }
    }

    let account = state
        .account_store
        .create_account(input)
        .await
        .map_err(|err| AppError::bad_request("invalid_account", err))?;
    tracing::info!(account_id = account.id, account_name = %account.name, "account created");
    Ok((StatusCode::CREATED, Json(account)))
}

pub async fn get_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &state)?;
    let account = state
        .account_store
        .get_account(id)
        .await
        .map_err(store_error)?
        .ok_or_else(account_not_found)?;
    Ok(Json(account))
}

pub async fn update_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &state)?;
    let input: UpdateAccountInput = parse_body(payload)?;
    let account = state
        .account_store
        .update_account(id, input)
        .await
        .map_err(|err| AppError::bad_request("invalid_account", err))?
        .ok_or_else(account_not_found)?;
    Ok(Json(account))
}

pub async fn delete_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &state)?;
    let deleted = state
        .account_store
        .delete_account(id)
        .await
        .map_err(store_error)?;
    if !deleted {
        return Err(account_not_found());
    }
    tracing::info!(account_id = id, "account deleted");
    Ok(Json(json!({ "success": true })))
}

pub async fn export_accounts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &state)?;
    let export = state
        .account_store
        .export_accounts()
        .await
        .map_err(store_error)?;
    Ok((
        [(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=accounts_export.json"),
        )],
        Json(export),
    ))
}

pub async fn import_accounts(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &state)?;
    let export: AccountExport = parse_body(payload)?;
    let result = state.account_store.import_accounts(export).await;
    tracing::info!(
        total = result.total,
        imported = result.imported,
        skipped = result.skipped,
        "accounts imported"
    );
    Ok(Json(result))
}
