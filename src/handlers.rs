use crate::app::AppState;
use crate::client::OrchidsClient;
use crate::error::{AppError, AppResult, GatewayError};
use crate::models::{model_list, resolve_agent_model};
use crate::prompt::build_prompt;
use crate::sse::UpstreamEvent;
use crate::tokens::estimate_tokens;
use crate::translate::{
    ChatCompletionRequest, ChunkWriter, StreamSession, collect_text, convert_messages,
    pump_events,
};
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn list_models() -> Response {
    Json(json!({ "object": "list", "data": model_list() })).into_response()
}

pub(crate) fn parse_body<T: DeserializeOwned>(
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<T> {
    let Json(body) =
        payload.map_err(|err| AppError::bad_request("invalid_request", err.body_text()))?;
    serde_json::from_value(body).map_err(|err| AppError::bad_request("invalid_request", err.to_string()))
}

/// Adapter for the next attempt: a pool account not in `failed`, else the
/// statically configured adapter.
async fn acquire_client(
    state: &AppState,
    failed: &HashSet<i64>,
) -> Result<OrchidsClient, GatewayError> {
    match state.balancer.pick(failed).await {
        Ok(account) => {
            tracing::info!(
                account_id = account.id,
                account_name = %account.name,
                email = %account.email,
                "using account"
            );
            Ok(OrchidsClient::for_account(
                state.http.clone(),
                state.endpoints.clone(),
                &account,
            ))
        }
        Err(err) => match &state.static_client {
            Some(client) => {
                tracing::debug!("account pool unavailable ({err}), using static credentials");
                Ok(client.clone())
            }
            None => Err(err),
        },
    }
}

fn record_failure(client: &OrchidsClient, err: &GatewayError) {
    metrics::counter!("orchids_upstream_failures_total", "kind" => err.kind()).increment(1);
    tracing::warn!(
        account = %client.label(),
        kind = err.kind(),
        "upstream call failed: {err}"
    );
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<Response> {
    let req: ChatCompletionRequest = parse_body(payload)?;
    if req.messages.is_empty() {
        return Err(
            AppError::bad_request("invalid_request", "messages must not be empty")
                .with_param("messages"),
        );
    }
    metrics::counter!(
        "orchids_requests_total",
        "endpoint" => "chat_completions",
        "stream" => if req.stream { "true" } else { "false" }
    )
    .increment(1);

    let (turns, system) = convert_messages(&req.messages);
    let prompt = build_prompt(&req.model, &turns, &system);
    let agent_model = resolve_agent_model(&req.model);
    tracing::debug!(
        model = %req.model,
        agent_model = %agent_model,
        max_tokens = ?req.max_tokens,
        temperature = ?req.temperature,
        "model mapping"
    );

    let session = Arc::new(StreamSession::new(
        req.model.clone(),
        estimate_tokens(&prompt),
    ));

    let client = acquire_client(&state, &HashSet::new()).await?;
    let resp = client
        .connect(&prompt, &agent_model)
        .await
        .inspect_err(|err| record_failure(&client, err))?;

    if req.stream {
        Ok(stream_chat(client, resp, session))
    } else {
        complete_chat(client, resp, session).await
    }
}

async fn complete_chat(
    client: OrchidsClient,
    resp: reqwest::Response,
    session: Arc<StreamSession>,
) -> AppResult<Response> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let (event_tx, mut event_rx) = mpsc::channel::<UpstreamEvent>(64);

    let producer = {
        let client = client.clone();
        async move { client.read_events(resp, &cancel, &event_tx).await }
    };
    let (result, content) = tokio::join!(producer, collect_text(&mut event_rx));
    if let Err(err) = result {
        record_failure(&client, &err);
        return Err(err.into());
    }

    let body = session.completion(&content);
    tracing::info!(
        account = %client.label(),
        prompt_tokens = session.prompt_tokens,
        completion_tokens = body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        elapsed_ms = session.started_at.elapsed().as_millis() as u64,
        "chat completion finished"
    );
    Ok(Json(body).into_response())
}

fn stream_chat(
    client: OrchidsClient,
    resp: reqwest::Response,
    session: Arc<StreamSession>,
) -> Response {
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<Event>(64);
    let writer = ChunkWriter::new(tx);

    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        writer.write(&session.role_chunk()).await;

        let (event_tx, mut event_rx) = mpsc::channel::<UpstreamEvent>(64);
        let producer = {
            let client = client.clone();
            async move { client.read_events(resp, &task_cancel, &event_tx).await }
        };
        let (result, ()) = tokio::join!(producer, pump_events(&session, &writer, &mut event_rx));

        match result {
            Ok(()) => {
                writer.finish(&session).await;
            }
            Err(GatewayError::Cancelled) => {
                tracing::debug!(account = %client.label(), "client went away mid-stream");
            }
            Err(err) => {
                record_failure(&client, &err);
                writer.fail(&session, &AppError::from(err)).await;
            }
        }
        tracing::info!(
            account = %client.label(),
            prompt_tokens = session.prompt_tokens,
            completion_tokens = session.completion_tokens(),
            elapsed_ms = session.started_at.elapsed().as_millis() as u64,
            "chat stream finished"
        );
    });

    // Dropping the response body cancels the upstream read.
    let guard = cancel.drop_guard();
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(move |event| {
        let _ = &guard;
        Ok::<_, std::convert::Infallible>(event)
    });
    Sse::new(stream).into_response()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaGenerationRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    fn endpoint(self) -> &'static str {
        match self {
            Self::Image => "images_generations",
            Self::Video => "videos_generations",
        }
    }

    fn instruction(self, prompt: &str, size: &str) -> String {
        let noun = match self {
            Self::Image => "an image",
            Self::Video => "a short video",
        };
        format!(
            "Generate {noun} at resolution {size} for the following description and upload it. \
             Reply with only the public URL of the generated file.\n\nDescription: {prompt}"
        )
    }
}

pub async fn create_image_generation(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<Response> {
    create_media(state, MediaKind::Image, payload).await
}

pub async fn create_video_generation(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<Response> {
    create_media(state, MediaKind::Video, payload).await
}

async fn create_media(
    state: AppState,
    kind: MediaKind,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<Response> {
    let req: MediaGenerationRequest = parse_body(payload)?;
    if req.prompt.trim().is_empty() {
        return Err(
            AppError::bad_request("invalid_request", "prompt is required").with_param("prompt"),
        );
    }
    metrics::counter!("orchids_requests_total", "endpoint" => kind.endpoint(), "stream" => "false")
        .increment(1);

    let size = req
        .size
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "1024x1024".to_string());
    let instruction = kind.instruction(req.prompt.trim(), &size);

    let url = generate_with_failover(&state, kind, &instruction).await?;
    tracing::info!(endpoint = kind.endpoint(), url = %url, "media generated");
    Ok(Json(json!({
        "created": chrono::Utc::now().timestamp(),
        "data": [{ "url": url }]
    }))
    .into_response())
}

/// One attempt, then at most one retry on a different pool account.
async fn generate_with_failover(
    state: &AppState,
    kind: MediaKind,
    instruction: &str,
) -> Result<String, GatewayError> {
    let mut failed = HashSet::new();
    let client = acquire_client(state, &failed).await?;
    let err = match generate_once(&client, instruction).await {
        Ok(url) => return Ok(url),
        Err(err) => err,
    };
    record_failure(&client, &err);

    let Some(failed_id) = client.account_id() else {
        return Err(err);
    };
    failed.insert(failed_id);
    let Ok(retry) = acquire_client(state, &failed).await else {
        return Err(err);
    };
    metrics::counter!("orchids_failover_retries_total", "endpoint" => kind.endpoint())
        .increment(1);
    tracing::info!(
        failed_account = failed_id,
        retry_account = %retry.label(),
        "retrying generation on another account"
    );
    generate_once(&retry, instruction)
        .await
        .inspect_err(|err| record_failure(&retry, err))
}

async fn generate_once(client: &OrchidsClient, instruction: &str) -> Result<String, GatewayError> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let (event_tx, mut event_rx) = mpsc::channel::<UpstreamEvent>(64);

    let producer = async move { client.stream(instruction, "", &cancel, &event_tx).await };
    let (result, text) = tokio::join!(producer, collect_text(&mut event_rx));
    result?;
    extract_media_url(&text).ok_or(GatewayError::NoMediaUrl)
}

static MEDIA_URL: OnceLock<Option<Regex>> = OnceLock::new();

/// First http(s) URL in the reply, with trailing punctuation removed.
fn extract_media_url(text: &str) -> Option<String> {
    let re = MEDIA_URL
        .get_or_init(|| Regex::new(r#"https?://[^\s"'<>()\[\]`]+"#).ok())
        .as_ref()?;
    let found = re.find(text)?.as_str();
    let trimmed = found.trim_end_matches(['.', ',', ';', ':', '!', '?']);
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
