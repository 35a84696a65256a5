use crate::accounts::Account;
use crate::config::{SessionCredentials, UpstreamEndpoints};
use crate::error::GatewayError;
use crate::sse::{UpstreamEvent, decode_block};
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CHAT_SESSION_ID_RANGE: std::ops::Range<u64> = 10_000_000..100_000_000;

/// Upstream adapter bound to one set of credentials.
///
/// A fresh adapter is built for every attempt; it never mutates account state.
#[derive(Clone)]
pub struct OrchidsClient {
    http: reqwest::Client,
    endpoints: Arc<UpstreamEndpoints>,
    credentials: SessionCredentials,
    account: Option<(i64, String)>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    jwt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentRequest<'a> {
    prompt: &'a str,
    chat_history: Vec<serde_json::Value>,
    project_id: &'a str,
    current_page: serde_json::Value,
    agent_mode: &'a str,
    mode: &'static str,
    git_repo_url: &'static str,
    email: &'a str,
    chat_session_id: u64,
    user_id: &'a str,
    api_version: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    model: &'a str,
}

impl OrchidsClient {
    pub fn new(
        http: reqwest::Client,
        endpoints: Arc<UpstreamEndpoints>,
        credentials: SessionCredentials,
    ) -> Self {
        Self {
            http,
            endpoints,
            credentials,
            account: None,
        }
    }

    pub fn for_account(
        http: reqwest::Client,
        endpoints: Arc<UpstreamEndpoints>,
        account: &Account,
    ) -> Self {
        Self {
            account: Some((account.id, account.name.clone())),
            ..Self::new(http, endpoints, SessionCredentials::from_account(account))
        }
    }

    /// Pool account id, `None` for the statically configured adapter.
    pub fn account_id(&self) -> Option<i64> {
        self.account.as_ref().map(|(id, _)| *id)
    }

    pub fn label(&self) -> &str {
        self.account
            .as_ref()
            .map(|(_, name)| name.as_str())
            .unwrap_or("static")
    }

    /// Exchanges the session credentials for a short-lived bearer token.
    pub async fn authenticate(&self) -> Result<String, GatewayError> {
        let resp = self
            .http
            .post(self.endpoints.token_url(&self.credentials.session_id))
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .header(reqwest::header::COOKIE, self.credentials.cookie_header())
            .body("organization_id=")
            .timeout(Duration::from_millis(self.endpoints.timeout_ms))
            .send()
            .await
            .map_err(|err| GatewayError::AuthFailed(err.to_string()))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::AuthFailed(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|err| GatewayError::AuthFailed(format!("invalid token payload: {err}")))?;
        if token.jwt.trim().is_empty() {
            return Err(GatewayError::AuthFailed(
                "token payload has no jwt".to_string(),
            ));
        }
        Ok(token.jwt)
    }

    /// Issues the streaming agent request. Only a 200 response is returned.
    pub async fn open_stream(
        &self,
        token: &str,
        prompt: &str,
        model: &str,
    ) -> Result<reqwest::Response, GatewayError> {
        let payload = AgentRequest {
            prompt,
            chat_history: Vec::new(),
            project_id: &self.credentials.project_id,
            current_page: serde_json::json!({}),
            agent_mode: &self.credentials.agent_mode,
            mode: "agent",
            git_repo_url: "",
            email: &self.credentials.email,
            chat_session_id: rand::thread_rng().gen_range(CHAT_SESSION_ID_RANGE),
            user_id: &self.credentials.user_id,
            api_version: 2,
            model,
        };

        let resp = self
            .http
            .post(&self.endpoints.agent_url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header("X-Orchids-Api-Version", "2")
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    /// Authenticates and opens the stream. Every failure here happens before
    /// any output has been produced.
    pub async fn connect(
        &self,
        prompt: &str,
        model: &str,
    ) -> Result<reqwest::Response, GatewayError> {
        let token = self.authenticate().await?;
        self.open_stream(&token, prompt, model).await
    }

    /// Forwards decoded events from an open response to `tx`.
    ///
    /// Each read races the cancellation token. When the body ends without a
    /// finish frame a synthetic `end_turn` finish is sent, so a successful
    /// return always follows exactly one `Finish`.
    pub async fn read_events(
        &self,
        resp: reqwest::Response,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<UpstreamEvent>,
    ) -> Result<(), GatewayError> {
        let mut stream = resp.bytes_stream().eventsource();
        let mut saw_finish = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                next = stream.next() => next,
            };
            let Some(next) = next else { break };
            let ev = match next {
                Ok(ev) => ev,
                Err(EventStreamError::Transport(err)) => {
                    return Err(GatewayError::Transport(err.to_string()));
                }
                Err(err) => {
                    tracing::trace!(
                        target: "orchids_gateway::upstream_sse",
                        "skipping undecodable block: {err}"
                    );
                    continue;
                }
            };

            for event in decode_block(&ev.data) {
                if saw_finish {
                    break;
                }
                saw_finish = event.is_finish();
                forward(event, cancel, tx).await?;
            }
            if saw_finish {
                return Ok(());
            }
        }

        tracing::debug!(
            account = %self.label(),
            "upstream closed without finish frame, synthesizing end_turn"
        );
        forward(UpstreamEvent::end_turn(), cancel, tx).await
    }

    /// Full exchange: token, agent request, event loop.
    pub async fn stream(
        &self,
        prompt: &str,
        model: &str,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<UpstreamEvent>,
    ) -> Result<(), GatewayError> {
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            resp = self.connect(prompt, model) => resp?,
        };
        self.read_events(resp, cancel, tx).await
    }
}

/// A full channel must not outlive cancellation, so the send races it too.
async fn forward(
    event: UpstreamEvent,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<UpstreamEvent>,
) -> Result<(), GatewayError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        sent = tx.send(event) => sent.map_err(|_| GatewayError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::OrchidsClient;
    use crate::config::{SessionCredentials, UpstreamEndpoints};
    use crate::error::GatewayError;
    use crate::sse::UpstreamEvent;
    use axum::Router;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{MethodRouter, post};
    use futures_util::StreamExt;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    const DELTAS_ONLY: &str = concat!(
        "data: {\"type\":\"model\",\"event\":{\"type\":\"text-delta\",\"delta\":\"a\"}}\n\n",
        "data: {\"type\":\"model\",\"event\":{\"type\":\"text-delta\",\"delta\":\"b\"}}\n\n",
    );

    const WITH_FINISH: &str = concat!(
        "data: {\"type\":\"model\",\"event\":{\"type\":\"text-delta\",\"delta\":\"a\"}}\n\n",
        "data: {\"type\":\"model\",\"event\":{\"type\":\"finish\"}}\n\n",
        "data: {\"type\":\"model\",\"event\":{\"type\":\"text-delta\",\"delta\":\"late\"}}\n\n",
    );

    async fn spawn_upstream(body: &'static str) -> UpstreamEndpoints {
        spawn_agent(post(move || async move { body })).await
    }

    async fn spawn_agent(agent: MethodRouter) -> UpstreamEndpoints {
        let app = Router::new()
            .route(
                "/v1/client/sessions/{sid}/tokens",
                post(|Path(sid): Path<String>| async move {
                    if sid == "sess_bad" {
                        (StatusCode::INTERNAL_SERVER_ERROR, "nope".to_string())
                    } else {
                        (StatusCode::OK, r#"{"jwt":"token"}"#.to_string())
                    }
                }),
            )
            .route("/agent", agent);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        UpstreamEndpoints {
            clerk_base_url: format!("http://{addr}"),
            agent_url: format!("http://{addr}/agent"),
            timeout_ms: 5_000,
        }
    }

    fn client(endpoints: UpstreamEndpoints, session_id: &str) -> OrchidsClient {
        OrchidsClient::new(
            reqwest::Client::new(),
            Arc::new(endpoints),
            SessionCredentials {
                session_id: session_id.to_string(),
                client_cookie: "cookie".to_string(),
                client_uat: "0".to_string(),
                project_id: "proj".to_string(),
                user_id: "user".to_string(),
                agent_mode: "claude-opus-4.5".to_string(),
                email: "a@example.com".to_string(),
            },
        )
    }

    async fn collect(client: &OrchidsClient) -> Vec<UpstreamEvent> {
        let (tx, mut rx) = mpsc::channel(16);
        client
            .stream("hi", "", &CancellationToken::new(), &tx)
            .await
            .unwrap();
        drop(tx);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn eof_without_finish_synthesizes_exactly_one() {
        let c = client(spawn_upstream(DELTAS_ONLY).await, "sess_1");
        let events = collect(&c).await;
        assert_eq!(
            events,
            vec![
                UpstreamEvent::TextDelta("a".to_string()),
                UpstreamEvent::TextDelta("b".to_string()),
                UpstreamEvent::end_turn(),
            ]
        );
    }

    #[tokio::test]
    async fn upstream_finish_is_not_duplicated() {
        let c = client(spawn_upstream(WITH_FINISH).await, "sess_1");
        let events = collect(&c).await;
        assert_eq!(events.iter().filter(|e| e.is_finish()).count(), 1);
        assert_eq!(events.last(), Some(&UpstreamEvent::end_turn()));
    }

    #[tokio::test]
    async fn token_failure_is_auth_failed() {
        let c = client(spawn_upstream(DELTAS_ONLY).await, "sess_bad");
        assert!(matches!(
            c.authenticate().await,
            Err(GatewayError::AuthFailed(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_any_event() {
        let c = client(spawn_upstream(DELTAS_ONLY).await, "sess_1");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, mut rx) = mpsc::channel(16);
        let result = c.stream("hi", "", &cancel, &tx).await;
        assert!(matches!(result, Err(GatewayError::Cancelled)));
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancel_interrupts_a_blocked_read() {
        let hanging = post(|| async {
            let first = futures_util::stream::once(async {
                Ok::<_, Infallible>(
                    "data: {\"type\":\"model\",\"event\":{\"type\":\"text-delta\",\"delta\":\"a\"}}\n\n"
                        .to_string(),
                )
            });
            axum::body::Body::from_stream(first.chain(futures_util::stream::pending()))
        });
        let c = client(spawn_agent(hanging).await, "sess_1");
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let task = {
            let c = c.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { c.stream("hi", "", &cancel, &tx).await })
        };

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("first delta");
        assert_eq!(first, Some(UpstreamEvent::TextDelta("a".to_string())));

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("read was not interrupted")
            .unwrap();
        assert!(matches!(result, Err(GatewayError::Cancelled)));
        assert!(rx.recv().await.is_none());
    }
}
