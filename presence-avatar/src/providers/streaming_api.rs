//! REST + realtime websocket implementation of the streaming provider surface

use crate::config::AvatarStreamConfig;
use crate::error::AvatarError;
use crate::providers::{
    AvatarProvider, ProviderEvent, ProviderSession, SessionHandle, SessionRequest, SpeakRequest,
    StreamHandle,
};
use crate::token::AccessToken;
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

const MAX_ERROR_TEXT_SIZE: usize = 10_000;
const MAX_RESPONSE_SIZE: usize = 100 * 1024;
const EVENT_CHANNEL_SIZE: usize = 64;
const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Streaming provider speaking the `v1/streaming.*` REST API
pub struct StreamingApiProvider {
    client: Arc<Client>,
    base_url: String,
}

impl StreamingApiProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AvatarError> {
        if Url::parse(base_url).is_err() {
            return Err(AvatarError::Config("Invalid provider base URL".to_string()));
        }

        let client = Arc::new(
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| AvatarError::Config(format!("Failed to create HTTP client: {}", e)))?,
        );

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &AvatarStreamConfig) -> Result<Self, AvatarError> {
        Self::new(&config.api_base_url, config.request_timeout())
    }
}

/// POST `payload` to `{base}/v1/{method}` and return the parsed body
async fn call(
    client: &Client,
    base_url: &str,
    token: &AccessToken,
    method: &str,
    payload: &Value,
) -> Result<Value, String> {
    let url = format!("{}/v1/{}", base_url, method);

    let response = client
        .post(&url)
        .bearer_auth(token.as_str())
        .json(payload)
        .send()
        .await
        .map_err(|e| format!("{} request failed: {}", method, e))?;

    let status = response.status();

    if !status.is_success() {
        let error_text = match read_body(response, MAX_ERROR_TEXT_SIZE).await {
            Ok((body, _)) => String::from_utf8_lossy(&body).into_owned(),
            Err(e) => format!("<unreadable body: {}>", e),
        };
        return Err(format!("{} returned {} - {}", method, status, error_text));
    }

    let too_large = || format!("{} response too large (max {} bytes)", method, MAX_RESPONSE_SIZE);
    if response
        .content_length()
        .map_or(false, |len| len > MAX_RESPONSE_SIZE as u64)
    {
        return Err(too_large());
    }

    let (bytes, truncated) = read_body(response, MAX_RESPONSE_SIZE)
        .await
        .map_err(|e| format!("Failed to read {} response: {}", method, e))?;
    if truncated {
        return Err(too_large());
    }

    if bytes.is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_slice(&bytes).map_err(|e| format!("Failed to parse {} response: {}", method, e))
}

/// Read at most `limit` bytes of the body; the flag is set when more followed
async fn read_body(mut response: Response, limit: usize) -> Result<(Vec<u8>, bool), reqwest::Error> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = limit - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            return Ok((body, true));
        }
        body.extend_from_slice(&chunk);
    }
    Ok((body, false))
}

fn required_str(data: &Value, field: &str) -> Result<String, AvatarError> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AvatarError::SessionCreationFailed(format!("Missing {} in response", field)))
}

fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 256
        && id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

/// Map one realtime text frame to a provider event
pub(crate) fn parse_realtime_message(text: &str) -> Option<ProviderEvent> {
    let message: Value = serde_json::from_str(text).ok()?;
    let kind = message.get("type").and_then(Value::as_str)?;
    match kind {
        "avatar_start_talking" => Some(ProviderEvent::StartedTalking),
        "avatar_stop_talking" => Some(ProviderEvent::StoppedTalking),
        "stream_disconnected" => Some(ProviderEvent::Disconnected),
        "error" => {
            let detail = message
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown provider error");
            Some(ProviderEvent::Error(detail.to_string()))
        }
        _ => None,
    }
}

#[async_trait]
impl AvatarProvider for StreamingApiProvider {
    async fn create_session(
        &self,
        token: &AccessToken,
        request: &SessionRequest,
    ) -> Result<ProviderSession, AvatarError> {
        info!("Creating streaming session for avatar {}", request.avatar_id);

        let mut payload = json!({
            "quality": request.quality.as_str(),
            "avatar_name": request.avatar_id,
            "version": "v2",
            "video_encoding": "H264",
        });
        if let Some(ref voice_id) = request.voice_id {
            payload["voice"] = json!({ "voice_id": voice_id });
        }

        let created = call(&self.client, &self.base_url, token, "streaming.new", &payload)
            .await
            .map_err(AvatarError::SessionCreationFailed)?;

        let data = created
            .get("data")
            .ok_or_else(|| AvatarError::SessionCreationFailed("Missing data in response".to_string()))?;

        let session_id = required_str(data, "session_id")?;
        if !valid_session_id(&session_id) {
            return Err(AvatarError::SessionCreationFailed("Invalid session_id from API".to_string()));
        }
        let media_url = required_str(data, "url")?;
        let media_token = required_str(data, "access_token")?;
        let realtime_endpoint = data
            .get("realtime_endpoint")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        call(
            &self.client,
            &self.base_url,
            token,
            "streaming.start",
            &json!({ "session_id": session_id }),
        )
        .await
        .map_err(AvatarError::SessionCreationFailed)?;

        let (sender, events) = mpsc::channel(EVENT_CHANNEL_SIZE);

        // Media is available as soon as the session has started
        let stream = StreamHandle {
            session_id: session_id.clone(),
            url: media_url,
            access_token: AccessToken::new(media_token),
        };
        let _ = sender.try_send(ProviderEvent::StreamReady(stream));

        let handle = ApiSessionHandle {
            client: Arc::clone(&self.client),
            base_url: self.base_url.clone(),
            token: token.clone(),
            session_id: session_id.clone(),
            reader: Mutex::new(None),
            idle_sender: Mutex::new(None),
        };

        match realtime_endpoint {
            Some(endpoint) => {
                let reader = match spawn_realtime_reader(&endpoint, sender).await {
                    Ok(reader) => reader,
                    Err(e) => {
                        if let Err(stop_err) = handle.stop().await {
                            warn!("Failed to release session {}: {}", session_id, stop_err);
                        }
                        return Err(e);
                    }
                };
                *handle.reader.lock() = Some(reader);
            }
            None => {
                debug!("No realtime endpoint for session {}, talking events unavailable", session_id);
                *handle.idle_sender.lock() = Some(sender);
            }
        }

        info!("Streaming session started: {}", session_id);
        Ok(ProviderSession {
            session_id,
            handle: Box::new(handle),
            events,
        })
    }

    fn provider_name(&self) -> &str {
        "streaming-api"
    }
}

async fn spawn_realtime_reader(
    endpoint: &str,
    sender: mpsc::Sender<ProviderEvent>,
) -> Result<JoinHandle<()>, AvatarError> {
    if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
        return Err(AvatarError::SessionCreationFailed(
            "Invalid realtime endpoint protocol from API".to_string(),
        ));
    }

    let (ws_stream, _) = tokio::time::timeout(WS_CONNECT_TIMEOUT, connect_async(endpoint))
        .await
        .map_err(|_| AvatarError::SessionCreationFailed("Realtime connection timed out".to_string()))?
        .map_err(|e| AvatarError::SessionCreationFailed(format!("Failed to connect realtime endpoint: {}", e)))?;

    Ok(tokio::spawn(async move {
        let (_write, mut read) = ws_stream.split();
        loop {
            let event = match read.next().await {
                Some(Ok(Message::Text(text))) => match parse_realtime_message(&text) {
                    Some(event) => event,
                    None => {
                        debug!("Ignoring realtime message: {}", text);
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => ProviderEvent::Disconnected,
                Some(Ok(_)) => continue,
                Some(Err(e)) => ProviderEvent::Error(format!("Realtime connection error: {}", e)),
            };

            let terminal = matches!(event, ProviderEvent::Disconnected | ProviderEvent::Error(_));
            if sender.send(event).await.is_err() || terminal {
                break;
            }
        }
        debug!("Realtime reader stopped");
    }))
}

/// Command handle for one `v1/streaming.*` session
struct ApiSessionHandle {
    client: Arc<Client>,
    base_url: String,
    token: AccessToken,
    session_id: String,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Keeps the event channel open when there is no realtime reader
    idle_sender: Mutex<Option<mpsc::Sender<ProviderEvent>>>,
}

impl ApiSessionHandle {
    fn release_events(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.idle_sender.lock().take();
    }
}

#[async_trait]
impl SessionHandle for ApiSessionHandle {
    async fn speak(&self, request: &SpeakRequest) -> Result<(), AvatarError> {
        let mut payload = json!({
            "session_id": self.session_id,
            "text": request.text,
            "task_type": request.task_type.as_str(),
            "task_mode": "sync",
        });
        if let Some(emotion) = request.emotion {
            payload["voice"] = json!({ "emotion": emotion });
        }

        call(&self.client, &self.base_url, &self.token, "streaming.task", &payload)
            .await
            .map(|_| ())
            .map_err(AvatarError::SpeakFailed)
    }

    async fn interrupt(&self) -> Result<(), AvatarError> {
        call(
            &self.client,
            &self.base_url,
            &self.token,
            "streaming.interrupt",
            &json!({ "session_id": self.session_id }),
        )
        .await
        .map(|_| ())
        .map_err(AvatarError::Provider)
    }

    async fn stop(&self) -> Result<(), AvatarError> {
        self.release_events();
        call(
            &self.client,
            &self.base_url,
            &self.token,
            "streaming.stop",
            &json!({ "session_id": self.session_id }),
        )
        .await
        .map(|_| ())
        .map_err(AvatarError::Provider)
    }
}

impl Drop for ApiSessionHandle {
    fn drop(&mut self) {
        self.release_events();
    }
}
