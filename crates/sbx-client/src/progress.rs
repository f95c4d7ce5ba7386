use futures_util::StreamExt;
use sbx_core::ProgressEvent;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub const PROGRESS_PATH: &str = "/ws/progress";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("unsupported scheme for progress channel: {0}")]
    UnsupportedScheme(String),
    #[error("backend url has no host: {0}")]
    MissingHost(String),
    #[error("invalid progress endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("progress task failed: {0}")]
    Task(String),
}

/// Why an inbound message was dropped. Never fatal to the channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectedMessage {
    #[error("not json: {0}")]
    Json(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("bad shape: {0}")]
    Shape(String),
}

/// Derives the socket endpoint from the backend url: the page's transport
/// security picks `wss` or `ws`, host and port carry over.
pub fn progress_endpoint(base: &Url) -> Result<Url, ProgressError> {
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(ProgressError::UnsupportedScheme(other.to_string())),
    };
    let host = base
        .host_str()
        .ok_or_else(|| ProgressError::MissingHost(base.to_string()))?;
    let authority = match base.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok(Url::parse(&format!("{scheme}://{authority}{PROGRESS_PATH}"))?)
}

/// Structural gate: a message is delivered only when it names both a task
/// and a stage.
pub fn parse_progress(text: &str) -> Result<ProgressEvent, RejectedMessage> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| RejectedMessage::Json(err.to_string()))?;
    for field in ["task_id", "stage"] {
        if !present(&value, field) {
            return Err(RejectedMessage::MissingField(field));
        }
    }
    serde_json::from_value(value).map_err(|err| RejectedMessage::Shape(err.to_string()))
}

fn present(value: &Value, field: &str) -> bool {
    match value.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// One open subscription to the backend's progress feed. Owned exclusively
/// by whoever connected it; reconnecting is the caller's business.
pub struct ProgressChannel {
    socket: Socket,
    endpoint: Url,
}

impl ProgressChannel {
    pub async fn connect(endpoint: Url) -> Result<Self, ProgressError> {
        let (socket, _) = connect_async(endpoint.as_str()).await?;
        info!(event = "progress_connected", endpoint = %endpoint);
        Ok(Self { socket, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Delivers events until the server closes, the transport fails, or
    /// `shutdown` resolves (which sends a Close frame first).
    pub async fn run<F, S>(mut self, mut on_event: F, shutdown: S) -> Result<(), ProgressError>
    where
        F: FnMut(ProgressEvent),
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!(event = "progress_shutdown", endpoint = %self.endpoint);
                    let _ = self.socket.close(None).await;
                    return Ok(());
                }
                message = self.socket.next() => match message {
                    Some(Ok(Message::Text(text))) => dispatch(&text, &mut on_event),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => dispatch(&text, &mut on_event),
                        Err(err) => warn!(event = "progress_message_dropped", error = %err),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(event = "progress_closed_by_server", frame = ?frame);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "progress_socket_error", error = %err);
                        return Err(err.into());
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    /// Runs the channel on its own task. Dropping the returned handle closes
    /// the channel.
    pub fn spawn<F>(self, on_event: F) -> ProgressHandle
    where
        F: FnMut(ProgressEvent) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run(on_event, async move {
            let _ = shutdown_rx.await;
        }));
        ProgressHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

fn dispatch<F: FnMut(ProgressEvent)>(text: &str, on_event: &mut F) {
    match parse_progress(text) {
        Ok(event) => on_event(event),
        Err(reason) => warn!(event = "progress_message_dropped", error = %reason),
    }
}

pub struct ProgressHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ProgressError>>,
}

impl ProgressHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Closes the channel and waits for the reader task to wind down.
    pub async fn close(mut self) -> Result<(), ProgressError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.join().await
    }

    /// Waits for the server side to end the channel.
    pub async fn wait(mut self) -> Result<(), ProgressError> {
        let shutdown = self.shutdown.take();
        let result = self.join().await;
        drop(shutdown);
        result
    }

    async fn join(&mut self) -> Result<(), ProgressError> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(err) => Err(ProgressError::Task(err.to_string())),
        }
    }
}

/// Latest event per task; older events for the same task are discarded.
#[derive(Debug, Clone, Default)]
pub struct LatestProgress {
    by_task: HashMap<String, ProgressEvent>,
}

impl LatestProgress {
    /// Returns the event it replaced, if any.
    pub fn record(&mut self, event: ProgressEvent) -> Option<ProgressEvent> {
        self.by_task.insert(event.task_id.clone(), event)
    }

    pub fn get(&self, task_id: &str) -> Option<&ProgressEvent> {
        self.by_task.get(task_id)
    }

    pub fn len(&self) -> usize {
        self.by_task.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_task.is_empty()
    }

    pub fn clear_task(&mut self, task_id: &str) -> Option<ProgressEvent> {
        self.by_task.remove(task_id)
    }
}
