use crate::api::{ensure_success, ApiClient, ApiError};
use crate::StreamLimits;
use futures_util::{pin_mut, Stream, StreamExt};
use reqwest::header::ACCEPT;
use sbx_core::{ChatRequest, ChatStreamEvent, DecodeReport, SseFrameDecoder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Provider name reported for answers produced by the platform's own stream.
pub const SYSTEM_PROVIDER: &str = "System";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
    pub provider: String,
}

impl ApiClient {
    /// Sends one conversational turn and follows the event stream.
    ///
    /// `on_thought` runs for every intermediate record, in arrival order.
    pub async fn chat<F>(&self, request: &ChatRequest, on_thought: F) -> Result<ChatReply, ApiError>
    where
        F: FnMut(&str),
    {
        let url = self.endpoint(&["vms", "ai", "chat"])?;
        debug!(
            event = "chat_start",
            task_id = request.task_id.as_deref().unwrap_or(""),
            history = request.history.len()
        );
        let response = self
            .http
            .post(url)
            .header(ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        consume_chat_stream(response.bytes_stream(), self.config.stream, on_thought).await
    }
}

/// Drives a chunked event-stream body to completion.
///
/// A stream that ends without a `Final` record yields an empty response.
pub async fn consume_chat_stream<S, B, E, F>(
    body: S,
    limits: StreamLimits,
    mut on_thought: F,
) -> Result<ChatReply, ApiError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<ApiError>,
    F: FnMut(&str),
{
    pin_mut!(body);
    let mut decoder = SseFrameDecoder::new(limits.max_frame_bytes);
    let mut exchange = Exchange::new(limits.max_malformed_frames);

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(Into::into)?;
        exchange.apply(decoder.push_chunk(chunk.as_ref()), &mut on_thought)?;
    }
    exchange.apply(decoder.finish(), &mut on_thought)?;

    debug!(
        event = "chat_complete",
        thoughts = exchange.thoughts,
        skipped = exchange.skipped,
        has_final = exchange.final_text.is_some()
    );
    Ok(ChatReply {
        response: exchange.final_text.unwrap_or_default(),
        provider: SYSTEM_PROVIDER.to_string(),
    })
}

struct Exchange {
    final_text: Option<String>,
    thoughts: usize,
    skipped: usize,
    max_skipped: Option<usize>,
}

impl Exchange {
    fn new(max_skipped: Option<usize>) -> Self {
        Self {
            final_text: None,
            thoughts: 0,
            skipped: 0,
            max_skipped,
        }
    }

    fn apply<F>(&mut self, report: DecodeReport<ChatStreamEvent>, on_thought: &mut F) -> Result<(), ApiError>
    where
        F: FnMut(&str),
    {
        for event in report.frames {
            match event {
                ChatStreamEvent::Thought { text } => {
                    self.thoughts += 1;
                    on_thought(&text);
                }
                ChatStreamEvent::Final { text } => {
                    if self.final_text.is_some() {
                        debug!(event = "chat_final_replaced");
                    }
                    self.final_text = Some(text);
                }
                ChatStreamEvent::Error { content, .. } => {
                    warn!(event = "chat_stream_error", message = %content);
                    let message = if content.trim().is_empty() {
                        "chat stream reported an error".to_string()
                    } else {
                        content
                    };
                    return Err(ApiError::Stream(message));
                }
            }
        }

        for error in report.errors {
            self.skipped += 1;
            warn!(event = "chat_frame_skipped", error = %error);
            if let Some(limit) = self.max_skipped {
                if self.skipped > limit {
                    return Err(ApiError::MalformedStream { limit });
                }
            }
        }
        Ok(())
    }
}
