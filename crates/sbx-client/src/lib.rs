//! Client side of the sandbox analysis platform: REST collaborator, the
//! streaming chat exchange, the progress channel and the correlation view.

use sbx_core::sse::DEFAULT_MAX_FRAME_BYTES;
use url::Url;

pub mod api;
pub mod chat;
pub mod progress;
pub mod view;

pub use api::{AnalysisApi, ApiClient, ApiError};
pub use chat::{consume_chat_stream, ChatReply, SYSTEM_PROVIDER};
pub use progress::{
    parse_progress, progress_endpoint, LatestProgress, ProgressChannel, ProgressError,
    ProgressHandle, RejectedMessage,
};
pub use view::{CorrelationController, CorrelationView};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";

/// Bounds applied while decoding one chat stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    pub max_frame_bytes: usize,
    /// Skipped frames tolerated before the exchange fails. `None` never fails.
    pub max_malformed_frames: Option<usize>,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_malformed_frames: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub stream: StreamLimits,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(Url::parse(DEFAULT_API_URL).expect("default api url is valid"))
    }
}

impl ClientConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            stream: StreamLimits::default(),
        }
    }

    pub fn with_stream_limits(mut self, stream: StreamLimits) -> Self {
        self.stream = stream;
        self
    }

    pub fn progress_endpoint(&self) -> Result<Url, ProgressError> {
        progress_endpoint(&self.base_url)
    }
}
