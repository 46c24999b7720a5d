use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::IngestError;
use crate::stream::channel::StreamId;

/// Text frames of one open push connection. The stream ends when the
/// connection closes; an `Err` item means the connection broke.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, IngestError>> + Send>>;

/// Opens push connections for a logical stream.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self, stream: &StreamId) -> Result<FrameStream, IngestError>;
}
