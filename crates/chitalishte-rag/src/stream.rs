//! Streaming response plumbing.
//!
//! One producer per request pushes token chunks over an mpsc channel,
//! followed by a JSON summary and an end-of-stream marker. Dropping the
//! consumer closes the channel and the producer stops promptly. The
//! `data:` line encoding is the engine's side of the wire contract; the
//! transport only has to write the lines out.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental slice of the answer text.
    Token(String),
    /// Terminal metadata, sent once after the last token.
    Summary(serde_json::Value),
    /// Explicit end-of-stream marker.
    Done,
}

impl StreamEvent {
    /// Encode as a Server-Sent-Events data line.
    pub fn to_sse_line(&self) -> String {
        match self {
            StreamEvent::Token(token) => format!("data: {}\n\n", token),
            StreamEvent::Summary(summary) => format!("data: {}\n\n", summary),
            StreamEvent::Done => "data: [DONE]\n\n".to_string(),
        }
    }
}

pub struct ResponseStream {
    receiver: mpsc::Receiver<StreamEvent>,
}

impl ResponseStream {
    pub fn new(receiver: mpsc::Receiver<StreamEvent>) -> Self {
        Self { receiver }
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    /// Drain the stream into its ordered event list.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

impl Stream for ResponseStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Split answer text into streamable chunks at word boundaries (~30 chars
/// per chunk), safe for any UTF-8.
pub fn chunk_text(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut chunk = String::with_capacity(40);
    for c in text.chars() {
        chunk.push(c);
        if chunk.len() >= 30 && (c == ' ' || c == '\n') {
            chunks.push(std::mem::take(&mut chunk));
        }
    }
    if !chunk.is_empty() {
        chunks.push(chunk);
    }
    chunks
}
