//! Topic based publish/subscribe transport.
//!
//! [`IpfsPubSub`] talks to a Kubo node over its HTTP RPC API; [`MemoryPubSub`]
//! is an in-process broker so several agents can share one process.

use crate::{NegotiationError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use parking_lot::Mutex;
use reqwest::{
    multipart::{Form, Part},
    Client, Response,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SUBSCRIPTION_BUFFER: usize = 256;
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// A message delivered on a topic, with the transport-level identity of its
/// publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub sender_id: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait PubSub: Send + Sync {
    /// Hands `data` to the transport. Returns once the local node accepted it;
    /// there is no delivery acknowledgement.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()>;

    /// Messages arrive on the returned channel in the order the transport
    /// delivered them.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<PubSubMessage>>;
}

#[derive(Debug, Deserialize)]
struct KuboMessage {
    from: String,
    data: String,
}

#[derive(Clone)]
pub struct IpfsPubSub {
    api_url: String,
    client: Client,
    resubscribe_delay: Duration,
}

impl IpfsPubSub {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            resubscribe_delay: Duration::from_secs(3),
        }
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    async fn open_stream(&self, topic: &str) -> Result<Response> {
        let response = self
            .client
            .post(format!("{}/api/v0/pubsub/sub", self.api_url))
            .query(&[("arg", encode_multibase(topic.as_bytes()))])
            .send()
            .await?
            .error_for_status()?;

        Ok(response)
    }

    async fn pump(self, topic: String, mut response: Response, tx: mpsc::Sender<PubSubMessage>) {
        loop {
            match forward_messages(&mut response, &tx).await {
                Ok(()) => tracing::warn!(topic = %topic, "Subscription stream ended"),
                Err(e) => tracing::warn!(topic = %topic, error = %e, "Subscription stream failed"),
            }

            loop {
                if tx.is_closed() {
                    tracing::debug!(topic = %topic, "Subscriber dropped, stopping");
                    return;
                }

                tokio::time::sleep(self.resubscribe_delay).await;
                match self.open_stream(&topic).await {
                    Ok(r) => {
                        tracing::info!(topic = %topic, "Resubscribed");
                        response = r;
                        break;
                    }
                    Err(e) => tracing::warn!(topic = %topic, error = %e, "Resubscribe failed"),
                }
            }
        }
    }
}

#[async_trait]
impl PubSub for IpfsPubSub {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let form = Form::new().part("file", Part::bytes(data).file_name("data"));

        self.client
            .post(format!("{}/api/v0/pubsub/pub", self.api_url))
            .query(&[("arg", encode_multibase(topic.as_bytes()))])
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<PubSubMessage>> {
        let response = self.open_stream(topic).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(self.clone().pump(topic.to_string(), response, tx));
        Ok(rx)
    }
}

/// Reads NDJSON messages off a subscription until the stream ends or the
/// receiver goes away.
async fn forward_messages(response: &mut Response, tx: &mpsc::Sender<PubSubMessage>) -> Result<()> {
    let mut lines = LineBuffer::new(MAX_LINE_BYTES);

    while let Some(chunk) = response.chunk().await? {
        for line in lines.push(&chunk) {
            match parse_kubo_line(&line) {
                Ok(Some(message)) => {
                    if tx.send(message).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Skipping undecodable pubsub message"),
            }
        }
    }

    Ok(())
}

/// Splits a byte stream into newline-terminated lines. A line longer than
/// `max_len` is dropped up to its terminating newline.
struct LineBuffer {
    buf: Vec<u8>,
    max_len: usize,
    overflowed: bool,
}

impl LineBuffer {
    fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
            overflowed: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();

        for segment in chunk.split_inclusive(|b| *b == b'\n') {
            let complete = segment.last() == Some(&b'\n');

            if !self.overflowed {
                self.buf.extend_from_slice(segment);
                if self.buf.len() > self.max_len {
                    tracing::warn!(limit = self.max_len, "Dropping oversized pubsub message");
                    self.buf = Vec::new();
                    self.overflowed = true;
                }
            }

            if complete {
                if !self.overflowed {
                    lines.push(std::mem::take(&mut self.buf));
                }
                self.overflowed = false;
            }
        }

        lines
    }
}

fn parse_kubo_line(line: &[u8]) -> Result<Option<PubSubMessage>> {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }

    let raw: KuboMessage = serde_json::from_slice(line)?;
    Ok(Some(PubSubMessage {
        sender_id: raw.from,
        data: decode_multibase(&raw.data)?,
    }))
}

/// Multibase base64url without padding, the encoding Kubo uses for topics and
/// payloads.
pub fn encode_multibase(bytes: &[u8]) -> String {
    format!("u{}", URL_SAFE_NO_PAD.encode(bytes))
}

pub fn decode_multibase(value: &str) -> Result<Vec<u8>> {
    let encoded = value.strip_prefix('u').ok_or_else(|| {
        NegotiationError::Serialization(format!("Unsupported multibase prefix in {:?}", value))
    })?;

    URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| NegotiationError::Serialization(format!("Invalid multibase payload: {}", e)))
}

type Subscribers = HashMap<String, Vec<mpsc::Sender<PubSubMessage>>>;

/// In-process broker. Handles created with [`MemoryPubSub::peer`] share the
/// broker and publish under their own sender id.
#[derive(Clone)]
pub struct MemoryPubSub {
    peer_id: String,
    topics: Arc<Mutex<Subscribers>>,
}

impl MemoryPubSub {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn peer(&self, peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            topics: Arc::clone(&self.topics),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let subscribers = {
            let mut topics = self.topics.lock();
            match topics.get_mut(topic) {
                Some(senders) => {
                    senders.retain(|s| !s.is_closed());
                    senders.clone()
                }
                None => Vec::new(),
            }
        };

        let message = PubSubMessage {
            sender_id: self.peer_id.clone(),
            data,
        };

        for subscriber in subscribers {
            // A subscriber dropping between the clone and the send is fine
            let _ = subscriber.send(message.clone()).await;
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<PubSubMessage>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
