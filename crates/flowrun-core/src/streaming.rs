//! Streaming pipeline: a handler may return a token stream instead of a final
//! output. The engine tees the stream into a client copy (forwarded as
//! [`StreamEvent`]s over an unbounded channel, so capture never applies
//! backpressure) and a capture copy accumulated to completion, then finalises
//! the block's state from the capture copy before scheduling resumes.

use std::collections::HashSet;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::error::HandlerError;
use crate::output::{AgentOutput, NormalizedOutput};

/// A stream of token chunks produced by a handler.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, HandlerError>> + Send>>;

/// A streaming handler result: the token stream plus the seed output holding
/// whatever metadata the handler already knows (model, token counts, ...).
pub struct StreamingExecution {
    pub block_id: String,
    pub stream: TokenStream,
    pub seed: NormalizedOutput,
}

impl StreamingExecution {
    pub fn new(block_id: impl Into<String>, stream: TokenStream, seed: NormalizedOutput) -> Self {
        Self {
            block_id: block_id.into(),
            stream,
            seed,
        }
    }
}

impl std::fmt::Debug for StreamingExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingExecution")
            .field("block_id", &self.block_id)
            .field("stream", &"<TokenStream>")
            .field("seed", &self.seed)
            .finish()
    }
}

/// Event forwarded to the external stream consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk { block_id: String, content: String },
    Done { block_id: String },
}

/// External streaming configuration for one execution.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Client copy destination. `None` disables forwarding; capture still runs.
    pub sender: Option<UnboundedSender<StreamEvent>>,
    /// Block ids whose streams are forwarded. Empty means every streaming block.
    pub selected_block_ids: HashSet<String>,
}

impl StreamOptions {
    pub fn forward_to(sender: UnboundedSender<StreamEvent>) -> Self {
        Self {
            sender: Some(sender),
            selected_block_ids: HashSet::new(),
        }
    }

    pub fn with_selected(mut self, block_ids: impl IntoIterator<Item = String>) -> Self {
        self.selected_block_ids = block_ids.into_iter().collect();
        self
    }

    fn forwards(&self, block_id: &str) -> bool {
        self.sender.is_some()
            && (self.selected_block_ids.is_empty() || self.selected_block_ids.contains(block_id))
    }
}

/// Build a [`TokenStream`] from ready chunks. Convenience for handlers and tests.
pub fn stream_from_chunks(chunks: Vec<String>) -> TokenStream {
    Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)))
}

/// Drain one streaming execution: forward chunks to the client copy and
/// accumulate the capture copy. Returns the full captured content.
pub async fn drain(
    execution: &mut StreamingExecution,
    options: &StreamOptions,
) -> Result<String, HandlerError> {
    let forward = options.forwards(&execution.block_id);
    let mut full = String::new();
    while let Some(chunk) = execution.stream.next().await {
        let chunk = chunk?;
        if forward
            && let Some(sender) = &options.sender
        {
            // Receiver side may have hung up; capture correctness is unaffected.
            let _ = sender.send(StreamEvent::Chunk {
                block_id: execution.block_id.clone(),
                content: chunk.clone(),
            });
        }
        full.push_str(&chunk);
    }
    if forward
        && let Some(sender) = &options.sender
    {
        let _ = sender.send(StreamEvent::Done {
            block_id: execution.block_id.clone(),
        });
    }
    debug!(block = %execution.block_id, bytes = full.len(), "stream captured");
    Ok(full)
}

/// Finalise a streaming block's output from the captured content. With a
/// declared response format the content is parsed as a structured object and
/// merged over the seed, preserving the seed's metadata fields; otherwise the
/// content becomes the output's `content`.
pub fn finalize(seed: NormalizedOutput, full_content: String, response_format: bool) -> NormalizedOutput {
    if response_format
        && let Ok(Value::Object(parsed)) = serde_json::from_str::<Value>(&full_content)
    {
        let mut merged: Map<String, Value> = parsed;
        if let Value::Object(seed_map) = seed.to_value() {
            for key in ["model", "tokens", "toolCalls", "cost"] {
                if let Some(v) = seed_map.get(key)
                    && !merged.contains_key(key)
                {
                    merged.insert(key.to_string(), v.clone());
                }
            }
        }
        return NormalizedOutput::Opaque(merged);
    }
    match seed {
        NormalizedOutput::Agent(agent) => NormalizedOutput::Agent(AgentOutput {
            content: full_content,
            ..agent
        }),
        other => {
            let mut map = match other.to_value() {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            map.insert("content".to_string(), Value::String(full_content));
            NormalizedOutput::Opaque(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::TokenUsage;
    use serde_json::json;

    fn agent_seed() -> NormalizedOutput {
        NormalizedOutput::Agent(AgentOutput {
            content: String::new(),
            model: Some("m1".to_string()),
            tokens: Some(TokenUsage {
                prompt: 3,
                completion: 7,
                total: 10,
            }),
            tool_calls: vec![],
            cost: None,
        })
    }

    #[tokio::test]
    async fn drain_captures_and_forwards() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut exec = StreamingExecution::new(
            "agent1",
            stream_from_chunks(vec!["hel".into(), "lo".into()]),
            agent_seed(),
        );
        let options = StreamOptions::forward_to(tx);
        let full = drain(&mut exec, &options).await.unwrap();
        assert_eq!(full, "hello");
        assert_eq!(
            rx.recv().await.unwrap(),
            StreamEvent::Chunk {
                block_id: "agent1".to_string(),
                content: "hel".to_string()
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StreamEvent::Chunk {
                block_id: "agent1".to_string(),
                content: "lo".to_string()
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StreamEvent::Done {
                block_id: "agent1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn drain_without_sender_still_captures() {
        let mut exec = StreamingExecution::new(
            "agent1",
            stream_from_chunks(vec!["a".into(), "b".into()]),
            agent_seed(),
        );
        let full = drain(&mut exec, &StreamOptions::default()).await.unwrap();
        assert_eq!(full, "ab");
    }

    #[tokio::test]
    async fn unselected_block_is_not_forwarded() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut exec = StreamingExecution::new(
            "agent1",
            stream_from_chunks(vec!["x".into()]),
            agent_seed(),
        );
        let options =
            StreamOptions::forward_to(tx).with_selected(vec!["other".to_string()]);
        let full = drain(&mut exec, &options).await.unwrap();
        assert_eq!(full, "x");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn finalize_plain_content() {
        let out = finalize(agent_seed(), "final text".to_string(), false);
        assert_eq!(out.get("content"), Some(json!("final text")));
        assert_eq!(out.get("model"), Some(json!("m1")));
    }

    #[test]
    fn finalize_response_format_preserves_metadata() {
        let out = finalize(
            agent_seed(),
            r#"{"sentiment": "positive", "score": 0.9}"#.to_string(),
            true,
        );
        assert_eq!(out.get("sentiment"), Some(json!("positive")));
        assert_eq!(out.get("model"), Some(json!("m1")));
        assert_eq!(out.get("tokens").unwrap()["total"], json!(10));
    }

    #[test]
    fn finalize_bad_json_falls_back_to_content() {
        let out = finalize(agent_seed(), "not json".to_string(), true);
        assert_eq!(out.get("content"), Some(json!("not json")));
    }
}
