use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedSender;

use super::{Completion, FunctionCall, ToolCall, UsageStats};

/// Events emitted by the Streaming Driver as a completion is assembled.
/// Consumers (the turn loop, the CLI renderer, delegation's progress view)
/// subscribe via an unbounded channel rather than blocking on the full response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A new model round has started (used when a turn re-enters the loop after tool results).
    RoundStart { round: usize },
    /// A chunk of assistant text content arrived.
    ContentDelta(String),
    /// A chunk of reasoning/thinking content arrived, if the provider emits it separately.
    ReasoningDelta(String),
    /// The model began requesting a tool call (name known, arguments still streaming).
    ToolCallStart { name: String },
    /// A tool finished executing; carries a short human-readable preview, not the raw output.
    ToolResult {
        name: String,
        success: bool,
        output_preview: String,
    },
    /// The stream has ended; no further events will be sent for this completion.
    Done,
}

/// Stream a chat completion, forwarding `StreamEvent`s as tokens arrive.
/// Returns the final Completion once the stream ends.
pub async fn stream_completion(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    model: &str,
    messages: &[super::Message],
    tools: &[super::ToolDefinition],
    max_tokens: u32,
    event_tx: Option<UnboundedSender<StreamEvent>>,
) -> Result<(Completion, UsageStats)> {
    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "max_tokens": max_tokens,
        "stream": true,
    });

    if !tools.is_empty() {
        body["tools"] = serde_json::to_value(tools)?;
    }

    let response = client
        .post(format!("{}/chat/completions", base_url))
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .context("Failed to send streaming request")?;

    let status = response.status();
    if !status.is_success() {
        let err_body = response.text().await.unwrap_or_default();
        anyhow::bail!("LLM API returned {}: {}", status, err_body);
    }

    let mut acc = StreamAccumulator::new();

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Stream read error")?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        // Process complete SSE lines
        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim().to_string();
            buffer = buffer[line_end + 1..].to_string();
            acc.feed_line(&line, event_tx.as_ref());
        }
    }

    if let Some(ref tx) = event_tx {
        let _ = tx.send(StreamEvent::Done);
    }

    Ok(acc.finalize())
}

/// Index-keyed accumulator for one streamed completion: a content/reasoning
/// buffer plus a map from tool-call index to its in-progress `{id, name,
/// arguments}`, matching §4.8's accumulator state exactly. `feed_line` is the
/// unit the network loop drives one SSE line at a time; `finalize` sorts the
/// accumulated tool calls by index and produces the completed message.
struct StreamAccumulator {
    content: String,
    reasoning: String,
    tool_calls: Vec<(usize, PartialToolCall)>,
    usage: UsageStats,
    announced: std::collections::HashSet<usize>,
}

impl StreamAccumulator {
    fn new() -> Self {
        Self {
            content: String::new(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
            usage: UsageStats::default(),
            announced: std::collections::HashSet::new(),
        }
    }

    /// Feed one already-trimmed line of SSE input. Non-`data:` lines, blank
    /// lines, and the `[DONE]` sentinel are ignored; malformed JSON in a
    /// `data:` line is silently skipped (a partial/corrupt chunk shouldn't
    /// abort the whole stream).
    fn feed_line(&mut self, line: &str, event_tx: Option<&UnboundedSender<StreamEvent>>) {
        if line.is_empty() || line == "data: [DONE]" {
            return;
        }
        let Some(json_str) = line.strip_prefix("data: ") else {
            return;
        };
        let Ok(chunk) = serde_json::from_str::<StreamChunk>(json_str) else {
            return;
        };

        if let Some(choice) = chunk.choices.first() {
            let delta = &choice.delta;

            if let Some(ref c) = delta.content {
                self.content.push_str(c);
                if let Some(tx) = event_tx {
                    let _ = tx.send(StreamEvent::ContentDelta(c.clone()));
                }
            }

            if let Some(ref r) = delta.reasoning_content {
                self.reasoning.push_str(r);
                if let Some(tx) = event_tx {
                    let _ = tx.send(StreamEvent::ReasoningDelta(r.clone()));
                }
            }

            if let Some(ref tc_deltas) = delta.tool_calls {
                for tc_delta in tc_deltas {
                    let idx = tc_delta.index as usize;
                    let partial = self.partial_at(idx);
                    if let Some(ref id) = tc_delta.id {
                        partial.id = id.clone();
                    }
                    if let Some(ref func) = tc_delta.function {
                        if let Some(ref name) = func.name {
                            partial.name = name.clone();
                            if self.announced.insert(idx) {
                                if let Some(tx) = event_tx {
                                    let _ = tx.send(StreamEvent::ToolCallStart { name: name.clone() });
                                }
                            }
                        }
                        if let Some(ref args) = func.arguments {
                            self.partial_at(idx).arguments.push_str(args);
                        }
                    }
                }
            }
        }

        if let Some(u) = chunk.usage {
            self.usage = UsageStats {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            };
        }
    }

    /// The in-progress entry for tool-call `index`, inserting it (in whatever
    /// order indices first arrive — deltas may arrive out of order) if this
    /// is the first delta seen for it.
    fn partial_at(&mut self, index: usize) -> &mut PartialToolCall {
        if let Some(pos) = self.tool_calls.iter().position(|(i, _)| *i == index) {
            &mut self.tool_calls[pos].1
        } else {
            self.tool_calls.push((index, PartialToolCall::default()));
            &mut self.tool_calls.last_mut().expect("just pushed").1
        }
    }

    /// Finalize into a `Completion`, sorting tool calls by index regardless
    /// of the order their deltas arrived in.
    fn finalize(mut self) -> (Completion, UsageStats) {
        let reasoning_opt = if self.reasoning.is_empty() {
            None
        } else {
            Some(self.reasoning)
        };

        if self.tool_calls.is_empty() {
            return (
                Completion::Text {
                    content: self.content,
                    reasoning: reasoning_opt,
                },
                self.usage,
            );
        }

        self.tool_calls.sort_by_key(|(idx, _)| *idx);
        let calls = self
            .tool_calls
            .into_iter()
            .map(|(_, tc)| ToolCall {
                id: tc.id,
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: tc.name,
                    arguments: tc.arguments,
                },
            })
            .collect();

        (
            Completion::ToolCalls {
                calls,
                reasoning: reasoning_opt,
            },
            self.usage,
        )
    }
}

// ── SSE chunk types ──

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_event_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<StreamEvent>();
    }

    fn sse(json: &str) -> String {
        format!("data: {}", json)
    }

    #[test]
    fn test_accumulates_content_deltas_in_order() {
        let mut acc = StreamAccumulator::new();
        acc.feed_line(&sse(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#), None);
        acc.feed_line(&sse(r#"{"choices":[{"delta":{"content":"lo"}}]}"#), None);
        acc.feed_line(&sse("[DONE]"), None);
        let (completion, _) = acc.finalize();
        match completion {
            Completion::Text { content, .. } => assert_eq!(content, "Hello"),
            other => panic!("expected Completion::Text, got {:?}", other),
        }
    }

    #[test]
    fn test_accumulates_split_arguments_for_single_tool_call() {
        let mut acc = StreamAccumulator::new();
        acc.feed_line(
            &sse(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"read_file"}}]}}]}"#),
            None,
        );
        acc.feed_line(
            &sse(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\":"}}]}}]}"#),
            None,
        );
        acc.feed_line(
            &sse(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"/a\"}"}}]}}]}"#),
            None,
        );
        let (completion, _) = acc.finalize();
        match completion {
            Completion::ToolCalls { calls, .. } => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].id, "call_1");
                assert_eq!(calls[0].function.name, "read_file");
                assert_eq!(calls[0].function.arguments, r#"{"path":"/a"}"#);
            }
            other => panic!("expected Completion::ToolCalls, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_order_indices_finalize_sorted() {
        let mut acc = StreamAccumulator::new();
        // index 1 arrives before index 0.
        acc.feed_line(
            &sse(r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"write_file","arguments":"{}"}}]}}]}"#),
            None,
        );
        acc.feed_line(
            &sse(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"read_file","arguments":"{}"}}]}}]}"#),
            None,
        );
        let (completion, _) = acc.finalize();
        match completion {
            Completion::ToolCalls { calls, .. } => {
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[0].id, "call_a");
                assert_eq!(calls[1].id, "call_b");
            }
            other => panic!("expected Completion::ToolCalls, got {:?}", other),
        }
    }

    #[test]
    fn test_usage_captured_from_final_chunk() {
        let mut acc = StreamAccumulator::new();
        acc.feed_line(&sse(r#"{"choices":[{"delta":{"content":"hi"}}]}"#), None);
        acc.feed_line(
            &sse(r#"{"choices":[{"delta":{}}],"usage":{"prompt_tokens":10,"completion_tokens":2,"total_tokens":12}}"#),
            None,
        );
        let (_, usage) = acc.finalize();
        assert_eq!(usage.total_tokens, 12);
    }

    #[test]
    fn test_malformed_chunk_is_skipped_not_fatal() {
        let mut acc = StreamAccumulator::new();
        acc.feed_line("data: {not valid json", None);
        acc.feed_line(&sse(r#"{"choices":[{"delta":{"content":"ok"}}]}"#), None);
        let (completion, _) = acc.finalize();
        match completion {
            Completion::Text { content, .. } => assert_eq!(content, "ok"),
            other => panic!("expected Completion::Text, got {:?}", other),
        }
    }
}
