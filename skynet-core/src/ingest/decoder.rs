//! Transcript record decoder
//!
//! Turns one JSONL line into typed domain events.
//!
//! # Error Handling
//!
//! - **Malformed JSON lines**: counted in [`DecodeStats::decode_errors`] and
//!   dropped. One bad line never stops the file.
//! - **Missing fields**: `#[serde(default)]` everywhere. A missing timestamp
//!   falls back to the time the line was read.
//! - **Unknown record types and blocks**: ignored, not errors.
//! - **Sidechain records**: ignored; derived transcripts are not part of the
//!   main conversation.
//!
//! # Event identifiers
//!
//! The record `uuid` identifies the first event of a line. Later events of the
//! same line get `uuid#1`, `uuid#2`, ... A line without a `uuid` uses the
//! SHA-256 of its bytes, so re-reading the same line always yields the same
//! identifiers.

use crate::types::{Message, MessageKind, SeqPos};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

// ============================================
// Raw JSONL record types (serde deserialization)
// ============================================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawRecord {
    uuid: Option<String>,
    session_id: Option<String>,
    #[serde(rename = "type")]
    record_type: Option<String>,
    timestamp: Option<String>,
    cwd: Option<String>,
    is_sidechain: Option<bool>,
    is_meta: Option<bool>,
    is_api_error_message: Option<bool>,
    /// Severity on `system` records
    level: Option<String>,
    /// Text on `system` records
    content: Option<serde_json::Value>,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    content: Option<RawContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    // thinking, image, and anything newer
    #[serde(other)]
    Unknown,
}

// ============================================
// Decoded output
// ============================================

/// Counters kept by a decoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Lines handed to the decoder
    pub lines: u64,
    /// Lines that produced a record
    pub decoded: u64,
    /// Lines that were not valid JSON records
    pub decode_errors: u64,
    /// Valid lines of a shape the pipeline does not track
    pub ignored: u64,
}

/// One logical item inside a record
#[derive(Debug, Clone, PartialEq)]
pub enum RecordItem {
    UserText(String),
    /// All text blocks of one assistant record, concatenated in order
    AssistantText(String),
    ToolInvocation {
        id: Option<String>,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: Option<String>,
        output: String,
        is_error: bool,
    },
}

/// A decoded line
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub uuid: Option<String>,
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub items: Vec<RecordItem>,
    /// Set when the record signals a terminal error
    pub terminal_error: Option<String>,
}

/// Where a line came from; needed to build ordered events
#[derive(Debug, Clone)]
pub struct LineOrigin<'a> {
    pub path: &'a Path,
    /// Session the file is bound to
    pub session_id: &'a str,
    pub generation: u32,
    /// Byte offset of the line start
    pub offset: u64,
    /// Raw line text, hashed when the record carries no uuid
    pub line: &'a str,
    /// Timestamp used when the record has none
    pub fallback_ts: DateTime<Utc>,
}

/// Payload of a domain event
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    /// Identifies the session and its working directory; never stored as a message
    SessionMetadata,
    Message(Message),
    /// The source reported a failure the session cannot recover from
    TerminalError { detail: String },
}

/// A typed event ready for the session store
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub event_id: String,
    pub session_id: String,
    pub cwd: Option<String>,
    pub seq: SeqPos,
    pub timestamp: DateTime<Utc>,
    pub source_path: PathBuf,
    pub body: EventBody,
}

impl DomainEvent {
    pub fn message(&self) -> Option<&Message> {
        match &self.body {
            EventBody::Message(m) => Some(m),
            _ => None,
        }
    }
}

// ============================================
// Decoder
// ============================================

/// Stateless line decoder plus counters
#[derive(Debug, Default)]
pub struct RecordDecoder {
    stats: DecodeStats,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Decode one line. Returns `None` for malformed or untracked records.
    pub fn decode(&mut self, line: &str) -> Option<DecodedRecord> {
        self.stats.lines += 1;

        let record: RawRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                self.stats.decode_errors += 1;
                tracing::debug!(error = %e, "Dropping malformed transcript line");
                return None;
            }
        };

        if record.is_sidechain.unwrap_or(false) || record.is_meta.unwrap_or(false) {
            self.stats.ignored += 1;
            return None;
        }

        let record_type = record.record_type.as_deref().unwrap_or("");
        // Snapshots and summaries are bookkeeping, not conversation
        if matches!(record_type, "file-history-snapshot" | "summary") {
            self.stats.ignored += 1;
            return None;
        }

        let mut items = Vec::new();
        let mut terminal_error = None;

        match record_type {
            "user" => {
                if let Some(content) = record.message.as_ref().and_then(|m| m.content.as_ref()) {
                    user_items(content, &mut items);
                }
            }
            "assistant" => {
                if let Some(content) = record.message.as_ref().and_then(|m| m.content.as_ref()) {
                    assistant_items(content, &mut items);
                }
                if record.is_api_error_message.unwrap_or(false) {
                    let detail = items
                        .iter()
                        .find_map(|item| match item {
                            RecordItem::AssistantText(t) => Some(t.clone()),
                            _ => None,
                        })
                        .unwrap_or_else(|| "API error".to_string());
                    // The error text is not a real assistant reply
                    items.clear();
                    terminal_error = Some(detail);
                }
            }
            "system" => {
                if record.level.as_deref() == Some("error") {
                    let detail = record
                        .content
                        .as_ref()
                        .map(value_text)
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| "system error".to_string());
                    terminal_error = Some(detail);
                }
            }
            _ => {}
        }

        let has_metadata = record.session_id.is_some() || record.cwd.is_some();
        if items.is_empty() && terminal_error.is_none() && !has_metadata {
            self.stats.ignored += 1;
            return None;
        }

        self.stats.decoded += 1;
        Some(DecodedRecord {
            uuid: record.uuid,
            session_id: record.session_id,
            cwd: record.cwd,
            timestamp: record.timestamp.as_deref().and_then(parse_timestamp),
            items,
            terminal_error,
        })
    }
}

impl DecodedRecord {
    /// Expand the record into ordered domain events.
    pub fn into_events(self, origin: &LineOrigin<'_>) -> Vec<DomainEvent> {
        let base = self.uuid.clone().unwrap_or_else(|| line_digest(origin.line));
        let timestamp = self.timestamp.unwrap_or(origin.fallback_ts);
        let mut events = Vec::with_capacity(self.items.len() + 2);
        let mut index = 0u32;

        let mut push = |event_id: String, body: EventBody, index: &mut u32| {
            events.push(DomainEvent {
                event_id,
                session_id: origin.session_id.to_string(),
                cwd: self.cwd.clone(),
                seq: SeqPos {
                    generation: origin.generation,
                    offset: origin.offset,
                    index: *index,
                },
                timestamp,
                source_path: origin.path.to_path_buf(),
                body,
            });
            *index += 1;
        };

        if self.session_id.is_some() || self.cwd.is_some() {
            push(format!("{}#meta", base), EventBody::SessionMetadata, &mut index);
        }

        for (i, item) in self.items.into_iter().enumerate() {
            let event_id = if i == 0 {
                base.clone()
            } else {
                format!("{}#{}", base, i)
            };
            let message = item_to_message(item, &event_id, origin, timestamp, index);
            push(event_id, EventBody::Message(message), &mut index);
        }

        if let Some(detail) = self.terminal_error {
            push(
                format!("{}#error", base),
                EventBody::TerminalError { detail },
                &mut index,
            );
        }

        events
    }
}

/// Pick the invocation a tool result answers.
///
/// `pending` holds `(event_id, tool_use_id)` of the session's uncorrelated
/// invocations in sequence order. An explicit id match wins; otherwise the
/// nearest preceding uncorrelated invocation is used.
pub fn correlate(pending: &[(String, Option<String>)], tool_use_id: Option<&str>) -> Option<String> {
    if let Some(wanted) = tool_use_id {
        if let Some((event_id, _)) = pending
            .iter()
            .rev()
            .find(|(_, id)| id.as_deref() == Some(wanted))
        {
            return Some(event_id.clone());
        }
    }
    pending.last().map(|(event_id, _)| event_id.clone())
}

fn item_to_message(
    item: RecordItem,
    event_id: &str,
    origin: &LineOrigin<'_>,
    timestamp: DateTime<Utc>,
    index: u32,
) -> Message {
    let mut message = Message {
        event_id: event_id.to_string(),
        session_id: origin.session_id.to_string(),
        kind: MessageKind::User,
        text: None,
        tool_name: None,
        tool_input: None,
        tool_use_id: None,
        is_error: false,
        correlates_to: None,
        seq: SeqPos {
            generation: origin.generation,
            offset: origin.offset,
            index,
        },
        timestamp,
        source_path: origin.path.to_path_buf(),
    };

    match item {
        RecordItem::UserText(text) => {
            message.text = Some(text);
        }
        RecordItem::AssistantText(text) => {
            message.kind = MessageKind::AssistantText;
            message.text = Some(text);
        }
        RecordItem::ToolInvocation { id, name, input } => {
            message.kind = MessageKind::ToolInvocation;
            message.tool_name = Some(name);
            message.tool_input = Some(input);
            message.tool_use_id = id;
        }
        RecordItem::ToolResult {
            tool_use_id,
            output,
            is_error,
        } => {
            message.kind = MessageKind::ToolResult;
            message.text = Some(output);
            message.tool_use_id = tool_use_id;
            message.is_error = is_error;
        }
    }
    message
}

fn user_items(content: &RawContent, items: &mut Vec<RecordItem>) {
    match content {
        RawContent::Text(text) => {
            if !text.trim().is_empty() {
                items.push(RecordItem::UserText(text.clone()));
            }
        }
        RawContent::Blocks(blocks) => {
            let mut text = String::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text: t } => text.push_str(t),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => items.push(RecordItem::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        output: value_text(content),
                        is_error: *is_error,
                    }),
                    _ => {}
                }
            }
            if !text.trim().is_empty() {
                items.insert(0, RecordItem::UserText(text));
            }
        }
    }
}

fn assistant_items(content: &RawContent, items: &mut Vec<RecordItem>) {
    match content {
        RawContent::Text(text) => {
            if !text.is_empty() {
                items.push(RecordItem::AssistantText(text.clone()));
            }
        }
        RawContent::Blocks(blocks) => {
            // Text blocks become one message placed where the first one was
            let mut text: Option<(usize, String)> = None;
            for block in blocks {
                match block {
                    ContentBlock::Text { text: t } => match &mut text {
                        Some((_, acc)) => acc.push_str(t),
                        None => text = Some((items.len(), t.clone())),
                    },
                    ContentBlock::ToolUse { id, name, input } => {
                        items.push(RecordItem::ToolInvocation {
                            id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        })
                    }
                    _ => {}
                }
            }
            if let Some((at, acc)) = text {
                if !acc.is_empty() {
                    items.insert(at, RecordItem::AssistantText(acc));
                }
            }
        }
    }
}

/// Render tool output as text: strings as-is, block arrays by their text parts
fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p {
                serde_json::Value::String(s) => Some(s.clone()),
                other => other.get("text").and_then(|t| t.as_str()).map(String::from),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn line_digest(line: &str) -> String {
    hex::encode(Sha256::digest(line.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin<'a>(line: &'a str, offset: u64) -> LineOrigin<'a> {
        LineOrigin {
            path: Path::new("/tmp/test-123.jsonl"),
            session_id: "test-123",
            generation: 0,
            offset,
            line,
            fallback_ts: Utc::now(),
        }
    }

    fn messages(decoder: &mut RecordDecoder, line: &str, offset: u64) -> Vec<Message> {
        decoder
            .decode(line)
            .map(|r| r.into_events(&origin(line, offset)))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|e| match e.body {
                EventBody::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_three_line_conversation() {
        let lines = [
            r#"{"type":"user","uuid":"u1","sessionId":"test-123","cwd":"/home/u/proj","timestamp":"2025-01-01T10:00:00Z","message":{"role":"user","content":"Hello"}}"#,
            r#"{"type":"assistant","uuid":"a1","sessionId":"test-123","timestamp":"2025-01-01T10:00:01Z","message":{"role":"assistant","content":[{"type":"text","text":"Hi "},{"type":"text","text":"there!"}]}}"#,
            r#"{"type":"assistant","uuid":"a2","sessionId":"test-123","timestamp":"2025-01-01T10:00:02Z","message":{"role":"assistant","content":[{"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"ls"}}]}}"#,
        ];

        let mut decoder = RecordDecoder::new();
        let mut all = Vec::new();
        let mut offset = 0;
        for line in lines {
            all.extend(messages(&mut decoder, line, offset));
            offset += line.len() as u64 + 1;
        }

        assert_eq!(all.len(), 3);
        let kinds: Vec<_> = all.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::User,
                MessageKind::AssistantText,
                MessageKind::ToolInvocation
            ]
        );
        assert_eq!(all[0].text.as_deref(), Some("Hello"));
        assert_eq!(all[1].text.as_deref(), Some("Hi there!"));
        assert_eq!(all[2].tool_name.as_deref(), Some("Bash"));
        assert_eq!(all[2].tool_input, Some(serde_json::json!({"command": "ls"})));
        assert!(all[0].seq < all[1].seq && all[1].seq < all[2].seq);
        assert_eq!(decoder.stats().decoded, 3);
    }

    #[test]
    fn test_malformed_lines_are_counted_not_fatal() {
        let mut decoder = RecordDecoder::new();
        assert!(decoder.decode("{not json").is_none());
        assert!(decoder.decode(r#"{"type":"user","message":"#).is_none());
        assert!(decoder
            .decode(r#"{"type":"user","uuid":"u","message":{"content":"ok"}}"#)
            .is_some());

        let stats = decoder.stats();
        assert_eq!(stats.lines, 3);
        assert_eq!(stats.decode_errors, 2);
        assert_eq!(stats.decoded, 1);
    }

    #[test]
    fn test_untracked_records_are_ignored() {
        let mut decoder = RecordDecoder::new();
        assert!(decoder
            .decode(r#"{"type":"file-history-snapshot","messageId":"x","snapshot":{}}"#)
            .is_none());
        assert!(decoder
            .decode(r#"{"type":"user","uuid":"s","isSidechain":true,"sessionId":"s1","message":{"content":"hi"}}"#)
            .is_none());
        assert!(decoder.decode(r#"{"type":"progress","data":{}}"#).is_none());
        assert_eq!(decoder.stats().ignored, 3);
        assert_eq!(decoder.stats().decode_errors, 0);
    }

    #[test]
    fn test_event_ids_are_stable_and_suffixed() {
        let line = r#"{"type":"assistant","uuid":"a9","message":{"content":[{"type":"text","text":"Running"},{"type":"tool_use","id":"t1","name":"Read","input":{}},{"type":"tool_use","id":"t2","name":"Grep","input":{}}]}}"#;
        let mut decoder = RecordDecoder::new();
        let ids: Vec<_> = messages(&mut decoder, line, 0)
            .into_iter()
            .map(|m| m.event_id)
            .collect();
        assert_eq!(ids, vec!["a9", "a9#1", "a9#2"]);

        // No uuid: the line digest is used, identically on every read
        let anon = r#"{"type":"user","message":{"content":"no id"}}"#;
        let first = messages(&mut decoder, anon, 0);
        let second = messages(&mut decoder, anon, 0);
        assert_eq!(first[0].event_id, second[0].event_id);
        assert_eq!(first[0].event_id.len(), 64);
    }

    #[test]
    fn test_tool_results_and_terminal_errors() {
        let mut decoder = RecordDecoder::new();
        let result = r#"{"type":"user","uuid":"r1","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"boom"}],"is_error":true}]}}"#;
        let msgs = messages(&mut decoder, result, 0);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageKind::ToolResult);
        assert_eq!(msgs[0].text.as_deref(), Some("boom"));
        assert!(msgs[0].is_error);
        assert_eq!(msgs[0].tool_use_id.as_deref(), Some("t1"));

        let system = r#"{"type":"system","uuid":"e1","level":"error","content":"Request failed"}"#;
        let record = decoder.decode(system).unwrap();
        assert_eq!(record.terminal_error.as_deref(), Some("Request failed"));
        let events = record.into_events(&origin(system, 0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, "e1#error");

        let api = r#"{"type":"assistant","uuid":"x1","isApiErrorMessage":true,"message":{"content":[{"type":"text","text":"API Error: 500"}]}}"#;
        let record = decoder.decode(api).unwrap();
        assert!(record.items.is_empty());
        assert_eq!(record.terminal_error.as_deref(), Some("API Error: 500"));
    }

    #[test]
    fn test_metadata_event_precedes_messages() {
        let line = r#"{"type":"user","uuid":"u1","sessionId":"abc","cwd":"/w","message":{"content":"go"}}"#;
        let mut decoder = RecordDecoder::new();
        let events = decoder.decode(line).unwrap().into_events(&origin(line, 10));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].body, EventBody::SessionMetadata);
        assert_eq!(events[0].cwd.as_deref(), Some("/w"));
        assert_eq!(events[1].event_id, "u1");
        assert_eq!(events[1].seq.index, 1);
        assert_eq!(events[1].seq.offset, 10);
    }

    #[test]
    fn test_correlation_prefers_explicit_id_then_nearest() {
        let pending = vec![
            ("inv-1".to_string(), Some("t1".to_string())),
            ("inv-2".to_string(), Some("t2".to_string())),
            ("inv-3".to_string(), None),
        ];
        assert_eq!(correlate(&pending, Some("t1")).as_deref(), Some("inv-1"));
        assert_eq!(correlate(&pending, Some("missing")).as_deref(), Some("inv-3"));
        assert_eq!(correlate(&pending, None).as_deref(), Some("inv-3"));
        assert_eq!(correlate(&[], None), None);
    }
}
