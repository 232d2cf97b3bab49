//! Core domain types for skynet
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | One conversation backed by one growing JSONL transcript |
//! | **Message** | One decoded conversational or tool event inside a session |
//! | **Cursor** | Persisted byte offset plus identity marker for a transcript file |
//! | **Delta** | What changed when one event was applied to the store |
//! | **Notification** | An engine-approved event bound for subscriber channels |
//! | **Rollup** | One notification standing in for several rate-limited ones |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================
// Sessions
// ============================================

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Seen (file or metadata) but no message yet
    Discovered,
    /// Messages are arriving
    Active,
    /// No new message for the idle threshold
    Idle,
    /// Quiet past the completion threshold, or the file went away
    Completed,
    /// Terminal error, or the file became permanently unreadable
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Discovered => "discovered",
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SessionStatus::Discovered => 0,
            SessionStatus::Active => 1,
            SessionStatus::Idle => 2,
            SessionStatus::Completed => 3,
            SessionStatus::Failed => 4,
        }
    }

    /// Whether the sweep should still look at this session
    pub fn is_open(&self) -> bool {
        !matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    /// Transitions move forward only, except reactivation (`idle → active`)
    /// and failure, which is reachable from every state but itself.
    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        match (self, to) {
            (SessionStatus::Failed, _) => false,
            (_, SessionStatus::Failed) => true,
            (SessionStatus::Idle, SessionStatus::Active) => true,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(SessionStatus::Discovered),
            "active" => Ok(SessionStatus::Active),
            "idle" => Ok(SessionStatus::Idle),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier (from `sessionId`, else the file stem)
    pub id: String,
    /// Working directory reported by the transcript
    pub cwd: Option<String>,
    /// Lifecycle status
    pub status: SessionStatus,
    /// When the store first saw this session
    pub created_at: DateTime<Utc>,
    /// Last time the record changed; only advances
    pub updated_at: DateTime<Utc>,
    /// Timestamp of the most recent message; drives the status sweep
    pub last_activity_at: DateTime<Utc>,
    /// Transcript backing this session
    pub source_path: PathBuf,
    /// Byte offset of the last applied line's end
    pub cursor_offset: u64,
    /// Event id of the most recent message
    pub last_event_id: Option<String>,
    /// Kind of the most recent message
    pub last_message_kind: Option<MessageKind>,
    /// Whether the most recent event was an error signal
    pub last_was_error: bool,
}

// ============================================
// Messages
// ============================================

/// Role/kind of a decoded message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Text typed by the human
    User,
    /// Assistant prose (all text blocks of one record, concatenated)
    AssistantText,
    /// A tool call made by the assistant
    ToolInvocation,
    /// Output returned by a tool
    ToolResult,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::User => "user",
            MessageKind::AssistantText => "assistant-text",
            MessageKind::ToolInvocation => "tool-invocation",
            MessageKind::ToolResult => "tool-result",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageKind::User),
            "assistant-text" => Ok(MessageKind::AssistantText),
            "tool-invocation" => Ok(MessageKind::ToolInvocation),
            "tool-result" => Ok(MessageKind::ToolResult),
            _ => Err(format!("unknown message kind: {}", s)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of an event inside its transcript.
///
/// Ordered by file generation, then the byte offset of the line, then the
/// index of the event within the line. Wall-clock timestamps never take part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SeqPos {
    /// Bumped every time the file is truncated or replaced
    pub generation: u32,
    /// Byte offset of the line start
    pub offset: u64,
    /// Index of the event among those decoded from the line
    pub index: u32,
}

impl fmt::Display for SeqPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.generation, self.offset, self.index)
    }
}

/// One immutable decoded event within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Store-wide unique event identifier (dedup key)
    pub event_id: String,
    /// Owning session
    pub session_id: String,
    /// Role/kind
    pub kind: MessageKind,
    /// Text payload (user or assistant text, tool output rendered as text)
    pub text: Option<String>,
    /// Tool name for invocations
    pub tool_name: Option<String>,
    /// Structured tool input for invocations
    pub tool_input: Option<serde_json::Value>,
    /// Tool call id as reported by the source, when present
    pub tool_use_id: Option<String>,
    /// Whether a tool result reported an error
    pub is_error: bool,
    /// For tool results: event id of the invocation it answers
    pub correlates_to: Option<String>,
    /// Stable ordering key
    pub seq: SeqPos,
    /// Timestamp reported by the source
    pub timestamp: DateTime<Utc>,
    /// Transcript the event was read from
    pub source_path: PathBuf,
}

// ============================================
// Cursors
// ============================================

/// Identity of the file a cursor belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
}

/// Persisted read position for one transcript
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cursor {
    /// Bytes consumed, always on a line boundary
    pub offset: u64,
    /// File identity at the time of the last read
    pub identity: FileIdentity,
    /// Hex digest of the first `fingerprint_len` bytes of the file
    pub fingerprint: Option<String>,
    /// Number of head bytes covered by `fingerprint`
    pub fingerprint_len: u32,
    /// Incremented on every truncation or replacement
    pub generation: u32,
}

impl Cursor {
    /// A cursor at offset zero for a (possibly replaced) file
    pub fn fresh(identity: FileIdentity, generation: u32) -> Self {
        Self {
            offset: 0,
            identity,
            fingerprint: None,
            fingerprint_len: 0,
            generation,
        }
    }
}

// ============================================
// Deltas
// ============================================

/// Why a status transition happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    FirstMessage,
    Reactivated,
    QuietPeriod,
    CompletionThreshold,
    FileRemoved,
    FileUnreadable,
    TerminalError,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionReason::FirstMessage => "first message",
            TransitionReason::Reactivated => "new activity",
            TransitionReason::QuietPeriod => "quiet period",
            TransitionReason::CompletionThreshold => "completion threshold",
            TransitionReason::FileRemoved => "transcript removed",
            TransitionReason::FileUnreadable => "transcript unreadable",
            TransitionReason::TerminalError => "terminal error",
        }
    }
}

/// A status change produced by an apply or a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub reason: TransitionReason,
}

/// Exactly what changed when an event was applied (or a sweep ran)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Session the change belongs to
    pub session_id: String,
    /// Working directory of the session, when known
    pub cwd: Option<String>,
    /// The session was created by this change
    pub session_created: bool,
    /// Newly stored message, if any
    pub message: Option<Message>,
    /// Status change, if any
    pub transition: Option<StatusTransition>,
    /// Kind of the session's most recent message after the change
    pub last_message_kind: Option<MessageKind>,
    /// Event id of the session's most recent message after the change
    pub last_event_id: Option<String>,
    /// Historical content replayed at startup; never notified
    pub backfill: bool,
    /// When the change happened (source timestamp or sweep time)
    pub occurred_at: DateTime<Utc>,
    /// Detail for error transitions
    pub detail: Option<String>,
}

impl Delta {
    pub(crate) fn new(session_id: &str, occurred_at: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            cwd: None,
            session_created: false,
            message: None,
            transition: None,
            last_message_kind: None,
            last_event_id: None,
            backfill: false,
            occurred_at,
            detail: None,
        }
    }

    /// Whether anything changed at all
    pub fn is_empty(&self) -> bool {
        !self.session_created && self.message.is_none() && self.transition.is_none()
    }
}

// ============================================
// Notifications
// ============================================

/// Notification priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            _ => Err(format!("unknown priority: {}", s)),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification outcome of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// The session failed (terminal error or unreadable transcript)
    SessionFailed,
    /// The assistant invoked a tool that asks the human something
    NeedsInput,
    /// A tool returned an error
    ToolError,
    /// The session went idle right after the assistant spoke
    WaitingForInput,
    /// The assistant ended its text with a question
    Question,
    /// The session finished
    SessionCompleted,
    /// Several rate-limited notifications coalesced into one
    Rollup,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::SessionFailed => "session_failed",
            NotificationKind::NeedsInput => "needs_input",
            NotificationKind::ToolError => "tool_error",
            NotificationKind::WaitingForInput => "waiting_for_input",
            NotificationKind::Question => "question",
            NotificationKind::SessionCompleted => "session_completed",
            NotificationKind::Rollup => "rollup",
        }
    }

    /// Human label used in summaries
    pub fn label(&self) -> &'static str {
        match self {
            NotificationKind::SessionFailed => "session failed",
            NotificationKind::NeedsInput => "needs input",
            NotificationKind::ToolError => "tool error",
            NotificationKind::WaitingForInput => "waiting for input",
            NotificationKind::Question => "question",
            NotificationKind::SessionCompleted => "session completed",
            NotificationKind::Rollup => "rollup",
        }
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_failed" => Ok(NotificationKind::SessionFailed),
            "needs_input" => Ok(NotificationKind::NeedsInput),
            "tool_error" => Ok(NotificationKind::ToolError),
            "waiting_for_input" => Ok(NotificationKind::WaitingForInput),
            "question" => Ok(NotificationKind::Question),
            "session_completed" => Ok(NotificationKind::SessionCompleted),
            "rollup" => Ok(NotificationKind::Rollup),
            _ => Err(format!("unknown notification kind: {}", s)),
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound notification, as seen by subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Deterministic key of the occurrence this notification answers
    pub event_key: String,
    /// Session concerned; `None` for rollups spanning several sessions
    pub session_id: Option<String>,
    pub kind: NotificationKind,
    pub priority: Priority,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    /// Number of notifications a rollup stands for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollup_count: Option<usize>,
}

/// Delivery state of a notification on one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Recorded, not yet attempted
    Pending,
    /// An attempt started and has not been confirmed
    InFlight,
    /// Confirmed by the subscriber
    Delivered,
    /// Attempts exhausted or rejected permanently
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::InFlight => "in_flight",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Failed => "failed",
        }
    }

    /// Whether a restart must try this record again
    pub fn is_unfinished(&self) -> bool {
        matches!(self, DeliveryState::Pending | DeliveryState::InFlight)
    }
}

impl std::str::FromStr for DeliveryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryState::Pending),
            "in_flight" => Ok(DeliveryState::InFlight),
            "delivered" => Ok(DeliveryState::Delivered),
            "failed" => Ok(DeliveryState::Failed),
            _ => Err(format!("unknown delivery state: {}", s)),
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dedup/audit record of one notification on one channel.
///
/// At most one record exists per `(event_key, channel)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub event_key: String,
    pub channel: String,
    pub state: DeliveryState,
    pub kind: NotificationKind,
    pub attempts: u32,
    pub emitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub notification: Notification,
}
