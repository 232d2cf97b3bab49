//! Deterministic delta classification
//!
//! | Delta | Outcome |
//! |-------|---------|
//! | backfill | suppress |
//! | `→ failed` | session failed, high |
//! | attention tool invocation | needs input, high |
//! | tool result with error | tool error, normal |
//! | `→ idle` right after assistant text | waiting for input, normal |
//! | `→ completed` | session completed, low |
//! | assistant text ending in `?` | question, low |
//! | anything else | suppress |
//!
//! When a delta matches several rows, the highest priority wins; among equal
//! priorities the earlier row wins.

use crate::types::{Delta, MessageKind, NotificationKind, Priority, SessionStatus};

/// Why a delta produced no notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuppressReason {
    /// Historical content replayed at startup
    Backfill,
    /// Nothing in the delta is worth a notification
    NeverNotify,
    /// Priority below the configured minimum
    BelowThreshold,
    /// The same kind was just sent for this session
    Cooldown,
    /// Every channel is muted
    Muted,
    /// The delta does not describe a change
    Malformed,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::Backfill => "backfill",
            SuppressReason::NeverNotify => "never_notify",
            SuppressReason::BelowThreshold => "below_threshold",
            SuppressReason::Cooldown => "cooldown",
            SuppressReason::Muted => "muted",
            SuppressReason::Malformed => "malformed",
        }
    }
}

/// Outcome of the classification table alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Suppress(SuppressReason),
    Notify {
        kind: NotificationKind,
        priority: Priority,
    },
}

/// Classify one delta. `attention_tools` are tool names that ask the human something.
pub fn classify(delta: &Delta, attention_tools: &[String]) -> Classification {
    if delta.session_id.is_empty() || delta.is_empty() {
        tracing::warn!(session_id = %delta.session_id, "Malformed delta suppressed");
        return Classification::Suppress(SuppressReason::Malformed);
    }
    if delta.backfill {
        return Classification::Suppress(SuppressReason::Backfill);
    }

    let mut candidates: Vec<(NotificationKind, Priority)> = Vec::with_capacity(2);
    let to = delta.transition.map(|t| t.to);

    if to == Some(SessionStatus::Failed) {
        candidates.push((NotificationKind::SessionFailed, Priority::High));
    }

    if let Some(message) = &delta.message {
        match message.kind {
            MessageKind::ToolInvocation => {
                let asks = message
                    .tool_name
                    .as_deref()
                    .is_some_and(|name| attention_tools.iter().any(|t| t == name));
                if asks {
                    candidates.push((NotificationKind::NeedsInput, Priority::High));
                }
            }
            MessageKind::ToolResult if message.is_error => {
                candidates.push((NotificationKind::ToolError, Priority::Normal));
            }
            _ => {}
        }
    }

    if to == Some(SessionStatus::Idle)
        && delta.last_message_kind == Some(MessageKind::AssistantText)
    {
        candidates.push((NotificationKind::WaitingForInput, Priority::Normal));
    }

    if to == Some(SessionStatus::Completed) {
        candidates.push((NotificationKind::SessionCompleted, Priority::Low));
    }

    if let Some(message) = &delta.message {
        let asks_question = message.kind == MessageKind::AssistantText
            && message
                .text
                .as_deref()
                .is_some_and(|t| t.trim_end().ends_with('?'));
        if asks_question {
            candidates.push((NotificationKind::Question, Priority::Low));
        }
    }

    // First of the highest priority
    candidates
        .into_iter()
        .min_by_key(|(_, priority)| std::cmp::Reverse(*priority))
        .map(|(kind, priority)| Classification::Notify { kind, priority })
        .unwrap_or(Classification::Suppress(SuppressReason::NeverNotify))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, SeqPos, StatusTransition, TransitionReason};
    use chrono::Utc;
    use std::path::PathBuf;

    fn attention() -> Vec<String> {
        vec!["AskUserQuestion".to_string()]
    }

    fn message(kind: MessageKind) -> Message {
        Message {
            event_id: "e".to_string(),
            session_id: "s".to_string(),
            kind,
            text: None,
            tool_name: None,
            tool_input: None,
            tool_use_id: None,
            is_error: false,
            correlates_to: None,
            seq: SeqPos::default(),
            timestamp: Utc::now(),
            source_path: PathBuf::from("/s.jsonl"),
        }
    }

    fn with_message(m: Message) -> Delta {
        let mut d = Delta::new("s", Utc::now());
        d.last_message_kind = Some(m.kind);
        d.message = Some(m);
        d
    }

    fn with_transition(from: SessionStatus, to: SessionStatus, last: Option<MessageKind>) -> Delta {
        let mut d = Delta::new("s", Utc::now());
        d.transition = Some(StatusTransition {
            from,
            to,
            reason: TransitionReason::QuietPeriod,
        });
        d.last_message_kind = last;
        d
    }

    fn notify(kind: NotificationKind, priority: Priority) -> Classification {
        Classification::Notify { kind, priority }
    }

    #[test]
    fn test_never_notify_rows() {
        let mut user = message(MessageKind::User);
        user.text = Some("please?".to_string());
        assert_eq!(
            classify(&with_message(user), &attention()),
            Classification::Suppress(SuppressReason::NeverNotify)
        );

        let mut bash = message(MessageKind::ToolInvocation);
        bash.tool_name = Some("Bash".to_string());
        assert_eq!(
            classify(&with_message(bash), &attention()),
            Classification::Suppress(SuppressReason::NeverNotify)
        );

        let idle_after_tool = with_transition(
            SessionStatus::Active,
            SessionStatus::Idle,
            Some(MessageKind::ToolResult),
        );
        assert_eq!(
            classify(&idle_after_tool, &attention()),
            Classification::Suppress(SuppressReason::NeverNotify)
        );

        let mut created = Delta::new("s", Utc::now());
        created.session_created = true;
        assert_eq!(
            classify(&created, &attention()),
            Classification::Suppress(SuppressReason::NeverNotify)
        );
    }

    #[test]
    fn test_notify_rows() {
        let mut ask = message(MessageKind::ToolInvocation);
        ask.tool_name = Some("AskUserQuestion".to_string());
        assert_eq!(
            classify(&with_message(ask), &attention()),
            notify(NotificationKind::NeedsInput, Priority::High)
        );

        let mut failed = message(MessageKind::ToolResult);
        failed.is_error = true;
        assert_eq!(
            classify(&with_message(failed), &attention()),
            notify(NotificationKind::ToolError, Priority::Normal)
        );

        let mut question = message(MessageKind::AssistantText);
        question.text = Some("Shall I continue?  ".to_string());
        assert_eq!(
            classify(&with_message(question), &attention()),
            notify(NotificationKind::Question, Priority::Low)
        );

        assert_eq!(
            classify(
                &with_transition(
                    SessionStatus::Active,
                    SessionStatus::Idle,
                    Some(MessageKind::AssistantText)
                ),
                &attention()
            ),
            notify(NotificationKind::WaitingForInput, Priority::Normal)
        );
        assert_eq!(
            classify(
                &with_transition(SessionStatus::Idle, SessionStatus::Completed, None),
                &attention()
            ),
            notify(NotificationKind::SessionCompleted, Priority::Low)
        );
    }

    #[test]
    fn test_highest_priority_facet_wins() {
        let mut delta = with_message(message(MessageKind::User));
        delta.transition = Some(StatusTransition {
            from: SessionStatus::Active,
            to: SessionStatus::Failed,
            reason: TransitionReason::TerminalError,
        });
        let mut question = message(MessageKind::AssistantText);
        question.text = Some("why?".to_string());
        delta.message = Some(question);

        assert_eq!(
            classify(&delta, &attention()),
            notify(NotificationKind::SessionFailed, Priority::High)
        );
    }

    #[test]
    fn test_backfill_and_malformed_are_suppressed() {
        let mut delta = with_transition(SessionStatus::Active, SessionStatus::Failed, None);
        delta.backfill = true;
        assert_eq!(
            classify(&delta, &attention()),
            Classification::Suppress(SuppressReason::Backfill)
        );

        let empty = Delta::new("s", Utc::now());
        assert_eq!(
            classify(&empty, &attention()),
            Classification::Suppress(SuppressReason::Malformed)
        );
    }
}
