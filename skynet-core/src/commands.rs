//! Commands accepted from UI and bot layers
//!
//! Readers never touch pipeline state directly. They enqueue a [`Command`]
//! and the pipeline task applies it between intake items.

use crate::error::{Error, Result};
use tokio::sync::mpsc;

/// A request from outside the ingestion core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Continue a session with new user text. Handed to the launcher as is;
    /// the resulting lines arrive through the transcript like any other write.
    ContinueSession { session_id: String, text: String },
    /// Stop sending to a channel; held notifications are dropped
    MuteChannel { channel: String },
    UnmuteChannel { channel: String },
}

/// Sending side of the command queue; cheap to clone
#[derive(Debug, Clone)]
pub struct CommandQueue {
    sender: mpsc::Sender<Command>,
}

impl CommandQueue {
    /// A bounded queue and its receiving end
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Enqueue, waiting for room
    pub async fn send(&self, command: Command) -> Result<()> {
        self.sender.send(command).await.map_err(|_| Error::Shutdown)
    }

    /// Enqueue without waiting; fails when the queue is full or closed
    pub fn try_send(&self, command: Command) -> Result<()> {
        self.sender.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull("command"),
            mpsc::error::TrySendError::Closed(_) => Error::Shutdown,
        })
    }
}

/// A continue-session request resolved against the store, for the launcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub session_id: String,
    pub text: String,
    /// Working directory the session ran in, when known
    pub cwd: Option<String>,
}

/// Substitute `{session_id}` and `{text}` in launcher arguments
pub fn render_args(template: &[String], session_id: &str, text: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{session_id}", session_id)
                .replace("{text}", text)
        })
        .collect()
}
