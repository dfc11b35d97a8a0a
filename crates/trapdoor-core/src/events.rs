//! Engine event types and helpers.
//!
//! Callers that drive several tracees, or that want a log of everything the
//! engine did, subscribe to these events instead of diffing state after every
//! call. The engine publishes an event whenever it resumes a thread, reports a
//! stop, notices a thread appear or disappear, or lets go of a tracee.

use std::sync::mpsc;

use crate::types::{ProcessId, StopEvent, ThreadId};

/// Event emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent
{
    /// A classified stop was handed to the caller.
    Stopped
    {
        /// Tracee the stop belongs to
        pid: ProcessId,
        /// The stop itself
        event: StopEvent,
    },
    /// A thread was resumed (continued or stepped).
    Resumed
    {
        /// Tracee
        pid: ProcessId,
        /// Thread that was let go
        thread: ThreadId,
    },
    /// A new thread appeared and is being traced.
    ThreadCreated
    {
        /// Tracee
        pid: ProcessId,
        /// The new thread
        thread: ThreadId,
    },
    /// A non-leader thread exited.
    ThreadExited
    {
        /// Tracee
        pid: ProcessId,
        /// The thread that went away
        thread: ThreadId,
    },
    /// The engine stopped tracing a process.
    Detached
    {
        /// Former tracee
        pid: ProcessId,
    },
}

impl EngineEvent
{
    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::Stopped { pid, event } => format!("Process {pid}, {event}"),
            Self::Resumed { pid, thread } => format!("Process {pid}, thread {thread} resumed"),
            Self::ThreadCreated { pid, thread } => format!("Process {pid} created thread {thread}"),
            Self::ThreadExited { pid, thread } => format!("Process {pid}, thread {thread} exited"),
            Self::Detached { pid } => format!("Detached from process {pid}"),
        }
    }

    /// Tracee the event is about.
    #[must_use]
    pub const fn pid(&self) -> ProcessId
    {
        match *self {
            Self::Stopped { pid, .. }
            | Self::Resumed { pid, .. }
            | Self::ThreadCreated { pid, .. }
            | Self::ThreadExited { pid, .. }
            | Self::Detached { pid } => pid,
        }
    }
}

/// Sender side of the engine event channel.
pub type EngineEventSender = mpsc::Sender<EngineEvent>;
/// Receiver side of the engine event channel.
pub type EngineEventReceiver = mpsc::Receiver<EngineEvent>;

/// Create a new engine event channel.
#[must_use]
pub fn event_channel() -> (EngineEventSender, EngineEventReceiver)
{
    mpsc::channel()
}

/// Fan-out of engine events to every live subscriber
///
/// Subscribers whose receiver was dropped are pruned on the next publish.
#[derive(Debug, Default)]
pub struct EventHub
{
    senders: Vec<EngineEventSender>,
}

impl EventHub
{
    /// Add a subscriber.
    pub fn subscribe(&mut self) -> EngineEventReceiver
    {
        let (sender, receiver) = event_channel();
        self.senders.push(sender);
        receiver
    }

    /// Deliver `event` to every subscriber.
    pub fn publish(&mut self, event: &EngineEvent)
    {
        self.senders.retain(|sender| sender.send(event.clone()).is_ok());
    }

    /// Whether anybody is listening.
    #[must_use]
    pub fn has_subscribers(&self) -> bool
    {
        !self.senders.is_empty()
    }
}
