use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

const HISTORY_CAPACITY: usize = 100;

/// A fact published by the turn loop / delegation / permission gate about a
/// session's lifecycle, for any interested subscriber (a progress renderer, a
/// parent watching a child, a future telemetry sink).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_key: String,
    pub kind: String,
    pub detail: String,
    pub timestamp_ms: i64,
}

impl SessionEvent {
    pub fn new(session_key: impl Into<String>, kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            kind: kind.into(),
            detail: detail.into(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

struct SessionChannel {
    history: VecDeque<SessionEvent>,
    subscribers: Vec<UnboundedSender<SessionEvent>>,
}

impl SessionChannel {
    fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            subscribers: Vec::new(),
        }
    }

    fn push_history(&mut self, event: SessionEvent) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(event);
    }
}

/// Per-session publish/subscribe event bus with bounded replay-on-subscribe history.
/// A late subscriber sees the last [`HISTORY_CAPACITY`] events for its session before
/// any live ones, so a progress view attached mid-delegation isn't blind to what
/// already happened.
pub struct EventBus {
    sessions: Mutex<HashMap<String, SessionChannel>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn publish(&self, event: SessionEvent) {
        let mut sessions = self.sessions.lock().unwrap();
        let session_key = event.session_key.clone();
        let is_done = event.kind == "agent_done";
        let channel = sessions
            .entry(session_key.clone())
            .or_insert_with(SessionChannel::new);

        channel.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        channel.push_history(event);

        if is_done {
            // Every subscriber has now seen the terminal event for this session —
            // drop their senders so the receiving streams end, then drop the
            // session entry itself since no subscriber remains.
            channel.subscribers.clear();
            sessions.remove(&session_key);
        }
    }

    /// Subscribe to a session, receiving its replayed history immediately followed
    /// by live events.
    pub fn subscribe(&self, session_key: &str) -> UnboundedReceiver<SessionEvent> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut sessions = self.sessions.lock().unwrap();
        let channel = sessions
            .entry(session_key.to_string())
            .or_insert_with(SessionChannel::new);

        for event in &channel.history {
            let _ = tx.send(event.clone());
        }
        channel.subscribers.push(tx);
        rx
    }

    /// Drop a session's history and subscriber list. Called once a session (and any
    /// children) are fully torn down.
    pub fn cleanup_session(&self, session_key: &str) {
        self.sessions.lock().unwrap().remove(session_key);
    }

    pub fn history(&self, session_key: &str) -> Vec<SessionEvent> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_key)
            .map(|c| c.history.iter().cloned().collect())
            .unwrap_or_default()
    }
}
