use crate::llm::{Message, Role};

/// Fallback tokenizer: ~4 characters per token, minimum 1. Used for every model
/// until a real tokenizer table is wired in — good enough to size a trim budget.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

fn estimate_message_tokens(msg: &Message) -> usize {
    let mut total = 0;
    if let Some(ref c) = msg.content {
        total += estimate_tokens(c);
    }
    if let Some(ref r) = msg.reasoning_content {
        total += estimate_tokens(r);
    }
    if let Some(ref calls) = msg.tool_calls {
        for call in calls {
            total += estimate_tokens(&call.function.name);
            total += estimate_tokens(&call.function.arguments);
        }
    }
    total.max(1)
}

/// Sliding window over a session's message history, trimmed to fit a token and/or
/// message-count budget while preserving the pairing between an assistant's
/// tool_calls message and the tool-result messages that answer it — an LLM API
/// rejects a history with an orphaned tool result or an unanswered tool call.
pub struct ConversationMemory {
    system_prompt: Option<String>,
    messages: Vec<Message>,
    max_messages: Option<usize>,
    max_tokens: usize,
}

impl ConversationMemory {
    pub fn new(max_tokens: usize, max_messages: Option<usize>) -> Self {
        Self {
            system_prompt: None,
            messages: Vec::new(),
            max_messages,
            max_tokens,
        }
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = Some(prompt.into());
    }

    /// Appends `message`; a `role=system` message replaces the stored system
    /// prompt instead of entering the trimmable window, per §4.1 — the system
    /// message is never subject to trimming.
    pub fn add(&mut self, message: Message) {
        self.push(message);
        self.trim();
    }

    /// Appends every message, then trims once — used when loading a
    /// persisted session, so an over-budget history doesn't get trimmed
    /// message-by-message and split an assistant tool_calls message from the
    /// tool results still to be appended behind it.
    pub fn add_batch(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.push(message);
        }
        self.trim();
    }

    fn push(&mut self, message: Message) {
        if matches!(message.role, Role::System) {
            self.system_prompt = message.content;
        } else {
            self.messages.push(message);
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Messages ready to send to the provider: system prompt first, if any.
    pub fn get_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(ref sp) = self.system_prompt {
            out.push(Message::system(sp));
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    pub fn get_token_count(&self) -> usize {
        let mut total = self
            .system_prompt
            .as_deref()
            .map(estimate_tokens)
            .unwrap_or(0);
        total += self.messages.iter().map(estimate_message_tokens).sum::<usize>();
        total
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Three-step trim: soft message-count cap, then a minimal-removable-prefix
    /// loop against the token budget, then an orphan sweep. Trimming only ever
    /// removes from the front — the newest turn is never dropped to make room.
    fn trim(&mut self) {
        if let Some(max_messages) = self.max_messages {
            while self.messages.len() > max_messages {
                if !self.remove_minimal_prefix() {
                    break;
                }
            }
        }

        while self.get_token_count() > self.max_tokens && self.messages.len() > 1 {
            if !self.remove_minimal_prefix() {
                // The minimal removable prefix spans the whole window: stop and
                // tolerate the residual over-budget state rather than dropping
                // every remaining message.
                break;
            }
        }

        self.sweep_orphans();
    }

    /// Length of the minimal removable prefix per the spec's three cases:
    /// an assistant tool_calls message takes its trailing run of tool results
    /// with it; a leading tool result takes the whole leading run of tool
    /// results; anything else is a single message.
    fn minimal_prefix_len(&self) -> usize {
        match self.messages.first() {
            None => 0,
            Some(front) if front.tool_calls.is_some() => {
                let mut n = 1;
                while matches!(self.messages.get(n).map(|m| &m.role), Some(Role::Tool)) {
                    n += 1;
                }
                n
            }
            Some(front) if matches!(front.role, Role::Tool) => {
                let mut n = 0;
                while matches!(self.messages.get(n).map(|m| &m.role), Some(Role::Tool)) {
                    n += 1;
                }
                n
            }
            Some(_) => 1,
        }
    }

    /// Removes the minimal removable prefix (oldest message, plus any tool
    /// results it covers) and returns whether anything was dropped. Refuses to
    /// drop the prefix if it would consume the entire window (safety floor).
    fn remove_minimal_prefix(&mut self) -> bool {
        if self.messages.is_empty() {
            return false;
        }
        let prefix_len = self.minimal_prefix_len();
        if prefix_len >= self.messages.len() {
            return false;
        }
        self.messages.drain(0..prefix_len);
        true
    }

    /// Drops any tool-result message whose tool_call_id has no matching preceding
    /// assistant tool_calls entry left in the window.
    fn sweep_orphans(&mut self) {
        let mut known_ids = std::collections::HashSet::new();
        for msg in &self.messages {
            if let Some(ref calls) = msg.tool_calls {
                for call in calls {
                    known_ids.insert(call.id.clone());
                }
            }
        }
        self.messages.retain(|m| match (&m.role, &m.tool_call_id) {
            (Role::Tool, Some(id)) => known_ids.contains(id),
            _ => true,
        });
    }
}
