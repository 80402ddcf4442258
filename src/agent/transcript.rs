use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Observation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub ordinal: usize,
}

/// Append-only conversation history.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>) -> &Message {
        let ordinal = self.messages.len();
        self.messages.push(Message {
            role,
            content: content.into(),
            ordinal,
        });
        &self.messages[ordinal]
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_with_role(&self, role: Role) -> Option<&Message> {
        self.messages.iter().rev().find(|message| message.role == role)
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}
