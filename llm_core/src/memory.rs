//! Rolling conversation memory used as context for the next request.
use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::chat::{ChatMessage, Role};

pub const DEFAULT_MAX_MESSAGES: usize = 20;
pub const DEFAULT_CONTEXT_MESSAGES: usize = 10;

#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub message: ChatMessage,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChatMemory {
    entries: VecDeque<MemoryEntry>,
    max_messages: usize,
    context_messages: usize,
}

impl Default for ChatMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES, DEFAULT_CONTEXT_MESSAGES)
    }
}

impl ChatMemory {
    pub fn new(max_messages: usize, context_messages: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_messages),
            max_messages,
            context_messages: context_messages.min(max_messages),
        }
    }

    /// Record a completed exchange. The oldest messages fall off first.
    pub fn record_exchange(&mut self, user: &str, assistant: &str) {
        self.push(ChatMessage::user(user));
        self.push(ChatMessage::assistant(assistant));
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.entries.push_back(MemoryEntry {
            message,
            at: Utc::now(),
        });
        while self.entries.len() > self.max_messages {
            self.entries.pop_front();
        }
    }

    /// The most recent messages, oldest first.
    pub fn context(&self) -> Vec<ChatMessage> {
        let skip = self.entries.len().saturating_sub(self.context_messages);
        self.entries
            .iter()
            .skip(skip)
            .map(|e| e.message.clone())
            .collect()
    }

    /// System prompt, recent context, then the new user turn.
    pub fn request_messages(&self, system_prompt: &str, user: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.context_messages + 2);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(self.context());
        messages.push(ChatMessage::user(user));
        messages
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_user_message(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.message.role == Role::User)
            .map(|e| e.message.content.as_str())
    }
}

/// Instructions for spoken answers: short, plain, no markup.
pub fn system_prompt(assistant_name: &str) -> String {
    format!(
        "You are {assistant_name}, a voice assistant. Your replies are read aloud, \
         so answer in at most three short sentences of plain conversational text. \
         Do not use markdown, lists, tables, code blocks, emoji or URLs. \
         Write numbers the way they are usually spoken and do not cite sources."
    )
}
