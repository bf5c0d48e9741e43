//! Rolling chat history.

use crate::message::ChatMessage;

/// Fixed-capacity circular buffer that overwrites its oldest entry when
/// full. One spare slot keeps "full" distinguishable from "empty", so
/// `oldest == next` always means empty.
#[derive(Debug, Clone)]
pub struct ChatHistory {
    slots: Vec<Option<ChatMessage>>,
    oldest: usize,
    next: usize,
}

impl ChatHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity + 1],
            oldest: 0,
            next: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn len(&self) -> usize {
        (self.next + self.slots.len() - self.oldest) % self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oldest == self.next
    }

    pub fn push(&mut self, msg: ChatMessage) {
        if self.capacity() == 0 {
            return;
        }
        self.slots[self.next] = Some(msg);
        self.next = self.advance(self.next);
        if self.next == self.oldest {
            self.slots[self.oldest] = None;
            self.oldest = self.advance(self.oldest);
        }
    }

    /// Messages from oldest to newest.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.len());
        let mut cursor = self.oldest;
        while cursor != self.next {
            if let Some(msg) = &self.slots[cursor] {
                out.push(msg.clone());
            }
            cursor = self.advance(cursor);
        }
        out
    }

    fn advance(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }
}
