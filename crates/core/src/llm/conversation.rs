use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::ChatMessage;

pub const DEFAULT_MAX_HISTORY: usize = 10;

/// Per-session chat history, trimmed to the newest `max_history` messages.
#[derive(Debug)]
pub struct ConversationManager {
    max_history: usize,
    sessions: Mutex<HashMap<String, VecDeque<ChatMessage>>>,
}

impl Default for ConversationManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl ConversationManager {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub fn add_message(&self, session_id: &str, message: ChatMessage) {
        let mut sessions = self.lock();
        let history = sessions.entry(session_id.to_string()).or_default();
        history.push_back(message);
        while history.len() > self.max_history {
            history.pop_front();
        }
    }

    pub fn history(&self, session_id: &str) -> Vec<ChatMessage> {
        self.lock()
            .get(session_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, session_id: &str) -> bool {
        self.lock().remove(session_id).is_some()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<ChatMessage>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_newest_messages() {
        let manager = ConversationManager::new(3);
        for i in 0..5 {
            manager.add_message("s", ChatMessage::user(format!("m{i}")));
        }
        let history = manager.history("s");
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn sessions_are_isolated_and_clearable() {
        let manager = ConversationManager::default();
        manager.add_message("a", ChatMessage::user("hi"));
        manager.add_message("b", ChatMessage::assistant("hello"));
        assert_eq!(manager.session_ids(), vec!["a", "b"]);
        assert!(manager.clear("a"));
        assert!(manager.history("a").is_empty());
        assert_eq!(manager.history("b").len(), 1);
        assert!(!manager.clear("a"));
    }
}
