/// Draft of the message being composed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MessageInput {
    draft: String,
}

impl MessageInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, draft: impl Into<String>) {
        self.draft = draft.into();
    }

    pub fn clear(&mut self) {
        self.draft.clear();
    }

    pub fn is_blank(&self) -> bool {
        self.draft.trim().is_empty()
    }

    /// Text to send for the current draft.
    pub fn prepared(&self) -> &str {
        // A trailing newline comes from the enter key, not from the author.
        self.draft.strip_suffix('\n').unwrap_or(&self.draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_detection_ignores_whitespace() {
        let mut input = MessageInput::new();
        input.set_draft("  \n\t");
        assert!(input.is_blank());
        input.set_draft(" x ");
        assert!(!input.is_blank());
    }

    #[test]
    fn prepared_text_drops_the_enter_newline_only() {
        let mut input = MessageInput::new();
        input.set_draft("line one\nline two\n");
        assert_eq!(input.prepared(), "line one\nline two");
        input.clear();
        assert_eq!(input.draft(), "");
    }
}
