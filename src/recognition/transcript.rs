//! Transcript assembly for streaming recognition
//!
//! With dynamic correction enabled the service may revise its earlier
//! hypothesis. Each fragment is flagged:
//!
//! - **append**: add the words to the running transcript
//! - **replace**: the words supersede everything accumulated so far
//!
//! The running transcript is a pure function of the fragment sequence.

/// Recognized text attributed to one inbound message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TranscriptFragment {
    pub words: String,
    pub replace: bool,
    pub is_final: bool,
}

impl TranscriptFragment {
    pub fn append(words: impl Into<String>) -> Self {
        Self {
            words: words.into(),
            ..Default::default()
        }
    }

    pub fn replace(words: impl Into<String>) -> Self {
        Self {
            words: words.into(),
            replace: true,
            ..Default::default()
        }
    }

    pub fn into_final(mut self) -> Self {
        self.is_final = true;
        self
    }
}

/// Combine the accumulated transcript with one fragment
pub fn apply(accumulated: &str, fragment: &TranscriptFragment) -> String {
    if fragment.replace {
        fragment.words.clone()
    } else {
        let mut next = String::with_capacity(accumulated.len() + fragment.words.len());
        next.push_str(accumulated);
        next.push_str(&fragment.words);
        next
    }
}

/// Owns the transcript of one session
///
/// Single writer: only the session's inbound handler calls [`push`](Self::push).
#[derive(Debug, Clone, Default)]
pub struct TranscriptAssembler {
    text: String,
    fragment_count: u64,
    replace_count: u64,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a fragment and return the new transcript
    pub fn push(&mut self, fragment: &TranscriptFragment) -> &str {
        self.text = apply(&self.text, fragment);
        self.fragment_count += 1;
        if fragment.replace {
            self.replace_count += 1;
        }

        if self.fragment_count % 10 == 0 {
            log::debug!(
                "TranscriptAssembler: {} fragments ({} replacements), {} chars",
                self.fragment_count,
                self.replace_count,
                self.text.len()
            );
        }
        &self.text
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn fragment_count(&self) -> u64 {
        self.fragment_count
    }

    /// Hand over the transcript, leaving the assembler empty
    pub fn take(&mut self) -> String {
        self.fragment_count = 0;
        self.replace_count = 0;
        std::mem::take(&mut self.text)
    }
}
