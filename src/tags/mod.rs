pub mod marker;
pub mod tracker;

use std::fmt;

use serde::Serialize;

use crate::error::TagError;

pub use tracker::TagStateTracker;

/// Tag names delimiting the reasoning and final-answer sections.
///
/// With only `start` set (single-tag mode) the closing `start` marker is the
/// boundary into the final answer. With `end` set (two-tag mode) the final
/// answer must be opened explicitly with `<end>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtractionTags {
    start: String,
    end: Option<String>,
}

pub const DEFAULT_START_TAG: &str = "think";

impl ExtractionTags {
    /// Build a tag pair, validating both names.
    ///
    /// # Errors
    ///
    /// Returns [`TagError`] when a name is empty, contains markup or escape
    /// characters, or when both names are identical.
    pub fn new(start: impl Into<String>, end: Option<String>) -> Result<Self, TagError> {
        let start = start.into();
        validate_tag_name(&start)?;
        if let Some(end) = end.as_deref() {
            validate_tag_name(end)?;
            if end == start {
                return Err(TagError::SameTags(start));
            }
        }
        Ok(Self { start, end })
    }

    /// Single-tag mode.
    ///
    /// # Errors
    ///
    /// Returns [`TagError`] when `start` is not a valid tag name.
    pub fn single(start: impl Into<String>) -> Result<Self, TagError> {
        Self::new(start, None)
    }

    /// Two-tag mode.
    ///
    /// # Errors
    ///
    /// Returns [`TagError`] when either name is invalid or both are equal.
    pub fn pair(start: impl Into<String>, end: impl Into<String>) -> Result<Self, TagError> {
        Self::new(start, Some(end.into()))
    }

    #[must_use]
    pub fn start(&self) -> &str {
        &self.start
    }

    #[must_use]
    pub fn end(&self) -> Option<&str> {
        self.end.as_deref()
    }

    #[must_use]
    pub fn is_two_tag(&self) -> bool {
        self.end.is_some()
    }
}

impl Default for ExtractionTags {
    fn default() -> Self {
        Self {
            start: DEFAULT_START_TAG.to_string(),
            end: None,
        }
    }
}

impl fmt::Display for ExtractionTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.end {
            Some(end) => write!(f, "<{}>…<{}>", self.start, end),
            None => write!(f, "<{}>", self.start),
        }
    }
}

fn validate_tag_name(name: &str) -> Result<(), TagError> {
    if name.is_empty() {
        return Err(TagError::Empty);
    }
    if let Some(found) = name
        .chars()
        .find(|c| matches!(c, '<' | '>' | '/' | '\\') || c.is_whitespace())
    {
        return Err(TagError::InvalidCharacter {
            name: name.to_string(),
            found,
        });
    }
    Ok(())
}

/// Classification state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassificationState {
    /// No tag confirmed yet.
    #[default]
    Start,
    /// Inside the reasoning section.
    Thinking,
    /// The stream never opened the reasoning tag; everything is plain content.
    NoThinking,
    /// Inside the final-answer section.
    Response,
    /// Between sections, or after the final answer closed. Nothing is emitted.
    Unknown,
}

impl fmt::Display for ClassificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassificationState::Start => write!(f, "START"),
            ClassificationState::Thinking => write!(f, "THINKING"),
            ClassificationState::NoThinking => write!(f, "NO_THINKING"),
            ClassificationState::Response => write!(f, "RESPONSE"),
            ClassificationState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Output of one [`TagStateTracker::update`] call.
///
/// Both text fields are `None` when the fragment was fully consumed by tag
/// matching. A fragment straddling the reasoning close may carry both; the
/// thinking text always precedes the response text in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassificationResult {
    pub state: ClassificationState,
    pub thinking: Option<String>,
    pub response: Option<String>,
}

impl ClassificationResult {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.thinking.is_none() && self.response.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_markup_in_tag_names() {
        assert_eq!(ExtractionTags::single(""), Err(TagError::Empty));
        assert!(matches!(
            ExtractionTags::single("<think>"),
            Err(TagError::InvalidCharacter { found: '<', .. })
        ));
        assert!(matches!(
            ExtractionTags::pair("think", "final answer"),
            Err(TagError::InvalidCharacter { found: ' ', .. })
        ));
        assert_eq!(
            ExtractionTags::pair("think", "think"),
            Err(TagError::SameTags("think".to_string()))
        );
    }

    #[test]
    fn default_is_single_think_tag() {
        let tags = ExtractionTags::default();
        assert_eq!(tags.start(), "think");
        assert!(!tags.is_two_tag());
        assert_eq!(tags.to_string(), "<think>");
    }

    #[test]
    fn state_serializes_screaming_snake() {
        let json = serde_json::to_string(&ClassificationState::NoThinking).unwrap();
        assert_eq!(json, "\"NO_THINKING\"");
        assert_eq!(ClassificationState::NoThinking.to_string(), "NO_THINKING");
    }
}
