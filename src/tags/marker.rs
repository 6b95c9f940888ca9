use memchr::memchr2;
use smallvec::SmallVec;

use super::ExtractionTags;

// Tag marker sets for the classification tracker.
//
// Every marker exists in a literal form (`<name>`) and in the JSON unicode
// escaped form some providers emit inside string payloads (`\u003cname\u003e`,
// either hex case). All forms of one marker begin with `<` or `\`, so a
// candidate position can be located with a single `memchr2` and the forms are
// compared side by side: a chunk boundary inside an escape sequence resolves
// exactly like one inside a literal tag.

const MARKER_FORMS: [(&str, &str); 3] = [
    ("<", ">"),
    ("\\u003c", "\\u003e"),
    ("\\u003C", "\\u003E"),
];

/// Outcome of comparing text at a candidate position against a [`MarkerSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerMatch {
    /// A marker matched completely; the value is its byte length.
    Full(usize),
    /// The text is a strict prefix of at least one marker; more input needed.
    Partial,
    /// No marker of the set starts here.
    Mismatch,
}

/// All lexical forms of one logical marker.
#[derive(Debug, Clone)]
pub struct MarkerSet {
    markers: SmallVec<[Box<[u8]>; 6]>,
}

impl MarkerSet {
    /// `<name>` in every form.
    #[must_use]
    pub fn opening(name: &str) -> Self {
        let markers = MARKER_FORMS
            .iter()
            .map(|(lt, gt)| format!("{lt}{name}{gt}").into_bytes().into_boxed_slice())
            .collect();
        Self { markers }
    }

    /// `</name>` and the self-closing `<name/>`, in every form.
    #[must_use]
    pub fn closing(name: &str) -> Self {
        let mut markers = SmallVec::new();
        for (lt, gt) in MARKER_FORMS {
            markers.push(format!("{lt}/{name}{gt}").into_bytes().into_boxed_slice());
            markers.push(format!("{lt}{name}/{gt}").into_bytes().into_boxed_slice());
        }
        Self { markers }
    }

    /// Compare `hay` (starting at a candidate position) against every form.
    ///
    /// A full match wins over a partial one; `Partial` is only reported when
    /// `hay` ends before any form can be decided.
    #[must_use]
    pub fn match_at(&self, hay: &[u8]) -> MarkerMatch {
        let mut partial = false;
        for marker in &self.markers {
            if hay.len() >= marker.len() {
                if hay.starts_with(marker) {
                    return MarkerMatch::Full(marker.len());
                }
            } else if marker.starts_with(hay) {
                partial = true;
            }
        }
        if partial {
            MarkerMatch::Partial
        } else {
            MarkerMatch::Mismatch
        }
    }

    /// Length of the longest form; the pending buffer never reaches it.
    #[must_use]
    pub fn max_len(&self) -> usize {
        self.markers.iter().map(|m| m.len()).max().unwrap_or(0)
    }
}

/// Offset of the next byte that could begin a marker in any form.
#[inline]
#[must_use]
pub fn next_candidate(bytes: &[u8]) -> Option<usize> {
    memchr2(b'<', b'\\', bytes)
}

/// Precomputed marker sets for one [`ExtractionTags`] configuration.
///
/// Built once and shared by every tracker using the same tags.
#[derive(Debug, Clone)]
pub struct TagMarkers {
    tags: ExtractionTags,
    pub(crate) start_open: MarkerSet,
    pub(crate) start_close: MarkerSet,
    pub(crate) end_open: Option<MarkerSet>,
    pub(crate) end_close: Option<MarkerSet>,
}

impl TagMarkers {
    #[must_use]
    pub fn new(tags: ExtractionTags) -> Self {
        let start_open = MarkerSet::opening(tags.start());
        let start_close = MarkerSet::closing(tags.start());
        let end_open = tags.end().map(MarkerSet::opening);
        let end_close = tags.end().map(MarkerSet::closing);
        Self {
            tags,
            start_open,
            start_close,
            end_open,
            end_close,
        }
    }

    #[must_use]
    pub fn tags(&self) -> &ExtractionTags {
        &self.tags
    }

    /// Upper bound on the pending buffer of a tracker using these markers.
    #[must_use]
    pub fn max_pending(&self) -> usize {
        [
            Some(&self.start_open),
            Some(&self.start_close),
            self.end_open.as_ref(),
            self.end_close.as_ref(),
        ]
        .into_iter()
        .flatten()
        .map(MarkerSet::max_len)
        .max()
        .unwrap_or(0)
        .saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_matches_literal_and_escaped() {
        let set = MarkerSet::opening("think");
        assert_eq!(set.match_at(b"<think>rest"), MarkerMatch::Full(7));
        assert_eq!(set.match_at(b"\\u003cthink\\u003e"), MarkerMatch::Full(17));
        assert_eq!(set.match_at(b"\\u003Cthink\\u003E"), MarkerMatch::Full(17));
    }

    #[test]
    fn prefixes_are_partial_in_both_forms() {
        let set = MarkerSet::opening("think");
        assert_eq!(set.match_at(b"<thi"), MarkerMatch::Partial);
        assert_eq!(set.match_at(b"\\u00"), MarkerMatch::Partial);
        assert_eq!(set.match_at(b"\\u003cthink\\u0"), MarkerMatch::Partial);
        assert_eq!(set.match_at(b"\\"), MarkerMatch::Partial);
    }

    #[test]
    fn divergent_text_is_mismatch() {
        let set = MarkerSet::opening("think");
        assert_eq!(set.match_at(b"<thinking>"), MarkerMatch::Mismatch);
        assert_eq!(set.match_at(b"\\n"), MarkerMatch::Mismatch);
        assert_eq!(set.match_at(b"<b>"), MarkerMatch::Mismatch);
    }

    #[test]
    fn closing_accepts_self_closing_form() {
        let set = MarkerSet::closing("think");
        assert_eq!(set.match_at(b"</think>"), MarkerMatch::Full(8));
        assert_eq!(set.match_at(b"<think/>"), MarkerMatch::Full(8));
        assert_eq!(set.match_at(b"<thinking/>"), MarkerMatch::Mismatch);
        assert_eq!(set.match_at(b"<"), MarkerMatch::Partial);
    }

    #[test]
    fn max_pending_is_below_longest_marker() {
        let markers = TagMarkers::new(ExtractionTags::pair("think", "response").unwrap());
        // The escaped closing form of "response" is the longest marker.
        assert_eq!(markers.max_pending(), 6 + 1 + 8 + 6 - 1);
    }

    #[test]
    fn candidate_scan_finds_both_starts() {
        assert_eq!(next_candidate(b"abc<"), Some(3));
        assert_eq!(next_candidate(b"ab\\u"), Some(2));
        assert_eq!(next_candidate(b"plain"), None);
    }
}
