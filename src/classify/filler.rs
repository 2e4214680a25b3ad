//! Backchannel ("filler") detection
//!
//! A fragment is filler-only when every normalized piece of it can be built
//! entirely from lexicon entries and the total number of entries used stays
//! within `max_tokens`. "うんうん" is two tokens of "うん".

use super::normalize::{normalize, segment_spans, segments};

/// Judges whether a transcript fragment is a meaningless backchannel utterance
#[derive(Debug, Clone)]
pub struct FillerClassifier {
    /// Normalized lexicon entries as char vectors, longest first
    lexicon: Vec<Vec<char>>,
    max_tokens: usize,
}

impl FillerClassifier {
    pub fn new<S: AsRef<str>>(lexicon: &[S], max_tokens: usize) -> Self {
        let mut entries: Vec<Vec<char>> = lexicon
            .iter()
            .map(|w| normalize(w.as_ref()))
            .filter(|w| !w.is_empty())
            .map(|w| w.chars().collect())
            .collect();
        entries.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        entries.dedup();

        Self {
            lexicon: entries,
            max_tokens,
        }
    }

    /// Number of lexicon tokens needed to spell the fragment, or `None` if
    /// some part of it is not drawn from the lexicon.
    pub fn token_count(&self, text: &str) -> Option<usize> {
        segments(text)
            .iter()
            .map(|segment| self.segment_tokens(segment))
            .sum()
    }

    /// True if the fragment carries no substantive content.
    ///
    /// Empty fragments count as filler.
    pub fn is_filler(&self, text: &str) -> bool {
        matches!(self.token_count(text), Some(n) if n <= self.max_tokens)
    }

    /// Drop trailing pieces spelled only from lexicon entries.
    ///
    /// "元気です、うん" becomes "元気です". Filler followed by content is
    /// kept, and text without trailing filler is returned unchanged.
    pub fn strip_trailing<'a>(&self, text: &'a str) -> &'a str {
        let spans = segment_spans(text);
        let last_content = spans.iter().rposition(|&(start, end)| {
            let piece = normalize(&text[start..end]);
            !piece.is_empty() && self.segment_tokens(&piece).is_none()
        });

        match last_content {
            Some(i) if i + 1 == spans.len() => text,
            Some(i) => &text[..spans[i].1],
            None => "",
        }
    }

    /// Minimum number of lexicon entries that exactly cover `segment`
    fn segment_tokens(&self, segment: &str) -> Option<usize> {
        let chars: Vec<char> = segment.chars().collect();
        let mut best: Vec<Option<usize>> = vec![None; chars.len() + 1];
        best[0] = Some(0);

        for start in 0..chars.len() {
            let Some(used) = best[start] else {
                continue;
            };
            for entry in &self.lexicon {
                let end = start + entry.len();
                if end <= chars.len() && chars[start..end] == entry[..] {
                    let candidate = used + 1;
                    if best[end].map_or(true, |b| candidate < b) {
                        best[end] = Some(candidate);
                    }
                }
            }
        }

        best[chars.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> FillerClassifier {
        FillerClassifier::new(&["うん", "はい", "ええ", "あー", "へえ", "uh"], 3)
    }

    #[test]
    fn single_interjection_is_filler() {
        let c = classifier();
        assert!(c.is_filler("うん"));
        assert!(c.is_filler("ウン"));
        assert!(c.is_filler(" はい。"));
    }

    #[test]
    fn repeated_interjections_count_each_token() {
        let c = classifier();
        assert_eq!(c.token_count("うんうん"), Some(2));
        assert_eq!(c.token_count("うん、はい"), Some(2));
        assert!(c.is_filler("うんうん"));
    }

    #[test]
    fn too_many_tokens_is_not_filler() {
        let c = classifier();
        assert_eq!(c.token_count("うんうんうんうん"), Some(4));
        assert!(!c.is_filler("うんうんうんうん"));
    }

    #[test]
    fn substantive_content_is_not_filler() {
        let c = classifier();
        assert_eq!(c.token_count("うん、元気です"), None);
        assert!(!c.is_filler("うん、元気です"));
        assert!(!c.is_filler("こんにちは"));
    }

    #[test]
    fn trailing_filler_is_stripped() {
        let c = classifier();
        assert_eq!(c.strip_trailing("元気です、うん"), "元気です");
        assert_eq!(c.strip_trailing("元気です。うん、はい。"), "元気です");
        assert_eq!(c.strip_trailing("うん、元気です"), "うん、元気です");
        assert_eq!(c.strip_trailing("元気です。"), "元気です。");
        assert_eq!(c.strip_trailing("うん"), "");
    }

    #[test]
    fn empty_fragment_is_filler() {
        let c = classifier();
        assert_eq!(c.token_count(""), Some(0));
        assert!(c.is_filler("  、 "));
    }

    #[test]
    fn empty_lexicon_never_matches_content() {
        let c = FillerClassifier::new::<&str>(&[], 3);
        assert!(!c.is_filler("うん"));
    }

    #[test]
    fn latin_fillers_are_case_insensitive() {
        let c = classifier();
        assert!(c.is_filler("Uh"));
        assert!(c.is_filler("uh uh"));
    }
}
