//! Text normalization shared by the filler and termination classifiers

/// Offset between the full-width ASCII block (U+FF01..U+FF5E) and ASCII
const FULLWIDTH_OFFSET: u32 = 0xFEE0;

/// Offset between katakana (U+30A1..U+30F6) and hiragana (U+3041..U+3096)
const KANA_OFFSET: u32 = 0x60;

/// Normalize a transcript fragment for comparison.
///
/// Drops whitespace and punctuation, folds full-width ASCII to ASCII,
/// katakana to hiragana, and lowercases everything else.
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(fold_width)
        .filter(|c| !is_separator(*c))
        .map(fold_kana)
        .flat_map(char::to_lowercase)
        .collect()
}

/// Split text on whitespace/punctuation and normalize each non-empty piece.
pub fn segments(text: &str) -> Vec<String> {
    text.split(|c: char| is_separator(fold_width(c)))
        .map(normalize)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Byte ranges of the raw pieces between separators, in order
pub(crate) fn segment_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        if is_separator(fold_width(c)) {
            if let Some(s) = start.take() {
                spans.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

fn is_separator(c: char) -> bool {
    c.is_whitespace()
        || c.is_ascii_punctuation()
        || matches!(
            c,
            '、' | '。'
                | '・'
                | '「'
                | '」'
                | '『'
                | '』'
                | '【'
                | '】'
                | '〈'
                | '〉'
                | '《'
                | '》'
                | '…'
                | '‥'
                | '〜'
                | '～'
                | '♪'
        )
}

fn fold_width(c: char) -> char {
    let code = c as u32;
    if (0xFF01..=0xFF5E).contains(&code) {
        char::from_u32(code - FULLWIDTH_OFFSET).unwrap_or(c)
    } else {
        c
    }
}

fn fold_kana(c: char) -> char {
    let code = c as u32;
    if (0x30A1..=0x30F6).contains(&code) {
        char::from_u32(code - KANA_OFFSET).unwrap_or(c)
    } else {
        c
    }
}
