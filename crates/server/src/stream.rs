//! Incremental text emission helpers
//!
//! Generated bytes are only sent once they form complete UTF-8 code
//! points, and stop strings are matched both fully (ends generation) and
//! partially (suspends emission until the match resolves). All matching
//! works on raw bytes: the byte-level tokenizer can split a code point
//! across tokens, so the generation buffer is not always valid UTF-8.

/// Number of bytes at the end of `bytes` that form an incomplete UTF-8
/// sequence. 0 means the buffer ends on a code-point boundary.
pub fn incomplete_utf8_suffix(bytes: &[u8]) -> usize {
    // scan back over up to 3 continuation bytes to the lead byte
    let mut i = 0usize;
    for &b in bytes.iter().rev().take(4) {
        i += 1;
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = if b & 0xE0 == 0xC0 {
            2
        } else if b & 0xF0 == 0xE0 {
            3
        } else if b & 0xF8 == 0xF0 {
            4
        } else {
            return 0; // ASCII lead, boundary is clean
        };
        return if i < needed { i } else { 0 };
    }
    0
}

/// Where a partial stop word begins at the end of `text`: the longest
/// suffix of `text` that is a proper prefix of `word`
pub fn find_partial_stop(word: &[u8], text: &[u8]) -> Option<usize> {
    if word.is_empty() || text.is_empty() {
        return None;
    }
    let max_overlap = word.len().min(text.len());
    for overlap in (1..=max_overlap).rev() {
        if text[text.len() - overlap..] == word[..overlap] {
            return Some(text.len() - overlap);
        }
    }
    None
}

/// Earliest full occurrence of any stop word within the tail of `text`
/// that the last token could have completed
pub fn find_full_stop(
    stops: &[String],
    text: &[u8],
    last_token_len: usize,
) -> Option<(usize, String)> {
    let mut best: Option<(usize, String)> = None;
    for word in stops {
        let wb = word.as_bytes();
        if wb.is_empty() || wb.len() > text.len() {
            continue;
        }
        let from = text.len().saturating_sub(wb.len() + last_token_len);
        if let Some(pos) = text[from..].windows(wb.len()).position(|w| w == wb) {
            let abs = from + pos;
            if best.as_ref().map_or(true, |(b, _)| abs < *b) {
                best = Some((abs, word.clone()));
            }
        }
    }
    best
}

/// Earliest partial match of any stop word at the tail of `text`
pub fn find_any_partial_stop(stops: &[String], text: &[u8]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for word in stops {
        if let Some(pos) = find_partial_stop(word.as_bytes(), text) {
            if best.map_or(true, |b| pos < b) {
                best = Some(pos);
            }
        }
    }
    best
}
