//! Fixed-length splitting of oversized messages.
//!
//! Boundaries never depend on content. Lengths are measured in bytes; a cut
//! that would land inside a multi-byte UTF-8 sequence moves back to the
//! previous character boundary so every segment stays valid text and no
//! segment exceeds `max_len` bytes.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk length must be greater than zero")]
    InvalidLength,
}

/// Split `text` into consecutive segments of at most `max_len` bytes.
///
/// Text that already fits is returned as a single borrowed segment.
pub fn chunk(text: &str, max_len: usize) -> Result<Vec<&str>, ChunkError> {
    if max_len == 0 {
        return Err(ChunkError::InvalidLength);
    }
    if text.len() <= max_len {
        return Ok(vec![text]);
    }

    let mut segments = Vec::with_capacity(text.len().div_ceil(max_len));
    let mut rest = text;
    while rest.len() > max_len {
        let mut cut = max_len;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        // A single character wider than `max_len` still has to go somewhere.
        if cut == 0 {
            cut = rest
                .char_indices()
                .nth(1)
                .map_or(rest.len(), |(idx, _)| idx);
        }
        let (head, tail) = rest.split_at(cut);
        segments.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        segments.push(rest);
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn zero_length_is_rejected() {
        assert_eq!(chunk("abc", 0), Err(ChunkError::InvalidLength));
    }

    #[rstest]
    #[case("", 4, vec![""])]
    #[case("abcd", 4, vec!["abcd"])]
    #[case("abcdefghij", 4, vec!["abcd", "efgh", "ij"])]
    #[case("abcdefgh", 4, vec!["abcd", "efgh"])]
    fn splits_at_fixed_offsets(
        #[case] text: &str,
        #[case] max_len: usize,
        #[case] expected: Vec<&str>,
    ) {
        assert_eq!(chunk(text, max_len).expect("valid length"), expected);
    }

    #[rstest]
    fn large_message_yields_ceiling_of_segments() {
        let text = "x".repeat(200_000);
        let segments = chunk(&text, 65_536).expect("valid length");
        assert_eq!(segments.len(), 4);
        assert!(segments.iter().all(|s| s.len() <= 65_536));
        assert_eq!(segments[3].len(), 200_000 - 3 * 65_536);
    }

    #[rstest]
    fn respects_character_boundaries() {
        let segments = chunk("aé€b", 2).expect("valid length");
        assert_eq!(segments, vec!["a", "é", "€", "b"]);
    }

    proptest! {
        #[test]
        fn concatenation_reproduces_input(text in ".{0,300}", max_len in 4usize..64) {
            let segments = chunk(&text, max_len).expect("valid length");
            prop_assert_eq!(segments.concat(), text.clone());
            prop_assert!(segments.iter().all(|s| s.len() <= max_len));
        }

        #[test]
        fn ascii_segments_are_full_except_last(text in "[a-z]{1,500}", max_len in 1usize..50) {
            let segments = chunk(&text, max_len).expect("valid length");
            prop_assert_eq!(segments.len(), text.len().div_ceil(max_len));
            let (last, full) = segments.split_last().expect("at least one segment");
            prop_assert!(full.iter().all(|s| s.len() == max_len));
            prop_assert!(!last.is_empty());
        }
    }
}
