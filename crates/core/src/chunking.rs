use crate::error::IngestError;
use crate::models::{ChunkDraft, ChunkStrategy};
use regex::Regex;

const PARAGRAPH_SEPARATOR: &str = "\n\n";
const PARAGRAPH_BOUNDARY: &str = r"\n[ \t]*\n";
const SENTENCE_TERMINATORS: [char; 8] = ['.', '!', '?', '。', '！', '？', '；', ';'];

// Ratios against target size, expressed in tenths for integer comparison.
const SPLIT_ABOVE_TENTHS: usize = 15;
const MERGE_BELOW_TENTHS: usize = 3;
const MERGE_CEILING_TENTHS: usize = 12;

const LENGTH_DISCONTINUITY_RATIO: usize = 3;
const LENGTH_DISCONTINUITY_MIN_CHARS: usize = 40;

const TRANSITION_MARKERS: &[&str] = &[
    "however",
    "in addition",
    "additionally",
    "furthermore",
    "moreover",
    "first",
    "firstly",
    "second",
    "secondly",
    "third",
    "thirdly",
    "finally",
    "in summary",
    "in conclusion",
    "to summarize",
    "to sum up",
    "on the other hand",
    "meanwhile",
    "therefore",
    "然而",
    "但是",
    "不过",
    "另外",
    "此外",
    "同时",
    "首先",
    "其次",
    "第一",
    "第二",
    "第三",
    "最后",
    "总之",
    "总的来说",
    "综上所述",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub target_size: usize,
    pub overlap: usize,
}

impl ChunkingConfig {
    pub fn new(target_size: usize, overlap: usize) -> Result<Self, IngestError> {
        if target_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "target size must be positive".to_string(),
            ));
        }
        if overlap >= target_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {overlap} must be smaller than target size {target_size}"
            )));
        }
        Ok(Self {
            target_size,
            overlap,
        })
    }
}

pub fn clean_text(raw: &str) -> String {
    let normalized = raw
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\u{a0}', " ");

    let mut cleaned = String::with_capacity(normalized.len());
    let mut pending_blank = false;

    for line in normalized.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            pending_blank = true;
            continue;
        }

        if !cleaned.is_empty() {
            cleaned.push_str(if pending_blank { PARAGRAPH_SEPARATOR } else { "\n" });
        }
        cleaned.push_str(&collapsed);
        pending_blank = false;
    }

    cleaned
}

pub fn chunk(
    text: &str,
    strategy: ChunkStrategy,
    target_size: usize,
    overlap: usize,
) -> Result<Vec<ChunkDraft>, IngestError> {
    let config = ChunkingConfig::new(target_size, overlap)?;

    let drafts = match strategy {
        ChunkStrategy::Recursive => into_drafts(sliding_window(text, config.target_size, config.overlap)),
        ChunkStrategy::Semantic => into_drafts(semantic_chunks(text, config)?),
        ChunkStrategy::ParentChild => parent_child_chunks(text, config)?,
    };

    Ok(drafts)
}

pub fn chunk_texts(
    text: &str,
    strategy: ChunkStrategy,
    target_size: usize,
    overlap: usize,
) -> Result<Vec<String>, IngestError> {
    Ok(chunk(text, strategy, target_size, overlap)?
        .into_iter()
        .map(|draft| draft.text)
        .collect())
}

pub fn sliding_window(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let size = size.max(1);
    let step = size.saturating_sub(overlap).max(1);

    let mut pieces = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        if !piece.trim().is_empty() {
            pieces.push(piece);
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }

    pieces
}

fn into_drafts(texts: Vec<String>) -> Vec<ChunkDraft> {
    texts
        .into_iter()
        .map(|text| ChunkDraft { text, parent: None })
        .collect()
}

fn semantic_chunks(text: &str, config: ChunkingConfig) -> Result<Vec<String>, IngestError> {
    let paragraphs = split_paragraphs(text)?;
    if paragraphs.len() < 2 {
        return Ok(sliding_window(text, config.target_size, config.overlap));
    }

    let mut buffer = ChunkBuffer::new(config.target_size);

    for paragraph in paragraphs {
        let paragraph_len = char_len(&paragraph);

        if paragraph_len > config.target_size {
            buffer.flush();
            for sentence in split_sentences(&paragraph) {
                let separator = sentence_separator(&sentence);
                buffer.push(sentence, separator);
            }
            buffer.flush();
            continue;
        }

        if buffer.has_content() && is_semantic_boundary(&paragraph, buffer.current_len, paragraph_len) {
            buffer.flush();
        }
        buffer.push(paragraph, PARAGRAPH_SEPARATOR);
    }

    Ok(adjust_sizes(buffer.finish(), config))
}

fn parent_child_chunks(text: &str, config: ChunkingConfig) -> Result<Vec<ChunkDraft>, IngestError> {
    let child_size = (config.target_size / 4).max(1);
    let child_overlap = (config.overlap / 4).min(child_size - 1);

    let mut drafts = Vec::new();
    for parent in semantic_chunks(text, config)? {
        let parent_position = drafts.len();
        let children = if char_len(&parent) > child_size {
            sliding_window(&parent, child_size, child_overlap)
        } else {
            Vec::new()
        };

        drafts.push(ChunkDraft {
            text: parent,
            parent: None,
        });
        drafts.extend(children.into_iter().map(|text| ChunkDraft {
            text,
            parent: Some(parent_position),
        }));
    }

    Ok(drafts)
}

/// Splits any chunk above 1.5x target with the sliding window, then merges
/// chunks below 0.3x target into a neighbour when the result stays within
/// 1.2x target.
fn adjust_sizes(chunks: Vec<String>, config: ChunkingConfig) -> Vec<String> {
    let target = config.target_size;

    let mut split = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if char_len(&chunk) * 10 > target * SPLIT_ABOVE_TENTHS {
            split.extend(sliding_window(&chunk, target, config.overlap));
        } else {
            split.push(chunk);
        }
    }

    let separator_len = char_len(PARAGRAPH_SEPARATOR);
    let mut merged: Vec<String> = Vec::with_capacity(split.len());
    for chunk in split {
        if let Some(previous) = merged.last_mut() {
            let previous_len = char_len(previous);
            let chunk_len = char_len(&chunk);
            let either_small = previous_len * 10 < target * MERGE_BELOW_TENTHS
                || chunk_len * 10 < target * MERGE_BELOW_TENTHS;
            let fits = (previous_len + separator_len + chunk_len) * 10 <= target * MERGE_CEILING_TENTHS;

            if either_small && fits {
                previous.push_str(PARAGRAPH_SEPARATOR);
                previous.push_str(&chunk);
                continue;
            }
        }
        merged.push(chunk);
    }

    merged
}

fn split_paragraphs(text: &str) -> Result<Vec<String>, IngestError> {
    let boundary = Regex::new(PARAGRAPH_BOUNDARY)?;
    Ok(boundary
        .split(text)
        .map(|paragraph| paragraph.trim().replace('\t', " "))
        .filter(|paragraph| !paragraph.is_empty())
        .collect())
}

fn split_sentences(paragraph: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for character in paragraph.chars() {
        current.push(character);
        if character == '\n' || SENTENCE_TERMINATORS.contains(&character) {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }

    sentences
}

fn sentence_separator(sentence: &str) -> &'static str {
    match sentence.chars().next() {
        Some(first) if !first.is_ascii() => "",
        _ => " ",
    }
}

fn is_semantic_boundary(next: &str, buffered_len: usize, next_len: usize) -> bool {
    starts_with_transition(next) || is_length_discontinuity(buffered_len, next_len)
}

fn starts_with_transition(paragraph: &str) -> bool {
    let lowered = paragraph.trim_start().to_lowercase();
    TRANSITION_MARKERS.iter().any(|marker| {
        let Some(rest) = lowered.strip_prefix(marker) else {
            return false;
        };
        if !marker.is_ascii() {
            return true;
        }
        rest.chars().next().map_or(true, |next| !next.is_alphanumeric())
    })
}

fn is_length_discontinuity(previous_len: usize, next_len: usize) -> bool {
    let shorter = previous_len.min(next_len);
    let longer = previous_len.max(next_len);
    shorter >= LENGTH_DISCONTINUITY_MIN_CHARS && longer >= shorter * LENGTH_DISCONTINUITY_RATIO
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

struct ChunkBuffer {
    target_size: usize,
    chunks: Vec<String>,
    current: String,
    current_len: usize,
}

impl ChunkBuffer {
    fn new(target_size: usize) -> Self {
        Self {
            target_size,
            chunks: Vec::new(),
            current: String::new(),
            current_len: 0,
        }
    }

    fn has_content(&self) -> bool {
        !self.current.is_empty()
    }

    fn push(&mut self, piece: String, separator: &str) {
        let piece_len = char_len(&piece);
        let separator_len = char_len(separator);

        if self.has_content() && self.current_len + separator_len + piece_len > self.target_size {
            self.flush();
        }

        if self.has_content() {
            self.current.push_str(separator);
            self.current_len += separator_len;
        }
        self.current.push_str(&piece);
        self.current_len += piece_len;
    }

    fn flush(&mut self) {
        if self.has_content() {
            self.chunks.push(std::mem::take(&mut self.current));
        }
        self.current_len = 0;
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn non_whitespace(text: &str) -> Vec<char> {
        text.chars().filter(|c| !c.is_whitespace()).collect()
    }

    fn is_subsequence(needle: &[char], haystack: &[char]) -> bool {
        let mut remaining = haystack.iter();
        needle
            .iter()
            .all(|wanted| remaining.by_ref().any(|candidate| candidate == wanted))
    }

    #[test]
    fn clean_text_keeps_paragraph_breaks() {
        let raw = "First  line\r\nsecond\tline\n\n\n\n  Next\u{a0}paragraph  ";
        assert_eq!(clean_text(raw), "First line\nsecond line\n\nNext paragraph");
    }

    #[test]
    fn rejects_invalid_config() {
        assert!(matches!(
            chunk("text", ChunkStrategy::Semantic, 0, 0),
            Err(IngestError::InvalidChunkConfig(_))
        ));
        assert!(matches!(
            chunk("text", ChunkStrategy::Recursive, 10, 10),
            Err(IngestError::InvalidChunkConfig(_))
        ));
    }

    #[test]
    fn sliding_window_overlaps_by_configured_amount() {
        let pieces = sliding_window("abcdefghij", 4, 1);
        assert_eq!(pieces, vec!["abcd", "defg", "ghij"]);
    }

    #[test]
    fn recursive_strategy_is_plain_window() {
        let text = "x".repeat(25);
        let chunks = chunk_texts(&text, ChunkStrategy::Recursive, 10, 2).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[test]
    fn semantic_without_blank_lines_falls_back_to_window() {
        let text = "a".repeat(120);
        let chunks = chunk_texts(&text, ChunkStrategy::Semantic, 50, 10).unwrap();
        assert_eq!(chunks, sliding_window(&text, 50, 10));
    }

    #[test]
    fn semantic_packs_small_paragraphs_together() {
        let text = "Alpha paragraph here.\n\nBeta paragraph here.\n\nGamma paragraph here.";
        let chunks = chunk_texts(text, ChunkStrategy::Semantic, 200, 20).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("Alpha") && chunks[0].contains("Gamma"));
    }

    #[test]
    fn transition_marker_starts_new_chunk() {
        let first = "Rust guarantees memory safety without a garbage collector in most programs.";
        let second = "Ownership rules are checked at compile time by the borrow checker itself.";
        let third = "However, unsafe blocks allow the programmer to opt out of some checks.";
        let fourth = "Those blocks are expected to uphold the same invariants manually always.";
        let text = format!("{first}\n\n{second}\n\n{third}\n\n{fourth}");

        let chunks = chunk_texts(&text, ChunkStrategy::Semantic, 200, 20).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].starts_with("However"));
    }

    #[test]
    fn transition_marker_requires_word_boundary() {
        assert!(starts_with_transition("First, install the toolchain."));
        assert!(starts_with_transition("然而，它也有一些挑战。"));
        assert!(!starts_with_transition("Firstborn children are listed here."));
        assert!(!starts_with_transition("Python is a language."));
    }

    #[test]
    fn length_discontinuity_needs_both_sides_substantial() {
        assert!(is_length_discontinuity(40, 130));
        assert!(!is_length_discontinuity(40, 100));
        assert!(!is_length_discontinuity(5, 300));
    }

    #[test]
    fn buffer_three_times_longer_than_next_paragraph_starts_new_chunk() {
        let paragraph = "a".repeat(350);
        let text = vec![paragraph; 8].join("\n\n");

        let lengths: Vec<usize> = chunk_texts(&text, ChunkStrategy::Semantic, 2000, 100)
            .unwrap()
            .iter()
            .map(|chunk| chunk.chars().count())
            .collect();
        // Three paragraphs fill 1054 chars, at least 3x the next one.
        assert_eq!(lengths, vec![1054, 1054, 702]);
    }

    #[test]
    fn oversized_paragraph_is_split_on_sentences() {
        let sentence = "This sentence is exactly long enough to matter. ";
        let long_paragraph = sentence.repeat(6);
        let text = format!("Intro paragraph that is short.\n\n{}", long_paragraph.trim());

        let chunks = chunk_texts(&text, ChunkStrategy::Semantic, 120, 10).unwrap();
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 180, "chunk too large: {chunk}");
        }
        assert!(chunks
            .iter()
            .skip(1)
            .all(|chunk| chunk.trim_end().ends_with('.')));
    }

    #[test]
    fn tiny_trailing_chunk_is_merged() {
        let body = "b".repeat(80);
        let text = format!("{body}\n\nend.");
        // 80 + 2 + 4 = 86 exceeds target 85, so the tail starts a new chunk and is merged back.
        let chunks = chunk_texts(&text, ChunkStrategy::Semantic, 85, 5).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].ends_with("end."));
    }

    #[test]
    fn parent_child_children_reference_their_parent() {
        let paragraph = "Parent context sentence that carries meaning. ".repeat(3);
        let text = format!("{}\n\n{}", paragraph.trim(), paragraph.trim());

        let drafts = chunk(&text, ChunkStrategy::ParentChild, 200, 40).unwrap();
        let parents: Vec<usize> = drafts
            .iter()
            .enumerate()
            .filter(|(_, draft)| draft.parent.is_none())
            .map(|(position, _)| position)
            .collect();

        assert!(!parents.is_empty());
        for (position, draft) in drafts.iter().enumerate() {
            if let Some(parent) = draft.parent {
                assert!(parents.contains(&parent));
                assert!(parent < position);
                assert!(draft.text.chars().count() <= 50);
                assert!(drafts[parent].text.contains(draft.text.trim()));
            }
        }
    }

    #[test]
    fn chinese_text_uses_character_lengths() {
        let text = "首先，我们介绍背景。\n\n其次，我们讨论方法。\n\n最后，我们总结结论。";
        let chunks = chunk_texts(text, ChunkStrategy::Semantic, 30, 5).unwrap();
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 45);
        }
    }

    fn text_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec("[A-Za-z]{1,12}[ ,.!?]{0,2}|\n\n|\n|However, |首先，", 0..120)
            .prop_map(|parts| parts.concat())
    }

    fn strategy_choice() -> impl Strategy<Value = ChunkStrategy> {
        prop_oneof![
            Just(ChunkStrategy::Semantic),
            Just(ChunkStrategy::Recursive),
            Just(ChunkStrategy::ParentChild),
        ]
    }

    proptest! {
        #[test]
        fn chunking_is_deterministic(
            text in text_strategy(),
            strategy in strategy_choice(),
            target in 20usize..200,
            overlap_percent in 0usize..50,
        ) {
            let overlap = target * overlap_percent / 100;
            let first = chunk(&text, strategy, target, overlap).unwrap();
            let second = chunk(&text, strategy, target, overlap).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn chunks_cover_the_input(
            text in text_strategy(),
            strategy in strategy_choice(),
            target in 20usize..200,
            overlap_percent in 0usize..50,
        ) {
            let overlap = target * overlap_percent / 100;
            let chunks = chunk_texts(&text, strategy, target, overlap).unwrap();
            let joined = non_whitespace(&chunks.concat());
            prop_assert!(is_subsequence(&non_whitespace(&text), &joined));
        }

        #[test]
        fn no_chunk_exceeds_one_and_a_half_targets(
            text in text_strategy(),
            strategy in strategy_choice(),
            target in 20usize..200,
            overlap_percent in 0usize..50,
        ) {
            let overlap = target * overlap_percent / 100;
            for piece in chunk_texts(&text, strategy, target, overlap).unwrap() {
                prop_assert!(piece.chars().count() * 2 <= target * 3);
            }
        }
    }
}
