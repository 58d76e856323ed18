//! Chapter segmentation for extracted document text.
//!
//! A prioritized list of boundary patterns is tried in order; the first
//! pattern that matches more than once wins and the text is split at the
//! match start offsets. When no pattern matches more than once the text is
//! split into fixed-size overlapping character windows, so segmentation is
//! total: every input, including the empty string, yields at least one
//! chapter.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Boundary patterns in priority order. Earlier patterns win outright over
/// later ones regardless of match counts; order is load-bearing.
const BOUNDARY_PATTERNS: &[&str] = &[
    // CJK chapter markers: 第一章, 第12章, ...
    r"第[一二三四五六七八九十\d]+章",
    // English chapter markers, any case
    r"(?i)Chapter\s+\d+",
    // Uppercase variant, kept for priority fidelity with the pattern list
    r"CHAPTER\s+\d+",
    // Numbered list markers at line starts
    r"\n\d+\.",
    // Heading-like lines: starts with a capital, no sentence punctuation
    r"\n[A-Z][^.\n]*\n",
];

const MAX_TITLE_CHARS: usize = 100;
const TITLE_SCAN_LINES: usize = 3;

/// One logical segment of a source document.
///
/// `chapter_number` is positional (`1..=N` in document order), never parsed
/// from the marker text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterUnit {
    pub chapter_number: u32,
    pub title: String,
    pub content: String,
}

/// Splits raw document text into an ordered, non-empty chapter sequence.
pub struct Segmenter {
    patterns: Vec<Regex>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Segmenter {
    /// `chunk_size` and `chunk_overlap` drive the windowed fallback;
    /// `chunk_overlap` must be smaller than `chunk_size` (validated by
    /// `Settings`).
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let patterns = BOUNDARY_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("boundary pattern must compile"))
            .collect();
        Self {
            patterns,
            chunk_size,
            chunk_overlap,
        }
    }

    /// Split `text` into chapters. Total; always returns at least one unit.
    pub fn segment(&self, text: &str) -> Vec<ChapterUnit> {
        for (priority, pattern) in self.patterns.iter().enumerate() {
            let starts: Vec<usize> = pattern.find_iter(text).map(|m| m.start()).collect();
            if starts.len() > 1 {
                debug!(
                    pattern = BOUNDARY_PATTERNS[priority],
                    matches = starts.len(),
                    "Chapter boundary pattern matched"
                );
                let chapters = self.split_at_markers(text, &starts);
                info!(chapters = chapters.len(), "Segmented document by chapter markers");
                return chapters;
            }
        }

        let chapters = self.split_by_chunks(text);
        info!(
            chapters = chapters.len(),
            "No chapter structure detected, segmented document by chunks"
        );
        chapters
    }

    /// Split at marker start offsets. Text before the first marker belongs
    /// to no chapter.
    fn split_at_markers(&self, text: &str, starts: &[usize]) -> Vec<ChapterUnit> {
        starts
            .iter()
            .enumerate()
            .map(|(i, &start)| {
                let end = starts.get(i + 1).copied().unwrap_or(text.len());
                let content = text[start..end].trim();
                ChapterUnit {
                    chapter_number: (i + 1) as u32,
                    title: derive_title(content),
                    content: content.to_string(),
                }
            })
            .collect()
    }

    /// Fixed-size overlapping window split for unstructured text. Windows
    /// advance by `chunk_size - chunk_overlap` characters; the empty input
    /// yields exactly one window with empty content.
    fn split_by_chunks(&self, text: &str) -> Vec<ChapterUnit> {
        let chars: Vec<char> = text.chars().collect();
        let step = self.chunk_size - self.chunk_overlap;

        let mut chapters = Vec::new();
        let mut start = 0usize;
        loop {
            let end = (start + self.chunk_size).min(chars.len());
            let content: String = chars[start..end].iter().collect();
            chapters.push(ChapterUnit {
                chapter_number: (chapters.len() + 1) as u32,
                title: format!("Section {}", chapters.len() + 1),
                content: content.trim().to_string(),
            });
            if end >= chars.len() {
                break;
            }
            start += step;
        }
        chapters
    }
}

/// Derive a chapter title from its content: the first of the leading
/// non-empty lines that fits the title length cap, else the first non-empty
/// line truncated, else a placeholder.
fn derive_title(content: &str) -> String {
    let lines: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    for line in lines.iter().take(TITLE_SCAN_LINES) {
        if line.chars().count() < MAX_TITLE_CHARS {
            return line.to_string();
        }
    }

    if let Some(first) = lines.first() {
        let truncated: String = first.chars().take(MAX_TITLE_CHARS).collect();
        return format!("{truncated}...");
    }

    "Untitled Chapter".to_string()
}
