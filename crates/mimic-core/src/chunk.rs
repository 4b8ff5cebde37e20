//! Section-aware document chunker.
//!
//! Splits a [`Document`] into [`Chunk`]s of at most `chunk_size` characters
//! (plus the carried-over overlap), keeping track of where each section's
//! text lands so a quote can later be traced back to its section link.
//!
//! # Algorithm
//!
//! 1. Walk sections in order, skipping blank ones.
//! 2. Split a section that alone exceeds `chunk_size` into pieces at the
//!    nearest whitespace boundary.
//! 3. Append pieces to the current buffer (sections joined by a blank line)
//!    until the next piece would not fit; then flush the buffer as a chunk.
//! 4. Every chunk after the first starts with the last `overlap_words`
//!    words of its predecessor.
//! 5. In mini-chunk mode each chunk is additionally split into
//!    `mini_chunk_size` windows that are embedded separately.
//!
//! # Example
//!
//! ```rust
//! use mimic_core::chunk::{chunk_document, ChunkingParams};
//! use mimic_core::models::{Document, DocumentSource, Section};
//!
//! let doc = Document {
//!     id: "d1".into(),
//!     sections: vec![Section::new("https://x", "The Eiffel Tower is in Paris.")],
//!     source: DocumentSource::Web,
//!     semantic_identifier: "Eiffel".into(),
//!     metadata: Default::default(),
//!     updated_at: None,
//! };
//! let chunks = chunk_document(&doc, &ChunkingParams::default());
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].source_links[&0], "https://x");
//! ```

use std::collections::BTreeMap;

use crate::models::{Chunk, Document};

const SECTION_SEPARATOR: &str = "\n\n";

/// Chunking tunables.
#[derive(Debug, Clone)]
pub struct ChunkingParams {
    /// Maximum characters of section text per chunk.
    pub chunk_size: usize,
    /// Words carried from the end of one chunk to the start of the next.
    pub overlap_words: usize,
    /// Maximum characters in a chunk's blurb.
    pub blurb_size: usize,
    pub mini_chunk_size: usize,
    pub enable_mini_chunks: bool,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            chunk_size: 8000,
            overlap_words: 5,
            blurb_size: 500,
            mini_chunk_size: 512,
            enable_mini_chunks: false,
        }
    }
}

/// Split one document into chunks. Blank documents produce no chunks.
pub fn chunk_document(doc: &Document, params: &ChunkingParams) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut buf = ChunkBuffer::default();

    for section in &doc.sections {
        let text = section.text.trim();
        if text.is_empty() {
            continue;
        }

        for (piece_index, piece) in split_at_whitespace(text, params.chunk_size)
            .into_iter()
            .enumerate()
        {
            let piece_chars = piece.chars().count();
            if buf.has_body && buf.body_chars + SECTION_SEPARATOR.len() + piece_chars > params.chunk_size
            {
                let overlap = tail_words(&buf.content, params.overlap_words);
                chunks.push(buf.finish(doc, chunks.len(), params));
                buf = ChunkBuffer::with_overlap(overlap);
            }
            buf.push_piece(piece, &section.link, piece_index > 0, params.blurb_size);
            buf.body_chars += piece_chars;
        }
    }

    if buf.has_body {
        chunks.push(buf.finish(doc, chunks.len(), params));
    }

    chunks
}

/// Split text into windows of at most `max_chars` characters, cutting at
/// the last whitespace inside each window where possible.
pub fn split_at_whitespace(text: &str, max_chars: usize) -> Vec<&str> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();
    let mut remaining = text.trim();

    while !remaining.is_empty() {
        let window_end = match remaining.char_indices().nth(max_chars) {
            Some((idx, _)) => idx,
            None => {
                pieces.push(remaining);
                break;
            }
        };
        let cut = remaining[..window_end]
            .rfind(char::is_whitespace)
            .filter(|&pos| pos > 0)
            .unwrap_or(window_end);
        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        remaining = remaining[cut..].trim_start();
    }

    pieces
}

/// Mini-chunk windows of a chunk's content; empty when the content fits in
/// a single window.
pub fn split_mini_chunks(content: &str, mini_chunk_size: usize) -> Vec<String> {
    let pieces = split_at_whitespace(content, mini_chunk_size);
    if pieces.len() <= 1 {
        return Vec::new();
    }
    pieces.into_iter().map(str::to_string).collect()
}

fn tail_words(text: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    let start = words.len().saturating_sub(n);
    words[start..].join(" ")
}

/// Leading `max_chars` of `text`, trimmed back to a word boundary.
fn make_blurb(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((idx, _)) => {
            let window = &text[..idx];
            let cut = window.rfind(char::is_whitespace).unwrap_or(idx);
            window[..cut].trim_end().to_string()
        }
    }
}

#[derive(Default)]
struct ChunkBuffer {
    content: String,
    source_links: BTreeMap<usize, String>,
    blurb: Option<String>,
    section_continuation: bool,
    has_body: bool,
    body_chars: usize,
}

impl ChunkBuffer {
    fn with_overlap(overlap: String) -> Self {
        let mut content = overlap;
        if !content.is_empty() {
            content.push(' ');
        }
        Self {
            content,
            ..Self::default()
        }
    }

    fn push_piece(&mut self, piece: &str, link: &str, continuation: bool, blurb_size: usize) {
        if self.has_body {
            self.content.push_str(SECTION_SEPARATOR);
            self.body_chars += SECTION_SEPARATOR.len();
            self.source_links.insert(self.content.len(), link.to_string());
        } else {
            // The first contribution also owns any overlap prefix.
            self.source_links.insert(0, link.to_string());
            self.blurb = Some(make_blurb(piece, blurb_size));
            self.section_continuation = continuation;
            self.has_body = true;
        }
        self.content.push_str(piece);
    }

    fn finish(self, doc: &Document, chunk_id: usize, params: &ChunkingParams) -> Chunk {
        let mini_chunks = if params.enable_mini_chunks {
            split_mini_chunks(&self.content, params.mini_chunk_size)
        } else {
            Vec::new()
        };
        Chunk {
            document_id: doc.id.clone(),
            chunk_id,
            content: self.content,
            blurb: self.blurb.unwrap_or_default(),
            source_links: self.source_links,
            section_continuation: self.section_continuation,
            source_type: doc.source,
            semantic_identifier: doc.semantic_identifier.clone(),
            metadata: doc.metadata.clone(),
            mini_chunks,
        }
    }
}
