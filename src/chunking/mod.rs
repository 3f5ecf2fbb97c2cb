//! Markdown chunking strategies.
//!
//! The heading strategy (default) splits at Markdown headings and keeps the
//! enclosing heading attached to each chunk. The fixed/sliding/sentence
//! strategies delegate sizing to text-splitter and attach the nearest
//! preceding heading afterwards.

use text_splitter::ChunkConfig;
use text_splitter::MarkdownSplitter;
use text_splitter::TextSplitter;

use crate::config::ChunkingConfig;
use crate::error::NotebitErr;
use crate::error::Result;

/// A chunk of note text with its enclosing heading.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    pub content: String,
    /// Nearest enclosing heading text, empty for preamble chunks.
    pub heading: String,
}

/// Chunking strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkStrategy {
    /// Split at Markdown headings (default).
    #[default]
    Heading,
    /// Fixed-size chunks without overlap.
    Fixed,
    /// Fixed-size chunks with overlap.
    Sliding,
    /// Sentence-complete chunks within a size range.
    Sentence,
}

impl ChunkStrategy {
    /// Parse a strategy name from configuration.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "heading" => Ok(Self::Heading),
            "fixed" => Ok(Self::Fixed),
            "sliding" => Ok(Self::Sliding),
            "sentence" => Ok(Self::Sentence),
            other => Err(NotebitErr::Config {
                field: "chunking.strategy".to_string(),
                cause: format!("unknown strategy '{other}'"),
            }),
        }
    }
}

/// Document chunker configured from [`ChunkingConfig`].
#[derive(Debug, Clone)]
pub struct DocumentChunker {
    strategy: ChunkStrategy,
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_size: usize,
    max_chunk_size: usize,
}

impl DocumentChunker {
    /// Build a chunker from configuration.
    pub fn new(config: &ChunkingConfig) -> Result<Self> {
        Ok(Self {
            strategy: ChunkStrategy::parse(&config.strategy)?,
            chunk_size: config.chunk_size.max(1) as usize,
            chunk_overlap: config.chunk_overlap.max(0) as usize,
            min_chunk_size: config.min_chunk_size.max(1) as usize,
            max_chunk_size: config.max_chunk_size.max(config.chunk_size) as usize,
        })
    }

    /// Split note content into chunks.
    ///
    /// Whitespace-only content yields no chunks.
    pub fn chunk(&self, content: &str) -> Vec<ChunkSpan> {
        if content.trim().is_empty() {
            return Vec::new();
        }
        match self.strategy {
            ChunkStrategy::Heading => self.chunk_by_heading(content),
            ChunkStrategy::Fixed => self.chunk_with_splitter(content, 0, false),
            ChunkStrategy::Sliding => self.chunk_with_splitter(content, self.chunk_overlap, false),
            ChunkStrategy::Sentence => self.chunk_with_splitter(content, 0, true),
        }
    }

    /// Heading strategy: one chunk per heading section, oversize sections
    /// re-split with MarkdownSplitter, undersize sections merged backwards.
    fn chunk_by_heading(&self, content: &str) -> Vec<ChunkSpan> {
        let normalized = content.replace("\r\n", "\n");
        let mut sections: Vec<(String, String)> = Vec::new(); // (heading, body)
        let mut current_heading = String::new();
        let mut current_body = String::new();

        for line in normalized.lines() {
            if let Some(heading) = heading_text(line) {
                if !current_body.trim().is_empty() {
                    sections.push((current_heading.clone(), current_body.clone()));
                }
                current_heading = heading;
                current_body = String::new();
                current_body.push_str(line);
                current_body.push('\n');
            } else {
                current_body.push_str(line);
                current_body.push('\n');
            }
        }
        if !current_body.trim().is_empty() {
            sections.push((current_heading, current_body));
        }

        let mut spans: Vec<ChunkSpan> = Vec::new();
        for (heading, body) in sections {
            let body = body.trim_end().to_string();
            if body.chars().count() > self.max_chunk_size {
                let config = ChunkConfig::new(self.max_chunk_size);
                let splitter = MarkdownSplitter::new(config);
                for piece in splitter.chunks(&body) {
                    if !piece.trim().is_empty() {
                        spans.push(ChunkSpan {
                            content: piece.to_string(),
                            heading: heading.clone(),
                        });
                    }
                }
            } else if body.chars().count() < self.min_chunk_size && !spans.is_empty() {
                // Tiny section: fold into the previous chunk.
                let last = spans.last_mut().expect("non-empty");
                last.content.push_str("\n\n");
                last.content.push_str(&body);
            } else {
                spans.push(ChunkSpan {
                    content: body,
                    heading,
                });
            }
        }
        spans
    }

    /// Size-driven strategies, with heading attachment by byte offset.
    fn chunk_with_splitter(&self, content: &str, overlap: usize, sentence: bool) -> Vec<ChunkSpan> {
        let headings = heading_offsets(content);

        let pieces: Vec<(usize, String)> = if sentence {
            // A capacity range lets the splitter stop at sentence boundaries
            // once the minimum is reached.
            let config = ChunkConfig::new(self.min_chunk_size..self.chunk_size);
            let splitter = TextSplitter::new(config);
            splitter
                .chunk_indices(content)
                .map(|(offset, piece)| (offset, piece.to_string()))
                .collect()
        } else {
            let mut config = ChunkConfig::new(self.chunk_size);
            if overlap > 0 {
                match ChunkConfig::new(self.chunk_size).with_overlap(overlap) {
                    Ok(with_overlap) => config = with_overlap,
                    Err(e) => {
                        tracing::debug!(error = %e, "chunk overlap rejected, splitting without");
                    }
                }
            }
            let splitter = TextSplitter::new(config);
            splitter
                .chunk_indices(content)
                .map(|(offset, piece)| (offset, piece.to_string()))
                .collect()
        };

        pieces
            .into_iter()
            .filter(|(_, piece)| !piece.trim().is_empty())
            .map(|(offset, piece)| ChunkSpan {
                heading: nearest_heading(&headings, offset),
                content: piece,
            })
            .collect()
    }
}

/// Heading text of a Markdown heading line, `None` otherwise.
fn heading_text(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.starts_with(' ') && !rest.is_empty() {
        return None;
    }
    Some(rest.trim().to_string())
}

/// Byte offsets of all headings in the content.
fn heading_offsets(content: &str) -> Vec<(usize, String)> {
    let mut offsets = Vec::new();
    let mut pos = 0usize;
    for line in content.split_inclusive('\n') {
        if let Some(heading) = heading_text(line.trim_end_matches('\n')) {
            offsets.push((pos, heading));
        }
        pos += line.len();
    }
    offsets
}

/// Nearest heading at or before the given byte offset.
fn nearest_heading(headings: &[(usize, String)], offset: usize) -> String {
    headings
        .iter()
        .take_while(|(pos, _)| *pos <= offset)
        .last()
        .map(|(_, h)| h.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkingConfig;
    use pretty_assertions::assert_eq;

    fn chunker(strategy: &str) -> DocumentChunker {
        let config = ChunkingConfig {
            strategy: strategy.to_string(),
            chunk_size: 200,
            chunk_overlap: 40,
            min_chunk_size: 10,
            max_chunk_size: 400,
        };
        DocumentChunker::new(&config).unwrap()
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!(ChunkStrategy::parse("heading").unwrap(), ChunkStrategy::Heading);
        assert_eq!(ChunkStrategy::parse("fixed").unwrap(), ChunkStrategy::Fixed);
        assert_eq!(ChunkStrategy::parse("sliding").unwrap(), ChunkStrategy::Sliding);
        assert_eq!(ChunkStrategy::parse("sentence").unwrap(), ChunkStrategy::Sentence);
        assert!(ChunkStrategy::parse("ast").is_err());
    }

    #[test]
    fn test_empty_content_yields_no_chunks() {
        assert!(chunker("heading").chunk("").is_empty());
        assert!(chunker("fixed").chunk("   \n  ").is_empty());
    }

    #[test]
    fn test_heading_sections() {
        let content = "intro text before any heading\n\n\
                       # Alpha\nalpha body line one\nalpha body line two\n\n\
                       ## Beta\nbeta body with enough text here\n";
        let spans = chunker("heading").chunk(content);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].heading, "");
        assert!(spans[0].content.contains("intro text"));
        assert_eq!(spans[1].heading, "Alpha");
        assert!(spans[1].content.contains("alpha body line two"));
        assert_eq!(spans[2].heading, "Beta");
    }

    #[test]
    fn test_heading_tiny_section_merges_backwards() {
        let content = "# Alpha\nalpha body with plenty of text\n\n# B\nx\n";
        let spans = chunker("heading").chunk(content);
        // "# B\nx" is under min_chunk_size and folds into the Alpha chunk.
        assert_eq!(spans.len(), 1);
        assert!(spans[0].content.contains("# B"));
    }

    #[test]
    fn test_heading_oversize_section_splits() {
        let long_body = "paragraph sentence with words. ".repeat(40);
        let content = format!("# Long\n{long_body}");
        let spans = chunker("heading").chunk(&content);
        assert!(spans.len() > 1);
        for span in &spans {
            assert_eq!(span.heading, "Long");
            assert!(span.content.chars().count() <= 400);
        }
    }

    #[test]
    fn test_fixed_respects_chunk_size() {
        let content = "word ".repeat(200);
        let spans = chunker("fixed").chunk(&content);
        assert!(spans.len() > 1);
        for span in &spans {
            assert!(span.content.chars().count() <= 200);
        }
    }

    #[test]
    fn test_sliding_produces_at_least_fixed_count() {
        let content = "sentence with several words in it. ".repeat(30);
        let fixed = chunker("fixed").chunk(&content);
        let sliding = chunker("sliding").chunk(&content);
        assert!(sliding.len() >= fixed.len());
    }

    #[test]
    fn test_splitter_chunks_attach_nearest_heading() {
        let content = format!(
            "# First\n{}\n# Second\n{}",
            "alpha text. ".repeat(30),
            "beta text. ".repeat(30)
        );
        let spans = chunker("fixed").chunk(&content);
        assert!(spans.iter().any(|s| s.heading == "First"));
        assert!(spans.iter().any(|s| s.heading == "Second"));
    }

    #[test]
    fn test_sentence_chunks_within_bounds() {
        let content = "A short sentence. ".repeat(60);
        let spans = chunker("sentence").chunk(&content);
        assert!(!spans.is_empty());
        for span in &spans {
            assert!(span.content.chars().count() <= 200);
        }
    }

    #[test]
    fn test_heading_text_levels() {
        assert_eq!(heading_text("# One"), Some("One".to_string()));
        assert_eq!(heading_text("### Three"), Some("Three".to_string()));
        assert_eq!(heading_text("#NotAHeading"), None);
        assert_eq!(heading_text("plain"), None);
        assert_eq!(heading_text("####### seven"), None);
    }
}
