//! Default line-window chunker.
//!
//! Used when the host does not plug in a language-aware [`Chunker`]. Content
//! is cut into windows of `window_lines` lines, each window starting
//! `window_lines - overlap` lines after the previous one. Chunk ids combine
//! the repository, the path, the line range and a short content hash, so an
//! edited window gets a new id and the old one can be tombstoned.

use bridge_traits::{BridgeError, Chunker, WriteJob};

use crate::repository::content_hash;

pub const DEFAULT_WINDOW_LINES: usize = 40;
pub const DEFAULT_OVERLAP_LINES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineWindowChunker {
    window_lines: usize,
    overlap: usize,
}

impl LineWindowChunker {
    /// # Errors
    ///
    /// `BridgeError::InvalidInput` when the window is empty or the overlap
    /// is not smaller than the window.
    pub fn new(window_lines: usize, overlap: usize) -> bridge_traits::Result<Self> {
        if window_lines == 0 || overlap >= window_lines {
            return Err(BridgeError::InvalidInput(format!(
                "window of {} lines with overlap {} cannot advance",
                window_lines, overlap
            )));
        }
        Ok(Self {
            window_lines,
            overlap,
        })
    }

    pub fn window_lines(&self) -> usize {
        self.window_lines
    }
}

impl Default for LineWindowChunker {
    fn default() -> Self {
        Self {
            window_lines: DEFAULT_WINDOW_LINES,
            overlap: DEFAULT_OVERLAP_LINES,
        }
    }
}

impl Chunker for LineWindowChunker {
    fn chunk(&self, content: &str, path: &str, repository: &str) -> bridge_traits::Result<Vec<WriteJob>> {
        if content.contains('\0') {
            return Err(BridgeError::InvalidInput(format!("{} looks binary", path)));
        }

        let lines: Vec<&str> = content.lines().collect();
        if lines.iter().all(|l| l.trim().is_empty()) {
            return Ok(Vec::new());
        }

        let language = language_for(path);
        let step = self.window_lines - self.overlap;
        let mut jobs = Vec::new();
        let mut start = 0;

        while start < lines.len() {
            let end = (start + self.window_lines).min(lines.len());
            let text = lines[start..end].join("\n");
            let hash = content_hash(text.as_bytes());
            // 1-based inclusive line numbers
            let (first, last) = (start + 1, end);
            let id = format!("{}:{}:{}-{}:{}", repository, path, first, last, &hash[..8]);

            jobs.push(
                WriteJob::upsert(id, text, repository, path)
                    .with_metadata("language", language)
                    .with_metadata("start_line", first as u64)
                    .with_metadata("end_line", last as u64)
                    .with_metadata("chunk_type", "window")
                    .with_metadata("sha256", hash),
            );

            if end == lines.len() {
                break;
            }
            start += step;
        }

        Ok(jobs)
    }
}

fn language_for(path: &str) -> &'static str {
    let name = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();
    if name == "dockerfile" {
        return "dockerfile";
    }
    if name == "makefile" {
        return "makefile";
    }
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("py" | "pyw") => "python",
        Some("js" | "jsx" | "mjs") => "javascript",
        Some("ts" | "tsx") => "typescript",
        Some("rs") => "rust",
        Some("go") => "go",
        Some("java") => "java",
        Some("c" | "h") => "c",
        Some("cpp" | "hpp") => "cpp",
        Some("md" | "rst" | "txt") => "text",
        Some("sh" | "bash" | "zsh" | "fish") => "shell",
        Some("yaml" | "yml" | "json" | "xml") => "config",
        _ => "unknown",
    }
}
