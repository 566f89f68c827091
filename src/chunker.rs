//! Token-budgeted document chunking.
//!
//! Splits document text into chunks that respect a token budget, preferring
//! syntactic boundaries: language-aware separators for code, paragraph and
//! sentence boundaries for prose. Consecutive chunks share an overlap tail
//! so that context spanning a boundary is embedded on both sides.
//!
//! Token length uses a fixed chars-per-token estimate so the split is
//! deterministic and needs no model download.

/// Target chunk size in tokens.
pub const CHUNK_SIZE: usize = 512;
/// Overlap carried from the previous chunk, in tokens.
pub const CHUNK_OVERLAP: usize = 64;
/// Documents below this token count are stored as a single chunk.
pub const MIN_TOKENS_FOR_CHUNKING: usize = 600;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Chunking parameters; defaults match the deployment constants.
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_tokens: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            chunk_overlap: CHUNK_OVERLAP,
            min_tokens: MIN_TOKENS_FOR_CHUNKING,
        }
    }
}

/// Deterministic token estimate.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split prose into chunks on paragraph/line/sentence boundaries.
///
/// Guarantees at least one chunk; no chunk exceeds ~2× the target size.
pub fn chunk_text(content: &str, opts: &ChunkOptions) -> Vec<String> {
    chunk_with_separators(content, TEXT_SEPARATORS, opts)
}

/// Split source code along syntactic boundaries selected by file extension.
///
/// Unsupported extensions fall back to [`chunk_text`].
pub fn chunk_code(content: &str, path: &str, opts: &ChunkOptions) -> Vec<String> {
    match language_for_path(path) {
        Some(language) => chunk_with_separators(content, separators_for(language), opts),
        None => chunk_text(content, opts),
    }
}

/// Map a file path to a known language identifier, by extension.
pub fn language_for_path(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    let language = match ext.as_str() {
        "rs" => "rust",
        "go" => "go",
        "py" => "python",
        "js" | "jsx" | "mjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "java" => "java",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" | "kts" => "kotlin",
        "scala" => "scala",
        "cs" => "csharp",
        "md" | "markdown" => "markdown",
        _ => return None,
    };
    Some(language)
}

/// Whether the path looks like source code (drives `chunk_code` dispatch).
pub fn is_code_path(path: &str) -> bool {
    matches!(language_for_path(path), Some(l) if l != "markdown")
}

const TEXT_SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " "];

fn separators_for(language: &str) -> &'static [&'static str] {
    match language {
        "rust" => &["\nfn ", "\npub fn ", "\nimpl ", "\nmod ", "\n\n", "\n", " "],
        "go" => &["\nfunc ", "\ntype ", "\nvar ", "\n\n", "\n", " "],
        "python" => &["\ndef ", "\nclass ", "\n\n", "\n", " "],
        "javascript" | "typescript" => {
            &["\nfunction ", "\nclass ", "\nconst ", "\nexport ", "\n\n", "\n", " "]
        }
        "java" | "csharp" => &["\npublic ", "\nprivate ", "\nclass ", "\n\n", "\n", " "],
        "c" | "cpp" => &["\nstatic ", "\nvoid ", "\nstruct ", "\n\n", "\n", " "],
        "ruby" => &["\ndef ", "\nclass ", "\nmodule ", "\n\n", "\n", " "],
        "php" => &["\nfunction ", "\nclass ", "\n\n", "\n", " "],
        "swift" | "kotlin" | "scala" => &["\nfunc ", "\nfun ", "\ndef ", "\nclass ", "\n\n", "\n", " "],
        "markdown" => &["\n## ", "\n# ", "\n### ", "\n\n", "\n", " "],
        _ => TEXT_SEPARATORS,
    }
}

fn chunk_with_separators(content: &str, separators: &[&str], opts: &ChunkOptions) -> Vec<String> {
    if estimate_tokens(content) < opts.min_tokens {
        return vec![content.to_string()];
    }

    let max_chars = opts.chunk_size * CHARS_PER_TOKEN;
    let units = split_recursive(content, separators, max_chars);
    merge_units(&units, opts)
}

/// Recursively split `text` until every unit fits `max_chars`.
///
/// Tries each separator in order; whatever still exceeds the budget is
/// re-split with the remaining separators, and finally hard-split on a
/// char boundary.
fn split_recursive(text: &str, separators: &[&str], max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        if text.trim().is_empty() {
            return Vec::new();
        }
        return vec![text.to_string()];
    }

    let Some((separator, rest)) = separators.split_first() else {
        return hard_split(text, max_chars);
    };

    let mut units = Vec::new();
    let mut pieces = text.split_inclusive(*separator).peekable();
    if pieces.peek().is_none() {
        return split_recursive(text, rest, max_chars);
    }
    for piece in pieces {
        if piece.chars().count() <= max_chars {
            if !piece.trim().is_empty() {
                units.push(piece.to_string());
            }
        } else {
            units.extend(split_recursive(piece, rest, max_chars));
        }
    }
    units
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    for ch in text.chars() {
        buf.push(ch);
        if buf.chars().count() >= max_chars {
            out.push(std::mem::take(&mut buf));
        }
    }
    if !buf.trim().is_empty() {
        out.push(buf);
    }
    out
}

/// Greedily accumulate units into chunks of at most `chunk_size` tokens,
/// carrying an overlap tail of up to `chunk_overlap` tokens forward.
fn merge_units(units: &[String], opts: &ChunkOptions) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buf = String::new();

    for unit in units {
        let would_be = estimate_tokens(&buf) + estimate_tokens(unit);
        if would_be > opts.chunk_size && !buf.is_empty() {
            let tail = overlap_tail(&buf, opts.chunk_overlap);
            chunks.push(std::mem::take(&mut buf));
            buf = tail;
        }
        buf.push_str(unit);
    }
    if !buf.trim().is_empty() {
        chunks.push(buf);
    }

    if chunks.is_empty() {
        chunks.push(units.concat());
    }
    chunks
}

/// Last ≤ `overlap_tokens` tokens of `chunk`, cut at a whitespace boundary.
fn overlap_tail(chunk: &str, overlap_tokens: usize) -> String {
    if overlap_tokens == 0 {
        return String::new();
    }
    let max_chars = overlap_tokens * CHARS_PER_TOKEN;
    let chars: Vec<char> = chunk.chars().collect();
    if chars.len() <= max_chars {
        return chunk.to_string();
    }
    let tail: String = chars[chars.len() - max_chars..].iter().collect();
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim_start().to_string(),
        None => tail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(size: usize, overlap: usize, min: usize) -> ChunkOptions {
        ChunkOptions {
            chunk_size: size,
            chunk_overlap: overlap,
            min_tokens: min,
        }
    }

    #[test]
    fn short_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", &ChunkOptions::default());
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn below_min_tokens_is_not_split() {
        // ~2000 chars = ~500 tokens, under the 600 gate
        let text = "word ".repeat(400);
        let chunks = chunk_text(&text, &ChunkOptions::default());
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn long_text_splits_with_coverage() {
        let text = (0..200)
            .map(|i| format!("Paragraph number {} talks about a topic.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let o = opts(64, 8, 32);
        let chunks = chunk_text(&text, &o);
        assert!(chunks.len() > 1);
        // Every paragraph appears in some chunk.
        for i in 0..200 {
            let needle = format!("Paragraph number {} ", i);
            assert!(
                chunks.iter().any(|c| c.contains(&needle)),
                "missing paragraph {}",
                i
            );
        }
    }

    #[test]
    fn no_chunk_exceeds_twice_the_budget() {
        let text = "token ".repeat(5000);
        let o = opts(64, 8, 32);
        for chunk in chunk_text(&text, &o) {
            assert!(
                estimate_tokens(&chunk) <= o.chunk_size * 2,
                "chunk too large: {} tokens",
                estimate_tokens(&chunk)
            );
        }
    }

    #[test]
    fn chunks_overlap() {
        let text = (0..100)
            .map(|i| format!("Sentence number {} in a long report.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let o = opts(48, 12, 16);
        let chunks = chunk_text(&text, &o);
        assert!(chunks.len() > 1);
        // Tail of chunk N reappears at the head of chunk N+1.
        let tail: String = chunks[0]
            .chars()
            .skip(chunks[0].chars().count().saturating_sub(16))
            .collect();
        let tail = tail.trim();
        assert!(
            chunks[1].contains(tail),
            "no overlap between chunks: tail={:?}",
            tail
        );
    }

    #[test]
    fn code_splits_on_function_boundaries() {
        let code = (0..80)
            .map(|i| format!("fn handler_{}() {{\n    do_work({});\n}}\n", i, i))
            .collect::<Vec<_>>()
            .join("\n");
        let o = opts(64, 8, 32);
        let chunks = chunk_code(&code, "src/handlers.rs", &o);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(estimate_tokens(chunk) <= o.chunk_size * 2);
        }
    }

    #[test]
    fn unknown_extension_falls_back_to_text() {
        let text = "alpha beta ".repeat(600);
        let o = opts(64, 8, 32);
        let code = chunk_code(&text, "notes.xyz", &o);
        let prose = chunk_text(&text, &o);
        assert_eq!(code, prose);
    }

    #[test]
    fn language_mapping() {
        assert_eq!(language_for_path("a/b/mod.rs"), Some("rust"));
        assert_eq!(language_for_path("x.tsx"), Some("typescript"));
        assert_eq!(language_for_path("README.md"), Some("markdown"));
        assert_eq!(language_for_path("archive.bin"), None);
        assert!(is_code_path("main.go"));
        assert!(!is_code_path("README.md"));
    }

    #[test]
    fn deterministic() {
        let text = "Alpha beta gamma. ".repeat(500);
        let o = opts(64, 8, 32);
        assert_eq!(chunk_text(&text, &o), chunk_text(&text, &o));
    }
}
