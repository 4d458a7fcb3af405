//! Whole-file edit parsing
//!
//! The reference engine asks the model to reply with complete file contents:
//! a line naming the file, then a fenced block holding the new content.
//!
//! ````text
//! src/main.rs
//! ```rust
//! fn main() {}
//! ```
//! ````

use tracing::debug;

/// A complete replacement for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WholeFileEdit {
    pub path: String,
    pub content: String,
}

const FENCE: &str = "```";

/// Extract every whole-file edit from a model reply
///
/// A fenced block only counts when the nearest non-blank line above it looks
/// like a file path. Unterminated blocks are ignored.
pub fn parse_whole_file_edits(text: &str) -> Vec<WholeFileEdit> {
    debug!(len = text.len(), "parse_whole_file_edits: called");
    let lines: Vec<&str> = text.lines().collect();
    let mut edits = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if !lines[i].trim_start().starts_with(FENCE) {
            i += 1;
            continue;
        }

        let close = (i + 1..lines.len()).find(|&j| lines[j].trim() == FENCE);
        let Some(close) = close else {
            debug!(line = i, "parse_whole_file_edits: unterminated fence");
            break;
        };

        let path = lines[..i]
            .iter()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| clean_path(l));

        if let Some(path) = path {
            let mut content = lines[i + 1..close].join("\n");
            if close > i + 1 {
                content.push('\n');
            }
            debug!(%path, "parse_whole_file_edits: found edit");
            edits.push(WholeFileEdit { path, content });
        }

        i = close + 1;
    }

    edits
}

/// Strip markdown decoration and accept the line only if it reads as a path
fn clean_path(line: &str) -> Option<String> {
    let cleaned = line
        .trim()
        .trim_start_matches('#')
        .trim()
        .trim_matches(|c| c == '*' || c == '`')
        .trim_end_matches(':')
        .trim_matches(|c| c == '*' || c == '`')
        .trim();

    let looks_like_path = !cleaned.is_empty()
        && !cleaned.contains(char::is_whitespace)
        && (cleaned.contains('.') || cleaned.contains('/'))
        && !cleaned.ends_with('.');

    looks_like_path.then(|| cleaned.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_edit() {
        let reply = "Here is the fix.\n\nsrc/main.rs\n```rust\nfn main() {\n    println!(\"hi\");\n}\n```\nDone.";
        let edits = parse_whole_file_edits(reply);
        assert_eq!(
            edits,
            vec![WholeFileEdit {
                path: "src/main.rs".to_string(),
                content: "fn main() {\n    println!(\"hi\");\n}\n".to_string(),
            }]
        );
    }

    #[test]
    fn test_decorated_paths_and_multiple_edits() {
        let reply = "**a.txt**\n```\none\n```\n\n`dir/b.py`:\n```python\ntwo\n```\n";
        let edits = parse_whole_file_edits(reply);
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].path, "a.txt");
        assert_eq!(edits[0].content, "one\n");
        assert_eq!(edits[1].path, "dir/b.py");
        assert_eq!(edits[1].content, "two\n");
    }

    #[test]
    fn test_prose_before_fence_is_not_a_path() {
        let reply = "Run this command:\n```bash\nls -la\n```\n";
        assert!(parse_whole_file_edits(reply).is_empty());
    }

    #[test]
    fn test_unterminated_fence_ignored() {
        let reply = "a.txt\n```\nnever closed\n";
        assert!(parse_whole_file_edits(reply).is_empty());
    }

    #[test]
    fn test_empty_block_yields_empty_file() {
        let reply = "empty.txt\n```\n```\n";
        let edits = parse_whole_file_edits(reply);
        assert_eq!(edits[0].content, "");
    }
}
