use serde::{Deserialize, Serialize};

const FENCE: &str = "```";
const EXECUTABLE_TAGS: [&str; 3] = ["python", "py", "python3"];

/// One executable block found in a model response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFragment {
    pub source: String,
    /// Ordinal among the executable blocks of the response.
    pub position: usize,
    /// Where the block's source starts in the response text.
    pub byte_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extraction {
    pub fragments: Vec<CodeFragment>,
    /// Response text with the executable blocks removed.
    pub prose: String,
}

impl Extraction {
    pub fn has_code(&self) -> bool {
        !self.fragments.is_empty()
    }
}

enum FenceLine {
    Open,
    OpenOther,
    Close,
    NotFence,
}

fn classify_line(line: &str) -> FenceLine {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix(FENCE) else {
        return FenceLine::NotFence;
    };

    let tag = rest.trim_start_matches('`').trim();
    if tag.is_empty() {
        return FenceLine::Close;
    }

    let tag = tag
        .split(|ch: char| ch.is_whitespace() || ch == '{')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    if EXECUTABLE_TAGS.contains(&tag.as_str()) {
        FenceLine::Open
    } else {
        FenceLine::OpenOther
    }
}

struct OpenBlock {
    start: usize,
    lines: Vec<String>,
}

/// Splits model output into python fragments and surrounding prose.
///
/// Never fails: a block missing its closing fence runs to the end of the text, and a python
/// fence opened inside an open block starts a new fragment.
pub fn extract(text: &str) -> Extraction {
    let mut extraction = Extraction::default();
    let mut prose_lines: Vec<&str> = Vec::new();
    let mut open: Option<OpenBlock> = None;
    let mut in_other_fence = false;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let content = line.trim_end_matches(|ch: char| ch == '\n' || ch == '\r');

        if in_other_fence {
            prose_lines.push(content);
            if matches!(classify_line(content), FenceLine::Close) {
                in_other_fence = false;
            }
            continue;
        }

        match (open.take(), classify_line(content)) {
            (None, FenceLine::Open) => {
                open = Some(OpenBlock {
                    start: offset,
                    lines: Vec::new(),
                });
            }
            (None, FenceLine::OpenOther | FenceLine::Close) => {
                in_other_fence = true;
                prose_lines.push(content);
            }
            (None, FenceLine::NotFence) => prose_lines.push(content),
            (Some(block), FenceLine::Close) => push_fragment(&mut extraction, block),
            (Some(block), FenceLine::Open) => {
                push_fragment(&mut extraction, block);
                open = Some(OpenBlock {
                    start: offset,
                    lines: Vec::new(),
                });
            }
            (Some(mut block), _) => {
                if block.lines.is_empty() {
                    block.start = line_start;
                }
                block.lines.push(content.to_string());
                open = Some(block);
            }
        }
    }

    if let Some(block) = open {
        push_fragment(&mut extraction, block);
    }

    extraction.prose = prose_lines.join("\n").trim().to_string();
    extraction
}

fn push_fragment(extraction: &mut Extraction, block: OpenBlock) {
    let source = block.lines.join("\n");
    if source.trim().is_empty() {
        return;
    }

    extraction.fragments.push(CodeFragment {
        source,
        position: extraction.fragments.len(),
        byte_offset: block.start,
    });
}

#[cfg(test)]
mod tests {
    use super::extract;

    #[test]
    fn plain_text_has_no_fragments() {
        let extraction = extract("The CTR for Facebook is 5%.");
        assert!(!extraction.has_code());
        assert_eq!(extraction.prose, "The CTR for Facebook is 5%.");
    }

    #[test]
    fn fragments_keep_source_order_and_offsets() {
        let text = "First:\n```python\nx = 5\n```\nThen:\n```py\nprint(x)\n```\nDone.";
        let extraction = extract(text);

        assert_eq!(extraction.fragments.len(), 2);
        assert_eq!(extraction.fragments[0].source, "x = 5");
        assert_eq!(extraction.fragments[0].position, 0);
        assert_eq!(extraction.fragments[1].source, "print(x)");
        assert_eq!(extraction.fragments[1].position, 1);
        assert_eq!(
            &text[extraction.fragments[0].byte_offset..][..5],
            "x = 5"
        );
        assert_eq!(
            &text[extraction.fragments[1].byte_offset..][..8],
            "print(x)"
        );
        assert_eq!(extraction.prose, "First:\nThen:\nDone.");
    }

    #[test]
    fn unterminated_block_runs_to_end_of_text() {
        let extraction = extract("Let me check.\n```python\nprint(1)\nprint(2)");
        assert_eq!(extraction.fragments.len(), 1);
        assert_eq!(extraction.fragments[0].source, "print(1)\nprint(2)");
        assert_eq!(extraction.prose, "Let me check.");
    }

    #[test]
    fn nested_open_fence_starts_a_new_fragment() {
        let extraction = extract("```python\na = 1\n```python\nb = a + 1\n```");
        let sources = extraction
            .fragments
            .iter()
            .map(|fragment| fragment.source.as_str())
            .collect::<Vec<_>>();
        assert_eq!(sources, vec!["a = 1", "b = a + 1"]);
    }

    #[test]
    fn other_language_and_untagged_fences_are_prose() {
        let text = "```text\nrow | value\n```\n```\nprint('not run')\n```\n```PYTHON\nprint('run')\n```";
        let extraction = extract(text);
        assert_eq!(extraction.fragments.len(), 1);
        assert_eq!(extraction.fragments[0].source, "print('run')");
        assert!(extraction.prose.contains("row | value"));
        assert!(extraction.prose.contains("print('not run')"));
    }

    #[test]
    fn blank_blocks_are_skipped() {
        let extraction = extract("```python\n\n   \n```\nNothing to run.");
        assert!(!extraction.has_code());
    }

    #[test]
    fn crlf_line_endings_are_tolerated() {
        let extraction = extract("```python\r\nx = 1\r\n```\r\n");
        assert_eq!(extraction.fragments[0].source, "x = 1");
    }

    #[test]
    fn extraction_is_deterministic() {
        let text = "```python\nimport math\n```\ntext\n```python\nmath.pi\n";
        assert_eq!(extract(text), extract(text));
    }
}
