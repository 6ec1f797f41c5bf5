use anyhow::{Context, Result};
use regex::Regex;

/// Fence markers a tool block may use, longest first so a four-character
/// fence is not read as a three-character one.
const FENCES: [&str; 4] = ["````", "```", "~~~~", "~~~"];

/// Turns stored message content into index text and model input.
///
/// A tool transcript is rendered as a `---` rule, a bold title line, one
/// fenced block and a closing `---` rule. The fence closes at the first line
/// holding only its marker, so a block never reaches past its own fence.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    rule: Regex,
    title: Regex,
    max_chars: usize,
}

impl PayloadBuilder {
    pub fn new(max_chars: usize) -> Result<Self> {
        let rule = Regex::new(r"^---[ \t]*$").context("failed to compile rule regex")?;
        let title = Regex::new(r"^\*\*[^*\n]+\*\*").context("failed to compile title regex")?;
        Ok(Self {
            rule,
            title,
            max_chars: max_chars.max(1),
        })
    }

    /// Removes well-formed tool output blocks. Anything that does not match
    /// the full shape is left untouched.
    pub fn strip_tool_output(&self, text: &str) -> String {
        let lines = text.split_inclusive('\n').collect::<Vec<&str>>();
        let mut out = String::with_capacity(text.len());
        let mut index = 0;
        while index < lines.len() {
            match self.tool_block_end(&lines, index) {
                Some(end) => index = end,
                None => {
                    out.push_str(lines[index]);
                    index += 1;
                }
            }
        }
        out
    }

    /// Text actually sent to the model. The server rejects empty inputs, so
    /// an empty payload becomes a single space.
    pub fn embedding_payload(&self, stripped: &str) -> String {
        let truncated = truncate_chars(stripped, self.max_chars);
        if truncated.trim().is_empty() {
            " ".to_string()
        } else {
            truncated.to_string()
        }
    }

    /// Index of the first line after the tool block opening at `start`.
    fn tool_block_end(&self, lines: &[&str], start: usize) -> Option<usize> {
        let line = |index: usize| lines.get(index).map(|raw| line_text(raw));

        if !self.rule.is_match(line(start)?) || !self.title.is_match(line(start + 1)?) {
            return None;
        }
        let fence = opening_fence(line(start + 2)?)?;
        let close = (start + 3..lines.len())
            .find(|index| is_closing_fence(line_text(lines[*index]), fence))?;
        self.rule.is_match(line(close + 1)?).then_some(close + 2)
    }
}

fn line_text(line: &str) -> &str {
    line.strip_suffix('\n').unwrap_or(line)
}

fn opening_fence(line: &str) -> Option<&'static str> {
    FENCES.into_iter().find(|fence| line.starts_with(fence))
}

fn is_closing_fence(line: &str, fence: &str) -> bool {
    line.strip_prefix(fence).is_some_and(|rest| rest.chars().all(|ch| ch == ' ' || ch == '\t'))
}

pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}
