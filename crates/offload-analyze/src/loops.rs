//! Read-only loop parallelization analysis. Not part of [`crate::report::DependencyReport`]
//! and not consulted by the bundle packager — an optional entry point for a future
//! acceleration collaborator that wants to know which loops are safe to distribute
//! without itself re-deriving indentation blocks.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    For,
    While,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopInfo {
    pub kind: LoopKind,
    /// The loop header with trailing `:` stripped, e.g. `for item in items`.
    pub header: String,
    pub start_line: u32,
    /// Exclusive end line (first line at or below the loop's own indentation).
    pub end_line: u32,
    pub parallelizable: bool,
    pub blocking_reason: Option<String>,
}

pub fn analyze_loops(source: &str) -> Vec<LoopInfo> {
    let lines: Vec<&str> = source.lines().collect();
    let mut loops = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        let kind = if trimmed.starts_with("for ") {
            LoopKind::For
        } else if trimmed.starts_with("while ") {
            LoopKind::While
        } else {
            continue;
        };

        let mut end = lines.len();
        for (j, body_line) in lines.iter().enumerate().skip(idx + 1) {
            if body_line.trim().is_empty() {
                continue;
            }
            let body_indent = body_line.len() - body_line.trim_start().len();
            if body_indent <= indent {
                end = j;
                break;
            }
        }

        let body = lines[idx + 1..end].join("\n");
        let blocking_reason = blocking_reason(&body);
        loops.push(LoopInfo {
            kind,
            header: trimmed.trim_end_matches(':').to_string(),
            start_line: idx as u32 + 1,
            end_line: end as u32 + 1,
            parallelizable: blocking_reason.is_none(),
            blocking_reason,
        });
    }

    loops
}

/// The original analyzer disqualifies a loop if its body contains `break`,
/// `continue`, or `global` anywhere, including inside nested blocks — sound if
/// overly conservative for a `break` buried in a nested loop.
fn blocking_reason(body: &str) -> Option<String> {
    for keyword in ["break", "continue", "global"] {
        if contains_word(body, keyword) {
            return Some(format!("body contains `{keyword}`"));
        }
    }
    None
}

fn contains_word(text: &str, word: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .any(|token| token == word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_for_loop_is_parallelizable() {
        let src = "def f(items):\n    total = 0\n    for item in items:\n        total += item.value\n    return total\n";
        let loops = analyze_loops(src);
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].kind, LoopKind::For);
        assert!(loops[0].parallelizable);
    }

    #[test]
    fn break_disqualifies_the_loop() {
        let src = "def f(items):\n    for item in items:\n        if item.bad:\n            break\n        process(item)\n";
        let loops = analyze_loops(src);
        assert_eq!(loops.len(), 1);
        assert!(!loops[0].parallelizable);
        assert_eq!(loops[0].blocking_reason.as_deref(), Some("body contains `break`"));
    }

    #[test]
    fn while_loop_is_detected() {
        let src = "def f():\n    while running:\n        step()\n";
        let loops = analyze_loops(src);
        assert_eq!(loops[0].kind, LoopKind::While);
    }
}
