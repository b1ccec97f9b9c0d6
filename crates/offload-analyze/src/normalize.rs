//! Source normalization used before the bundle's content-address hash is taken,
//! so that re-indenting a captured function or editing it on a different OS
//! doesn't change the bundle id.

/// Normalize line endings to `\n` and strip the common leading whitespace from
/// every non-blank line (Python's `textwrap.dedent`).
pub fn normalize_source(source: &str) -> String {
    let unified = source.replace("\r\n", "\n").replace('\r', "\n");
    dedent(&unified)
}

fn dedent(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start_matches(' ').len())
        .min()
        .unwrap_or(0);

    lines
        .iter()
        .map(|l| {
            if l.trim().is_empty() {
                String::new()
            } else {
                l.chars().skip(indent).collect()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_common_indentation() {
        let src = "    def f():\n        return 1\n";
        assert_eq!(normalize_source(src), "def f():\n    return 1");
    }

    #[test]
    fn unifies_crlf() {
        let src = "def f():\r\n    return 1\r\n";
        assert_eq!(normalize_source(src), "def f():\n    return 1");
    }

    #[test]
    fn blank_lines_stay_blank() {
        let src = "  def f():\n\n      return 1\n";
        assert_eq!(normalize_source(src), "def f():\n\n    return 1");
    }
}
