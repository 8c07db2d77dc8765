//! Cleanup of raw extraction output.
//!
//! Both `pdftotext` and `tesseract` hard-wrap lines the way they appear on the
//! page, and they leave word-wrap hyphenation in place. We join soft-wrapped
//! lines and remove the hyphenation, but keep blank-line paragraph breaks.

/// Normalize raw page text.
///
/// 1. A single `\n` with no `\n` on either side becomes a space.
/// 2. Every `"- "` sequence is removed, which rejoins `"exam- ple"` (and
///    `"exam-\nple"`, after step 1) into `"example"`.
pub fn normalize(raw: &str) -> String {
    let chars = raw.chars().collect::<Vec<_>>();
    let mut joined = String::with_capacity(raw.len());
    for (i, &c) in chars.iter().enumerate() {
        let prev_is_newline = i > 0 && chars[i - 1] == '\n';
        let next_is_newline = chars.get(i + 1) == Some(&'\n');
        if c == '\n' && !prev_is_newline && !next_is_newline {
            joined.push(' ');
        } else {
            joined.push(c);
        }
    }
    joined.replace("- ", "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_hyphenation_and_soft_wraps() {
        assert_eq!(normalize("exam- ple\nword"), "example word");
    }

    #[test]
    fn preserves_paragraph_breaks() {
        assert_eq!(normalize("para one\n\npara two"), "para one\n\npara two");
        assert_eq!(normalize("a\n\n\nb"), "a\n\n\nb");
    }

    #[test]
    fn joins_line_end_hyphenation() {
        assert_eq!(
            normalize("Revenue grew 5%\npowered by efficien- cy gains"),
            "Revenue grew 5% powered by efficiency gains"
        );
        assert_eq!(normalize("efficien-\ncy"), "efficiency");
    }

    #[test]
    fn edge_newlines_become_spaces() {
        assert_eq!(normalize("\nline\n"), " line ");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn clean_text_is_unchanged() {
        let clean = "Already clean.\n\nSecond paragraph.";
        assert_eq!(normalize(clean), clean);
        assert_eq!(normalize(&normalize(clean)), clean);
    }
}
