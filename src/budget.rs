//! Tool-output truncation and prompt-shape decisions driven by the
//! context-budget mode (§4.4).

use crate::types::ContextMode;

const TRUNCATE_THRESHOLD: usize = 5000;
const TRUNCATE_HEAD: usize = 2000;
const TRUNCATE_TAIL: usize = 2000;
const DIFF_TRUNCATE_LIMIT: usize = 3000;

/// Truncate `text` longer than 5000 chars to the first 2000 + a marker +
/// the last 2000. Idempotent: re-applying to an already-truncated string
/// (which is short enough) is a no-op.
pub fn truncate(text: &str) -> String {
    if text.chars().count() <= TRUNCATE_THRESHOLD {
        return text.to_string();
    }
    let chars: Vec<char> = text.chars().collect();
    let head: String = chars[..TRUNCATE_HEAD].iter().collect();
    let tail: String = chars[chars.len() - TRUNCATE_TAIL..].iter().collect();
    format!("{}\n... [truncated] ...\n{}", head, tail)
}

/// Truncate a git diff to at most ~3000 chars, preferring to keep whole
/// per-file segments (split on `diff --git `) and append a trailing
/// "truncated, showing X/Y files" note when files were dropped.
pub fn truncate_diff(diff: &str) -> String {
    if diff.len() <= DIFF_TRUNCATE_LIMIT {
        return diff.to_string();
    }

    let mut segments: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in diff.lines() {
        if line.starts_with("diff --git ") && !current.is_empty() {
            segments.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.is_empty() {
        segments.push(current);
    }

    let total_files = segments.len().max(1);
    let mut kept = Vec::new();
    let mut used = 0usize;
    for seg in &segments {
        if used + seg.len() > DIFF_TRUNCATE_LIMIT && !kept.is_empty() {
            break;
        }
        used += seg.len();
        kept.push(seg.clone());
    }
    if kept.is_empty() {
        // Not even one whole file fits; fall back to plain head/tail truncation.
        return truncate(diff);
    }

    let shown = kept.len();
    let mut out = kept.join("");
    if shown < total_files {
        out.push_str(&format!(
            "\n... [truncated, showing {}/{} files] ...\n",
            shown, total_files
        ));
    }
    out
}

/// Replace any `data:image/...;base64,...` run with a placeholder, leaving
/// file paths and surrounding text intact.
pub fn strip_base64_blobs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("data:image/") {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let base64_marker = ";base64,";
        if let Some(marker_pos) = tail.find(base64_marker) {
            let data_start = marker_pos + base64_marker.len();
            let end = tail[data_start..]
                .find(|c: char| c.is_whitespace() || c == '"' || c == '\'')
                .map(|i| data_start + i)
                .unwrap_or(tail.len());
            out.push_str("[image omitted]");
            rest = &tail[end..];
        } else {
            out.push_str(tail);
            rest = "";
            break;
        }
    }
    out.push_str(rest);
    out
}

/// True when the supervisor should switch to the minimal-context prompt
/// shape (issue id + title + first line only) and skip optional includes.
pub fn should_use_minimal_prompt(mode: ContextMode) -> bool {
    matches!(mode, ContextMode::Compact | ContextMode::Critical)
}

/// True when the supervisor must initiate graceful shutdown of the current
/// session (flush memory, return `ContextLimit`).
pub fn should_trigger_shutdown(mode: ContextMode) -> bool {
    matches!(mode, ContextMode::Critical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_text_unchanged() {
        assert_eq!(truncate("hello"), "hello");
    }

    #[test]
    fn truncate_long_text_is_idempotent() {
        let long = "x".repeat(6000);
        let once = truncate(&long);
        let twice = truncate(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn truncate_diff_keeps_whole_segments() {
        let file_a = format!("diff --git a/a b/a\n{}\n", "a".repeat(2000));
        let file_b = format!("diff --git a/b b/b\n{}\n", "b".repeat(2000));
        let diff = format!("{}{}", file_a, file_b);
        let out = truncate_diff(&diff);
        assert!(out.contains("truncated, showing"));
        assert!(out.starts_with("diff --git a/a"));
    }

    #[test]
    fn strip_base64_blobs_removes_data_uri() {
        let text = "see screenshot: data:image/png;base64,AAAABBBB== done";
        let out = strip_base64_blobs(text);
        assert!(out.contains("[image omitted]"));
        assert!(!out.contains("AAAABBBB"));
        assert!(out.contains("done"));
    }

    #[test]
    fn mode_gating() {
        assert!(!should_use_minimal_prompt(ContextMode::Normal));
        assert!(should_use_minimal_prompt(ContextMode::Compact));
        assert!(!should_trigger_shutdown(ContextMode::Compact));
        assert!(should_trigger_shutdown(ContextMode::Critical));
    }
}
