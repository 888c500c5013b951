//! Running chat summary carried between turns
//!
//! Each answered turn appends a `U:` line for the prompt and an `A:` line
//! for the reply. The oldest text is dropped once the summary grows past
//! [`CHAT_SUMMARY_MAX_CHARS`].

pub const CHAT_SUMMARY_MAX_CHARS: usize = 2000;
const REPLY_MAX_CHARS: usize = 200;
const ELLIPSIS: char = '…';

/// Append one prompt/reply exchange to `summary` and trim from the front.
pub fn append_chat_summary(summary: &str, prompt: &str, reply: &str) -> String {
    let entry = format!(
        "U: {}\nA: {}",
        one_line(prompt, None),
        one_line(reply, Some(REPLY_MAX_CHARS))
    );

    let summary = summary.trim();
    let joined = if summary.is_empty() {
        entry
    } else {
        format!("{summary}\n{entry}")
    };

    keep_tail(&joined, CHAT_SUMMARY_MAX_CHARS)
}

fn one_line(text: &str, limit: Option<usize>) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match limit {
        Some(limit) if flat.chars().count() > limit => {
            let mut cut: String = flat.chars().take(limit).collect();
            cut.push(ELLIPSIS);
            cut
        }
        _ => flat,
    }
}

/// Last `max_chars` characters of `text`
fn keep_tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_exchange_starts_the_summary() {
        let summary = append_chat_summary("", "draw a fox", "A red fox in the snow");
        assert_eq!(summary, "U: draw a fox\nA: A red fox in the snow");
    }

    #[test]
    fn test_exchanges_accumulate_in_order() {
        let first = append_chat_summary("  ", "draw a fox", "a fox");
        let second = append_chat_summary(&first, "make it\nwatercolor", "a watercolor fox");
        assert_eq!(
            second,
            "U: draw a fox\nA: a fox\nU: make it watercolor\nA: a watercolor fox"
        );
    }

    #[test]
    fn test_long_reply_is_shortened() {
        let reply = "x".repeat(500);
        let summary = append_chat_summary("", "hi", &reply);
        let answer = summary.lines().nth(1).unwrap();
        assert_eq!(answer.chars().count(), "A: ".len() + REPLY_MAX_CHARS + 1);
        assert!(answer.ends_with(ELLIPSIS));
    }

    #[test]
    fn test_summary_is_trimmed_from_the_front() {
        let previous = "가".repeat(CHAT_SUMMARY_MAX_CHARS);
        let summary = append_chat_summary(&previous, "draw a fox", "a fox");

        assert_eq!(summary.chars().count(), CHAT_SUMMARY_MAX_CHARS);
        assert!(summary.ends_with("U: draw a fox\nA: a fox"));
        assert!(summary.starts_with('가'));
    }
}
