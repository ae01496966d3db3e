//! Conversion from loosely structured markdown scenarios to canonical
//! Given/When/Then text.
//!
//! This is intentionally not a Gherkin parser: it recognizes a constrained
//! markdown subset (step keyword lines, list markers, continuation lines)
//! and nothing else. Free-form prose that never mentions a step keyword
//! converts to an empty string so callers can fall back to the raw text.

/// Ordered step keyword set, canonical capitalization.
const STEP_KEYWORDS: [&str; 5] = ["Given", "When", "Then", "And", "But"];

/// Converts scenario text to canonical Given/When/Then form.
///
/// Lines are classified by a case-insensitive leading keyword match after
/// markdown list markers are stripped (markers first, then keyword match).
/// Non-keyword lines following a classified line are space-joined onto the
/// current step. Returns an empty string when no line carries a keyword.
///
/// Idempotent for any input that contains at least one keyword line.
pub(crate) fn to_canonical_bdd(input: &str) -> String {
    let mut steps: Vec<String> = Vec::new();

    for raw_line in input.lines() {
        if raw_line.trim().is_empty() {
            continue;
        }
        let line = strip_list_marker(raw_line);
        if let Some((keyword, rest)) = leading_keyword(line) {
            if rest.is_empty() {
                steps.push(keyword.to_string());
            } else {
                steps.push(format!("{keyword} {rest}"));
            }
        } else if let Some(current) = steps.last_mut() {
            let continuation = line.trim();
            if !continuation.is_empty() {
                current.push(' ');
                current.push_str(continuation);
            }
        }
        // Prose before the first keyword line has no step to attach to and
        // is dropped; an all-prose input therefore yields an empty result.
    }

    steps.join("\n")
}

/// Strips a leading markdown bullet (`-`, `*`) or ordered-list marker
/// (digits followed by `.`) so the keyword match sees the step text.
fn strip_list_marker(line: &str) -> &str {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix('-').or_else(|| trimmed.strip_prefix('*')) {
        return rest.trim_start();
    }
    let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        if let Some(rest) = trimmed[digits..].strip_prefix('.') {
            return rest.trim_start();
        }
    }
    trimmed
}

/// Case-insensitive leading keyword match. The keyword must be a whole word:
/// `Andover` never matches `And`. Returns the canonical keyword and the
/// remaining step text.
fn leading_keyword(line: &str) -> Option<(&'static str, &str)> {
    for keyword in STEP_KEYWORDS {
        // `get` returns None when the cut lands inside a multibyte char,
        // which also means the line cannot start with an ASCII keyword.
        let Some(prefix) = line.get(..keyword.len()) else {
            continue;
        };
        if prefix.eq_ignore_ascii_case(keyword) {
            let rest = &line[keyword.len()..];
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                return Some((keyword, rest.trim()));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercase_keyword_is_normalized() {
        assert_eq!(
            to_canonical_bdd("given the system is up"),
            "Given the system is up"
        );
    }

    #[test]
    fn mixed_case_keywords_are_normalized() {
        let converted = to_canonical_bdd("GIVEN a user\nwHeN they log in\nTHEN it works");
        assert_eq!(converted, "Given a user\nWhen they log in\nThen it works");
    }

    #[test]
    fn continuation_lines_are_joined_onto_current_step() {
        let converted = to_canonical_bdd("Given a user\n  who is logged in\nWhen they click");
        let lines: Vec<&str> = converted.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "Given a user who is logged in");
        assert!(lines[1].starts_with("When"));
    }

    #[test]
    fn list_markers_are_stripped_before_keyword_match() {
        let converted = to_canonical_bdd("- Given a cart\n* when items are added\n1. Then totals update");
        assert_eq!(
            converted,
            "Given a cart\nWhen items are added\nThen totals update"
        );
    }

    #[test]
    fn and_but_steps_are_recognized() {
        let converted = to_canonical_bdd("given a cart\nand a coupon\nbut no stock");
        assert_eq!(converted, "Given a cart\nAnd a coupon\nBut no stock");
    }

    #[test]
    fn prose_without_keywords_yields_empty_result() {
        assert_eq!(to_canonical_bdd("Just a plain description of the test."), "");
        assert_eq!(to_canonical_bdd(""), "");
    }

    #[test]
    fn keyword_must_be_a_whole_word() {
        // "Andover" must not be read as an "And" step.
        assert_eq!(to_canonical_bdd("Andover is a town"), "");
    }

    #[test]
    fn conversion_is_idempotent_on_canonical_input() {
        let input = "- given a user\n  with admin rights\n- when they open settings\n- then the audit tab is visible";
        let once = to_canonical_bdd(input);
        let twice = to_canonical_bdd(&once);
        assert_eq!(once, twice);
        assert!(!once.is_empty());
    }

    #[test]
    fn multibyte_prose_is_handled_without_panicking() {
        // The first five bytes of these lines fall inside a multibyte char.
        assert_eq!(to_canonical_bdd("日本語のテスト手順"), "");
        assert_eq!(to_canonical_bdd("Тест без ключевых слов"), "");
    }

    #[test]
    fn keyword_steps_may_carry_multibyte_text() {
        let converted = to_canonical_bdd("given ログイン済みのユーザー\nwhen 設定を開く");
        assert_eq!(converted, "Given ログイン済みのユーザー\nWhen 設定を開く");
    }

    #[test]
    fn blank_lines_are_skipped() {
        let converted = to_canonical_bdd("Given a user\n\n\nWhen they act");
        assert_eq!(converted, "Given a user\nWhen they act");
    }
}
