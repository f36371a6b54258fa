//! Prompt builders for the built-in stages.
//!
//! Prompts are plain string concatenation. The exact text is part of the
//! output contract, so changes here change what the model sees.

/// Separator between blocks of a multi-part prompt.
pub const SEPARATOR: &str = "\n\n--------\n\n";

/// Prompt for `map`: the input followed by the template.
pub fn append(input: &str, template: &str) -> String {
    format!("{} {}", input, template)
}

/// Prompt for `map_before`: the template followed by the input.
pub fn prepend(template: &str, input: &str) -> String {
    format!("{} {}", template, input)
}

/// Yes/no prompt asking whether `condition` holds for `item`.
pub fn judgment(item: &str, condition: &str) -> String {
    format!(
        "{item}{sep}is the below premises true for the above text? reply with only yes or no{sep}{condition}{sep}reply: ",
        item = item,
        sep = SEPARATOR,
        condition = condition,
    )
}

/// Prompt collapsing `items` into one text.
///
/// The operation follows "as a" with no space in between.
pub fn reduction(operation: &str, items: &[String]) -> String {
    format!(
        "reduce all below text as a{}{}{}",
        operation,
        SEPARATOR,
        items.join(SEPARATOR)
    )
}

/// Whether a judgment reply counts as "yes".
pub fn is_affirmative(reply: &str) -> bool {
    let normalized = reply.trim().to_lowercase();
    normalized == "yes" || normalized == "yes."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_prepend_differ_only_in_order() {
        assert_eq!(append("X", "t"), "X t");
        assert_eq!(prepend("t", "X"), "t X");
    }

    #[test]
    fn test_judgment_shape() {
        let p = judgment("some text", "mentions any fruit");
        assert_eq!(
            p,
            "some text\n\n--------\n\nis the below premises true for the above text? reply with only yes or no\n\n--------\n\nmentions any fruit\n\n--------\n\nreply: "
        );
    }

    #[test]
    fn test_reduction_keeps_as_a_quirk() {
        let items = vec!["one".to_string(), "two".to_string()];
        assert_eq!(
            reduction("twitter post", &items),
            "reduce all below text as atwitter post\n\n--------\n\none\n\n--------\n\ntwo"
        );
    }

    #[test]
    fn test_reduction_empty_items() {
        assert_eq!(
            reduction("summary", &[]),
            "reduce all below text as asummary\n\n--------\n\n"
        );
    }

    #[test]
    fn test_is_affirmative() {
        assert!(is_affirmative("yes"));
        assert!(is_affirmative("  Yes.\n"));
        assert!(is_affirmative("YES"));
        assert!(!is_affirmative("no"));
        assert!(!is_affirmative("Yes, definitely"));
        assert!(!is_affirmative(""));
        assert!(!is_affirmative("yes!"));
    }
}
