//! Shared helpers: slugs, branch naming, and JSON extraction from agent output.

/// Convert a title to a URL/branch-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        let mut end = max_len;
        while !slug.is_char_boundary(end) {
            end -= 1;
        }
        slug[..end].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Deterministic branch name for an epic. Recovery recomputes this from
/// replayed epics, so it must stay stable across releases.
pub fn epic_branch_name(epic_id: &str, title: &str) -> String {
    format!("conductor/epic-{}-{}", slugify(epic_id, 48), slugify(title, 32))
}

/// Deterministic branch name for a story.
pub fn story_branch_name(story_id: &str, title: &str) -> String {
    format!("conductor/story-{}-{}", slugify(story_id, 48), slugify(title, 32))
}

/// Extract the outermost JSON object from text that may contain other
/// content. Uses brace counting, so prose around the object is tolerated.
pub fn extract_json_object(text: &str) -> Option<String> {
    extract_delimited(text, '{', '}')
}

/// Extract the outermost JSON array from mixed text. Planner agents return
/// epic lists as arrays, usually wrapped in explanation or code fences.
pub fn extract_json_array(text: &str) -> Option<String> {
    extract_delimited(text, '[', ']')
}

fn extract_delimited(text: &str, open: char, close: char) -> Option<String> {
    let start = text.find(open)?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + close.len_utf8();
                    break;
                }
            }
            _ => {}
        }
    }

    (depth == 0 && end > start).then(|| text[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Add OAuth login!", 40), "add-oauth-login");
        assert_eq!(slugify("  spaces   and---dashes ", 40), "spaces-and-dashes");
    }

    #[test]
    fn test_slugify_truncates_at_limit() {
        let slug = slugify("a very long epic title that keeps going on", 12);
        assert!(slug.len() <= 12);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn test_epic_branch_name_is_deterministic() {
        let a = epic_branch_name("epic-1-backend", "User API [backend]");
        let b = epic_branch_name("epic-1-backend", "User API [backend]");
        assert_eq!(a, b);
        assert!(a.starts_with("conductor/epic-"));
    }

    #[test]
    fn test_extract_json_object_with_prose() {
        let text = r#"Here is my plan: {"id": "e1", "nested": {"x": 1}} hope it helps"#;
        assert_eq!(
            extract_json_object(text).unwrap(),
            r#"{"id": "e1", "nested": {"x": 1}}"#
        );
    }

    #[test]
    fn test_extract_json_array_with_code_fence() {
        let text = "```json\n[{\"id\": \"e1\"}, {\"id\": \"e2\"}]\n```";
        assert_eq!(
            extract_json_array(text).unwrap(),
            r#"[{"id": "e1"}, {"id": "e2"}]"#
        );
    }

    #[test]
    fn test_extract_ignores_braces_inside_strings() {
        let text = r#"{"note": "a } inside a string"}"#;
        assert_eq!(extract_json_object(text).unwrap(), text);
    }

    #[test]
    fn test_extract_unbalanced_returns_none() {
        assert!(extract_json_object("{\"never\": \"closed\"").is_none());
        assert!(extract_json_array("no json here").is_none());
    }
}
