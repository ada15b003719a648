//! `@username` extraction. Resolution to member ids happens in the pipeline.

use crate::error::{HubError, HubResult};

/// Longest username the identity service hands out.
pub const MAX_USERNAME_LEN: usize = 32;

/// Collect distinct `@name` tokens in order of first appearance.
///
/// A token starts at an `@` that is at the beginning of the text or follows a
/// character that cannot be part of a name (so `mail@example.com` is not a
/// mention). Names are letters, digits, `_`, `-` and `.`; a trailing `.`
/// is punctuation, not part of the name. A bare `@` is ignored. A name longer
/// than [`MAX_USERNAME_LEN`] is rejected.
pub fn parse_mentions(content: &str) -> HubResult<Vec<String>> {
    let mut names: Vec<String> = Vec::new();
    let mut prev: Option<char> = None;
    let mut chars = content.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        let starts_token = c == '@' && !prev.is_some_and(is_name_char);
        prev = Some(c);
        if !starts_token {
            continue;
        }

        let start = idx + 1;
        let mut end = start;
        while let Some(&(i, next)) = chars.peek() {
            if !is_name_char(next) {
                break;
            }
            end = i + next.len_utf8();
            prev = Some(next);
            chars.next();
        }

        let name = content[start..end].trim_end_matches('.');
        if name.is_empty() {
            continue;
        }
        if name.chars().count() > MAX_USERNAME_LEN {
            return Err(HubError::validation(format!(
                "mention '@{}' exceeds {} characters",
                name, MAX_USERNAME_LEN
            )));
        }
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }

    Ok(names)
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// First few characters of a message, for mention notifications.
pub fn excerpt(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &content[..cut]),
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_distinct_mentions_in_order() {
        assert_eq!(
            parse_mentions("hello @bob and @alice, also @bob").unwrap(),
            vec!["bob", "alice"]
        );
    }

    #[test]
    fn ignores_emails_and_bare_at() {
        assert!(parse_mentions("mail me at bob@example.com @ noon").unwrap().is_empty());
        assert_eq!(parse_mentions("(@carol)").unwrap(), vec!["carol"]);
    }

    #[test]
    fn trailing_period_is_punctuation() {
        assert_eq!(parse_mentions("thanks @dave.").unwrap(), vec!["dave"]);
        assert_eq!(parse_mentions("ping @j.doe!").unwrap(), vec!["j.doe"]);
    }

    #[test]
    fn overlong_name_is_a_validation_error() {
        let long = format!("@{}", "x".repeat(MAX_USERNAME_LEN + 1));
        assert!(matches!(parse_mentions(&long), Err(HubError::Validation(_))));
        let exact = format!("@{}", "x".repeat(MAX_USERNAME_LEN));
        assert_eq!(parse_mentions(&exact).unwrap().len(), 1);
    }

    #[test]
    fn handles_multibyte_text() {
        assert_eq!(parse_mentions("héllo @zoë").unwrap(), vec!["zoë"]);
        assert_eq!(excerpt("héllo wörld", 5), "héllo…");
        assert_eq!(excerpt("short", 10), "short");
    }
}
