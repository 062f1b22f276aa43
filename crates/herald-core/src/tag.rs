//! `@name` tag routing.
//!
//! A request reaches an instance when its text contains `@<name>`,
//! compared case-insensitively. Matching is a plain substring test with no
//! word boundaries, so `@code` also matches a request tagged `@coder`.
//! [`find_collisions`] reports name pairs affected by this.

use regex::RegexBuilder;

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 64;

/// The routing tag for an instance name.
pub fn tag_for(name: &str) -> String {
    format!("@{name}")
}

/// Whether `text` is addressed to the instance called `name`.
///
/// This is the predicate the store filters implement (`instr(lower(..))` in
/// `SQLite`, `ilike` over `PostgREST`). Case folding is ASCII-only, like
/// `SQLite`'s `lower()`.
pub fn matches(text: &str, name: &str) -> bool {
    text.to_ascii_lowercase()
        .contains(&tag_for(name).to_ascii_lowercase())
}

/// Remove every occurrence of the instance's tag (and the whitespace after
/// it) from `text`, then trim.
pub fn strip_tag(text: &str, name: &str) -> String {
    let pattern = format!(r"{}\s*", regex::escape(&tag_for(name)));
    match RegexBuilder::new(&pattern).case_insensitive(true).build() {
        Ok(re) => re.replace_all(text, "").trim().to_string(),
        Err(_) => text.trim().to_string(),
    }
}

/// Validate an instance name.
///
/// Names are restricted to ASCII letters, digits, `_` and `-` so they can
/// be embedded in store filters and terminal targets without quoting.
pub fn validate_instance_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidInstanceName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("must be at most 64 characters"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(invalid(&format!("contains disallowed character {c:?}")));
    }
    Ok(())
}

/// Pairs `(shorter, longer)` where the shorter name's tag would also match
/// requests addressed to the longer one.
pub fn find_collisions<'a>(names: &[&'a str]) -> Vec<(&'a str, &'a str)> {
    let mut out = Vec::new();
    for (i, a) in names.iter().enumerate() {
        for b in &names[i + 1..] {
            let (la, lb) = (a.to_lowercase(), b.to_lowercase());
            if la == lb {
                continue;
            }
            if lb.contains(&la) {
                out.push((*a, *b));
            } else if la.contains(&lb) {
                out.push((*b, *a));
            }
        }
    }
    out
}

/// `PostgREST` `ilike` operand matching any text that contains the tag.
///
/// `_` and `%` are LIKE wildcards and `*` is `PostgREST`'s wildcard alias;
/// validated names never contain the latter two but may contain `_`.
pub fn ilike_operand(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len() + 4);
    for c in tag_for(name).chars() {
        if matches!(c, '\\' | '_' | '%') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    format!("*{escaped}*")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_is_case_insensitive() {
        assert!(matches("@Coder please fix", "coder"));
        assert!(matches("hey @CODER", "Coder"));
        assert!(matches("first line\n@coder second", "coder"));
        assert!(!matches("coder without tag", "coder"));
        assert!(!matches("@ideas only", "coder"));
    }

    #[test]
    fn matches_folds_ascii_only() {
        // KELVIN SIGN lowercases to `k` under Unicode rules but not ASCII ones.
        assert!(!matches("@\u{212A}ai hello", "kai"));
        assert!(matches("@KAI hello", "kai"));
    }

    #[test]
    fn substring_names_collide() {
        // Known limitation: `@code` is a substring of `@coder`.
        assert!(matches("@coder fix it", "code"));
        assert_eq!(
            find_collisions(&["coder", "ideas", "code"]),
            vec![("code", "coder")]
        );
        assert!(find_collisions(&["ideas", "reviewer", "coder"]).is_empty());
    }

    #[test]
    fn strip_tag_removes_all_occurrences() {
        assert_eq!(strip_tag("@coder fix the bug", "coder"), "fix the bug");
        assert_eq!(strip_tag("please @CODER   fix @coder it", "coder"), "please fix it");
        assert_eq!(strip_tag("  @coder  ", "coder"), "");
        assert_eq!(strip_tag("@ideas stays", "coder"), "@ideas stays");
    }

    #[test]
    fn strip_tag_escapes_name() {
        assert_eq!(strip_tag("@a-b go", "a-b"), "go");
        assert_eq!(strip_tag("@axb go", "a.b"), "@axb go");
    }

    #[test]
    fn validate_rejects_bad_names() {
        assert!(validate_instance_name("coder").is_ok());
        assert!(validate_instance_name("code_review-2").is_ok());
        assert!(validate_instance_name("").is_err());
        assert!(validate_instance_name("two words").is_err());
        assert!(validate_instance_name("a*").is_err());
        assert!(validate_instance_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn ilike_operand_escapes_like_wildcards() {
        assert_eq!(ilike_operand("coder"), "*@coder*");
        assert_eq!(ilike_operand("my_bot"), r"*@my\_bot*");
    }
}
