//! Command deny-list.
//!
//! Not a sandbox. It only stops the handful of commands that would brick the
//! device or take it offline. Matching is case-insensitive on a copy of the
//! command with runs of whitespace collapsed to one space.

/// How a pattern must sit inside the normalised command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    /// Plain substring.
    Substring,
    /// Substring not glued to other word characters (`halt` but not `asphalt`).
    Word,
    /// Path target that must end there: `rm -rf /` but not `rm -rf /tmp/x`.
    Root,
    /// Substring of the command with all whitespace removed.
    Compact,
}

#[derive(Debug, Clone)]
struct Pattern {
    text: String,
    rule: Rule,
}

const BUILTIN: &[(&str, Rule)] = &[
    ("rm -rf /", Rule::Root),
    ("rm -fr /", Rule::Root),
    ("rm -rf /*", Rule::Substring),
    ("rm -fr /*", Rule::Substring),
    ("rm -rf ~", Rule::Root),
    ("rm -rf ~/", Rule::Root),
    ("mkfs", Rule::Word),
    ("dd if=", Rule::Word),
    ("of=/dev/sd", Rule::Substring),
    ("> /dev/sd", Rule::Substring),
    (">/dev/sd", Rule::Substring),
    (":(){", Rule::Compact),
    ("shutdown", Rule::Word),
    ("reboot", Rule::Word),
    ("poweroff", Rule::Word),
    ("halt", Rule::Word),
    ("init 0", Rule::Word),
    ("init 6", Rule::Word),
];

#[derive(Debug, Clone)]
pub struct DenyList {
    enabled: bool,
    patterns: Vec<Pattern>,
}

impl DenyList {
    /// Built-in patterns plus `extra` substrings.
    pub fn new(enabled: bool, extra: &[String]) -> Self {
        let mut patterns: Vec<Pattern> = BUILTIN
            .iter()
            .map(|(text, rule)| Pattern {
                text: (*text).to_string(),
                rule: *rule,
            })
            .collect();
        patterns.extend(extra.iter().map(|e| normalize(e)).filter(|e| !e.is_empty()).map(|text| {
            Pattern {
                text,
                rule: Rule::Substring,
            }
        }));
        Self { enabled, patterns }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            patterns: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The first pattern `command` matches, if any.
    pub fn check(&self, command: &str) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        let normalized = normalize(command);
        let compact: String = normalized.chars().filter(|c| !c.is_whitespace()).collect();

        self.patterns
            .iter()
            .find(|p| match p.rule {
                Rule::Substring => normalized.contains(&p.text),
                Rule::Compact => compact.contains(&p.text),
                Rule::Word | Rule::Root => find_bounded(&normalized, &p.text, p.rule),
            })
            .map(|p| p.text.as_str())
    }
}

impl Default for DenyList {
    fn default() -> Self {
        Self::new(true, &[])
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn is_word_boundary(c: Option<char>) -> bool {
    c.is_none_or(|c| !is_word_char(c))
}

fn is_path_end(c: Option<char>) -> bool {
    c.is_none_or(|c| c.is_whitespace() || matches!(c, ';' | '&' | '|' | '*' | ')' | '`'))
}

/// True if `needle` occurs in `hay` without being glued to surrounding words.
/// `Root` needles must additionally end where the path argument ends.
fn find_bounded(hay: &str, needle: &str, rule: Rule) -> bool {
    hay.match_indices(needle).any(|(i, m)| {
        let before = hay[..i].chars().next_back();
        let after = hay[i + m.len()..].chars().next();
        let lead_ok = !needle.starts_with(is_word_char) || is_word_boundary(before);
        let trail_ok = match rule {
            Rule::Root => is_path_end(after),
            _ => !needle.ends_with(is_word_char) || is_word_boundary(after),
        };
        lead_ok && trail_ok
    })
}
