//! Command Denylist
//!
//! Destructive command patterns rejected before anything reaches the
//! interpreter.

/// Built-in patterns. Matching is case-insensitive on whitespace-normalized
/// text, and a pattern only matches on word boundaries so `rm -rf /` does
/// not catch `rm -rf /tmp/build`.
const BUILTIN_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -fr /",
    "rm -fr /*",
    "rm -rf --no-preserve-root",
    "rm -rf ~",
    "mkfs",
    // Prefix: every `mkfs.<fs>` helper.
    "mkfs.",
    "dd if=/dev/zero of=/dev/",
    "dd if=/dev/random of=/dev/",
    "dd if=/dev/urandom of=/dev/",
    "> /dev/sda",
    "> /dev/nvme0n1",
    "chmod -r 777 /",
    ":(){ :|:& };:",
    ":(){:|:&};:",
    "shutdown",
    "reboot",
    "poweroff",
    "halt",
    "init 0",
    "init 6",
    "systemctl poweroff",
    "systemctl reboot",
    "format c:",
];

/// Compiled denylist.
#[derive(Debug, Clone)]
pub struct Denylist {
    patterns: Vec<String>,
}

impl Denylist {
    /// Built-in patterns plus `extra`.
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = BUILTIN_PATTERNS
            .iter()
            .map(|p| normalize(p))
            .chain(extra.into_iter().map(|p| normalize(p.as_ref())))
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    /// The first pattern `command` matches, if any.
    pub fn check(&self, command: &str) -> Option<&str> {
        let normalized = normalize(command);
        self.patterns
            .iter()
            .find(|pattern| contains_bounded(&normalized, pattern))
            .map(String::as_str)
    }
}

impl Default for Denylist {
    fn default() -> Self {
        Self::new(std::iter::empty::<&str>())
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b'~')
}

/// Substring match where the pattern is not glued to surrounding word
/// characters. The left edge is checked when the pattern starts with an
/// alphanumeric; the right edge when it ends in a bare command word or a
/// bare root path (` /`, ` ~`). Device and path prefixes match as prefixes.
fn contains_bounded(haystack: &str, pattern: &str) -> bool {
    let hay = haystack.as_bytes();
    let pat = pattern.as_bytes();
    let (Some(&first), Some(&last)) = (pat.first(), pat.last()) else {
        return false;
    };

    let check_left = first.is_ascii_alphanumeric();
    let check_right = (last.is_ascii_alphabetic() && !pattern.contains('/'))
        || pattern.ends_with(" /")
        || pattern.ends_with(" ~");

    let mut start = 0;
    while let Some(pos) = haystack[start..].find(pattern) {
        let begin = start + pos;
        let end = begin + pat.len();

        let left_ok = !check_left || begin == 0 || !is_word_byte(hay[begin - 1]);
        let right_ok = !check_right || end == hay.len() || !is_word_byte(hay[end]);
        if left_ok && right_ok {
            return true;
        }

        // Advance past this occurrence's first char, staying on a char boundary.
        start = begin + haystack[begin..].chars().next().map_or(1, char::len_utf8);
    }
    false
}
