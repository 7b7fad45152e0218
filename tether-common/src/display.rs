use std::{
    borrow::Cow,
    fmt::{Display, Formatter},
    iter::Peekable,
    str::Chars,
};

use tracing::Value;

/// Longest sanitized value written to a log record, in characters.
pub const MAX_LOGGED_CHARS: usize = 1024;

/// Wrapper that makes `Option<T>` implement `Display`.
pub struct DisplayOption<'a, T>(&'a Option<T>);

impl<'a, T: Display> Display for DisplayOption<'a, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(inner) => write!(f, "{}", inner),
            None => write!(f, "None"),
        }
    }
}

/// Convenience function so you can write `%opt!(value)` in `tracing` logs.
pub fn opt<T: Display>(val: &Option<T>) -> impl Value + '_ {
    tracing::field::display(DisplayOption(val))
}

/// Removes control characters and terminal escape sequences from `input`.
///
/// Covers CR and LF (which would let a remote party forge log records), every other C0/C1
/// control character, and ANSI CSI, OSC and string sequences (which would let it restyle or
/// rewrite a terminal). Printable text is kept as is.
pub fn sanitize(input: &str) -> Cow<'_, str> {
    if !input.chars().any(char::is_control) {
        return Cow::Borrowed(input);
    }
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => skip_escape(&mut chars),
            '\u{9b}' => skip_csi(&mut chars),
            '\u{9d}' | '\u{90}' | '\u{98}' | '\u{9e}' | '\u{9f}' => skip_string(&mut chars),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn skip_escape(chars: &mut Peekable<Chars<'_>>) {
    match chars.next() {
        Some('[') => skip_csi(chars),
        Some(']' | 'P' | 'X' | '^' | '_') => skip_string(chars),
        // nF sequences: intermediates followed by one final byte, e.g. `ESC ( B`
        Some(c) if ('\u{20}'..='\u{2f}').contains(&c) => {
            while chars
                .next_if(|c| ('\u{20}'..='\u{2f}').contains(c))
                .is_some()
            {}
            chars.next();
        }
        _ => {}
    }
}

fn skip_csi(chars: &mut Peekable<Chars<'_>>) {
    for c in chars.by_ref() {
        if ('\u{40}'..='\u{7e}').contains(&c) {
            break;
        }
    }
}

/// Skips an OSC/DCS style string, terminated by BEL or ST.
fn skip_string(chars: &mut Peekable<Chars<'_>>) {
    while let Some(c) = chars.next() {
        match c {
            '\u{07}' | '\u{9c}' => break,
            '\u{1b}' if chars.peek() == Some(&'\\') => {
                chars.next();
                break;
            }
            _ => {}
        }
    }
}

/// Sanitized, length capped view of an untrusted string.
pub struct Sanitized<'a>(&'a str);

impl<'a> Display for Sanitized<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let clean = sanitize(self.0);
        match clean.char_indices().nth(MAX_LOGGED_CHARS) {
            Some((cut, _)) => write!(f, "{}...", &clean[..cut]),
            None => f.write_str(&clean),
        }
    }
}

/// Use for every log field derived from remote input: `%sanitized(&payload)`.
pub fn sanitized(val: &str) -> impl Value + '_ {
    tracing::field::display(Sanitized(val))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::plain("hello world", "hello world")]
    #[case::newlines("line1\nline2\r\nline3", "line1line2line3")]
    #[case::forged_record("ok\n2024-01-01 INFO admin logged in", "ok2024-01-01 INFO admin logged in")]
    #[case::color("\u{1b}[31mred\u{1b}[0m text", "red text")]
    #[case::cursor("a\u{1b}[2Kb\u{1b}[1;1Hc", "abc")]
    #[case::osc_title("\u{1b}]0;pwned\u{07}after", "after")]
    #[case::osc_st("\u{1b}]8;;http://x\u{1b}\\link", "link")]
    #[case::charset("\u{1b}(Bplain", "plain")]
    #[case::c1_csi("x\u{9b}31my", "xy")]
    #[case::other_controls("tab\there\u{0}\u{7f}", "tabhere")]
    #[case::unicode("naïve ✓", "naïve ✓")]
    fn test_sanitize(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize(input), expected);
    }

    #[test]
    fn test_sanitize_borrows_clean_input() {
        assert!(matches!(sanitize("clean"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_sanitized_display_caps_length() {
        let long = "x".repeat(MAX_LOGGED_CHARS + 10);

        let rendered = Sanitized(&long).to_string();

        assert_eq!(rendered.len(), MAX_LOGGED_CHARS + 3);
        assert!(rendered.ends_with("..."));
    }

    #[test]
    fn test_opt_display() {
        assert_eq!(DisplayOption(&Some(3)).to_string(), "3");
        assert_eq!(DisplayOption::<u8>(&None).to_string(), "None");
    }
}
