//! Shell-word quoting and atom-name validation.
//!
//! Everything the control-plane runs remotely is assembled into a single
//! shell command line, so every interpolated value goes through [`quote`]
//! first. Caller-supplied names that become Erlang atoms in generated code
//! pass [`is_valid_atom`] before any remote call is issued.

use std::borrow::Cow;

use shell_escape::unix::escape;

/// Quote `s` as one POSIX shell word.
///
/// Built on [`shell_escape::unix::escape`], which single-quotes anything
/// containing shell metacharacters. `escape` leaves clean words bare;
/// command assembly here wants every interpolated value as a quoted word,
/// so those are wrapped too. Feeding the result through `/bin/sh -c`
/// reproduces `s` byte-for-byte.
pub fn quote(s: &str) -> String {
    match escape(Cow::Borrowed(s)) {
        // Borrowed means escape() found nothing to do; safe to wrap as-is.
        Cow::Borrowed(bare) => format!("'{bare}'"),
        Cow::Owned(quoted) => quoted,
    }
}

/// Validate a caller-supplied Erlang atom name.
///
/// Accepts `[A-Za-z_][A-Za-z0-9_.:]*`. This is the only sanitisation applied
/// to names (modules, gen-server registrations, node names) that end up
/// embedded in generated Erlang source.
pub fn is_valid_atom(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':'))
}

/// Return a slice of `text` containing at most `max_chars` Unicode scalar
/// values.
pub fn truncate_chars_slice(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // quote tests

    #[test]
    fn quote_plain_word() {
        assert_eq!(quote("hello"), "'hello'");
    }

    #[test]
    fn quote_empty_string() {
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn quote_single_quote() {
        assert_eq!(quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn quote_only_quotes() {
        assert_eq!(quote("''"), "''\\'''\\'''");
    }

    #[test]
    fn quote_leaves_metacharacters_alone() {
        // Everything except quotes and bangs passes through untouched; the
        // surrounding single quotes neutralise it.
        assert_eq!(quote("$HOME `id` \"x\" \\n"), "'$HOME `id` \"x\" \\n'");
    }

    #[test]
    fn quote_escapes_history_expansion_bang() {
        assert_eq!(quote("a!b"), "'a'\\!'b'");
    }

    // is_valid_atom tests

    #[test]
    fn atom_simple_names() {
        assert!(is_valid_atom("gen_server"));
        assert!(is_valid_atom("my_mod_v2"));
        assert!(is_valid_atom("_private"));
    }

    #[test]
    fn atom_elixir_module_names() {
        assert!(is_valid_atom("Elixir.MyApp.Worker"));
    }

    #[test]
    fn atom_colon_allowed() {
        assert!(is_valid_atom("erlang:node"));
    }

    #[test]
    fn atom_rejects_spaces() {
        assert!(!is_valid_atom("has space"));
    }

    #[test]
    fn atom_rejects_empty() {
        assert!(!is_valid_atom(""));
    }

    #[test]
    fn atom_rejects_leading_digit() {
        assert!(!is_valid_atom("9abc"));
    }

    #[test]
    fn atom_rejects_shell_metacharacters() {
        assert!(!is_valid_atom("mod;rm -rf /"));
        assert!(!is_valid_atom("mod$(id)"));
        assert!(!is_valid_atom("mod'"));
    }

    // truncate_chars_slice tests

    #[test]
    fn truncate_slice_ascii() {
        assert_eq!(truncate_chars_slice("hello world", 5), "hello");
    }

    #[test]
    fn truncate_slice_shorter_than_max() {
        assert_eq!(truncate_chars_slice("hi", 80), "hi");
    }

    #[test]
    fn truncate_slice_multibyte_boundary() {
        assert_eq!(truncate_chars_slice("中文测试", 2), "中文");
    }
}
