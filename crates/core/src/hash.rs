//! Content digests used for function and file identity.
//!
//! All digests are xxh3-64 rendered as lowercase hex. Metadata keeps the full
//! 16 characters for change detection; records carry an 8 character prefix.

use std::path::Path;
use xxhash_rust::xxh3::xxh3_64;

/// Length of the identity digests embedded in records.
pub const IDENTITY_DIGEST_LEN: usize = 8;
/// Length of the file-change digest stored in metadata.
pub const CHANGE_DIGEST_LEN: usize = 16;

/// Comment and literal syntax used when normalizing a body before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommentStyle {
    /// `// line` and `/* block */`; `'`, `"` and `` ` `` quote literals
    #[default]
    CFamily,
    /// C-family comments; `'` opens a char literal or a lifetime
    Rust,
    /// `# line`
    Hash,
}

impl CommentStyle {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("rs") => CommentStyle::Rust,
            Some("py" | "pyi" | "rb" | "sh" | "bash" | "pl" | "r" | "toml" | "yaml" | "yml") => {
                CommentStyle::Hash
            }
            _ => CommentStyle::CFamily,
        }
    }

    fn string_delimiters(&self) -> &'static [char] {
        match self {
            CommentStyle::CFamily => &['"', '\'', '`'],
            CommentStyle::Rust => &['"'],
            CommentStyle::Hash => &['"', '\''],
        }
    }

    fn has_c_comments(&self) -> bool {
        matches!(self, CommentStyle::CFamily | CommentStyle::Rust)
    }
}

#[derive(Clone, Copy)]
enum State {
    Code,
    LineComment,
    BlockComment,
    Literal(char),
}

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

pub struct HashService;

impl HashService {
    /// Strip comments and collapse whitespace so formatting-only edits hash identically.
    ///
    /// A dropped comment leaves nothing behind, except a single space when it
    /// was the only thing separating two identifier characters. In Rust
    /// `'x'` and `'\''` are char literals while `'a` is a lifetime.
    pub fn normalize_body(text: &str, style: CommentStyle) -> String {
        let chars: Vec<char> = text.chars().collect();
        let delimiters = style.string_delimiters();
        let mut out = String::with_capacity(text.len());
        let mut state = State::Code;
        let mut after_comment = false;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();
            match state {
                State::Code => {
                    let comment = match (c, next) {
                        ('/', Some('/')) if style.has_c_comments() => Some((State::LineComment, 2)),
                        ('/', Some('*')) if style.has_c_comments() => Some((State::BlockComment, 2)),
                        ('#', _) if style == CommentStyle::Hash => Some((State::LineComment, 1)),
                        _ => None,
                    };
                    if let Some((comment, width)) = comment {
                        state = comment;
                        i += width;
                        continue;
                    }

                    if after_comment {
                        after_comment = false;
                        if is_ident(c) && out.chars().last().is_some_and(is_ident) {
                            out.push(' ');
                        }
                    }

                    if c == '\'' && style == CommentStyle::Rust {
                        let run = chars[i + 1..].iter().take_while(|ch| is_ident(**ch)).count();
                        if run > 0 && chars.get(i + 1 + run) != Some(&'\'') {
                            // lifetime or loop label
                            out.extend(&chars[i..=i + run]);
                            i += run + 1;
                            continue;
                        }
                        state = State::Literal(c);
                    } else if delimiters.contains(&c) {
                        state = State::Literal(c);
                    }
                    out.push(c);
                }
                State::LineComment => {
                    if c == '\n' {
                        state = State::Code;
                        after_comment = false;
                        out.push('\n');
                    }
                }
                State::BlockComment => {
                    if c == '*' && next == Some('/') {
                        state = State::Code;
                        after_comment = true;
                        i += 2;
                        continue;
                    }
                }
                State::Literal(quote) => {
                    out.push(c);
                    if c == '\\' {
                        if let Some(escaped) = next {
                            out.push(escaped);
                            i += 2;
                            continue;
                        }
                    } else if c == quote
                        || (c == '\n' && quote == '\'' && style.has_c_comments())
                    {
                        // single-quoted C-family literals never span lines
                        state = State::Code;
                    }
                }
            }
            i += 1;
        }

        out.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// `hash_function`: 8 hex chars of the normalized body.
    pub fn function_hash(body: &str, style: CommentStyle) -> String {
        let normalized = Self::normalize_body(body, style);
        Self::hex(normalized.as_bytes(), IDENTITY_DIGEST_LEN)
    }

    /// `hash_file`: 8 hex chars of the raw file bytes.
    pub fn file_hash(content: &[u8]) -> String {
        Self::hex(content, IDENTITY_DIGEST_LEN)
    }

    /// Metadata `fileHashes` value: 16 hex chars of the raw file bytes.
    pub fn file_change_digest(content: &[u8]) -> String {
        Self::hex(content, CHANGE_DIGEST_LEN)
    }

    fn hex(bytes: &[u8], len: usize) -> String {
        let mut digest = format!("{:016x}", xxh3_64(bytes));
        digest.truncate(len);
        digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_lengths() {
        assert_eq!(HashService::file_hash(b"fn main() {}").len(), 8);
        assert_eq!(HashService::file_change_digest(b"fn main() {}").len(), 16);
        assert_eq!(
            HashService::function_hash("{ 1 }", CommentStyle::CFamily).len(),
            8
        );
    }

    #[test]
    fn test_identity_digest_is_prefix_of_change_digest() {
        let content = b"pub fn add(a: i32, b: i32) -> i32 { a + b }";
        let full = HashService::file_change_digest(content);
        assert!(full.starts_with(&HashService::file_hash(content)));
    }

    #[test]
    fn test_whitespace_only_edit_keeps_hash() {
        let a = "fn add(a: i32, b: i32) -> i32 {\n    a + b\n}";
        let b = "fn add(a: i32,   b: i32) -> i32 {\n\n\t\ta +   b\n    }\n";
        assert_eq!(
            HashService::function_hash(a, CommentStyle::CFamily),
            HashService::function_hash(b, CommentStyle::CFamily)
        );
    }

    #[test]
    fn test_comment_only_edit_keeps_hash() {
        let a = "fn add(a: i32, b: i32) -> i32 {\n    a + b\n}";
        let b = "fn add(a: i32, b: i32) -> i32 {\n    // sum\n    a + /* inline */ b\n}";
        assert_eq!(
            HashService::function_hash(a, CommentStyle::CFamily),
            HashService::function_hash(b, CommentStyle::CFamily)
        );
    }

    #[test]
    fn test_comment_between_tokens_keeps_hash() {
        let hash = |body: &str| HashService::function_hash(body, CommentStyle::CFamily);
        assert_eq!(
            hash("fn f(x: i32) { call(x) }"),
            hash("fn f(x: i32) { call(/*note*/x) }")
        );
        assert_eq!(hash("{ a+b }"), hash("{ a/*c*/+b }"));
        assert_eq!(hash("{ f(x) }"), hash("{ f(/*c*/x) }"));
        assert_eq!(hash("{ call(x) }"), hash("{ call(x)// trailing\n}"));
    }

    #[test]
    fn test_comment_between_identifiers_keeps_them_apart() {
        assert_eq!(
            HashService::normalize_body("return/*c*/value", CommentStyle::CFamily),
            "return value"
        );
        assert_ne!(
            HashService::function_hash("{ a b }", CommentStyle::CFamily),
            HashService::function_hash("{ ab }", CommentStyle::CFamily)
        );
    }

    #[test]
    fn test_char_literals_do_not_swallow_comments() {
        let a = "fn f() -> char {\n    let c = '\"';\n    c // old note\n}";
        let b = "fn f() -> char {\n    let c = '\"';\n    c // new note\n}";
        for style in [CommentStyle::Rust, CommentStyle::CFamily] {
            assert_eq!(
                HashService::function_hash(a, style),
                HashService::function_hash(b, style)
            );
        }

        let quote = "fn q() {\n    let c = '\\'';\n    c /* x */\n}";
        assert_eq!(
            HashService::normalize_body(quote, CommentStyle::Rust),
            "fn q() { let c = '\\''; c }"
        );
    }

    #[test]
    fn test_lifetimes_are_plain_code() {
        let body = "fn first<'a>(s: &'a str) -> &'a str { s // keep\n}";
        assert_eq!(
            HashService::normalize_body(body, CommentStyle::Rust),
            "fn first<'a>(s: &'a str) -> &'a str { s }"
        );
    }

    #[test]
    fn test_single_quoted_strings_keep_comment_markers() {
        assert_eq!(
            HashService::normalize_body("const u = 'http://x'; // tail", CommentStyle::CFamily),
            "const u = 'http://x';"
        );
    }

    #[test]
    fn test_hash_style_comments() {
        let a = "def f(x):\n    return x + 1";
        let b = "def f(x):  # increment\n    # body\n    return x + 1";
        assert_eq!(
            HashService::function_hash(a, CommentStyle::Hash),
            HashService::function_hash(b, CommentStyle::Hash)
        );
    }

    #[test]
    fn test_comment_markers_inside_strings_are_kept() {
        let normalized =
            HashService::normalize_body(r#"let url = "http://example.com"; // tail"#, CommentStyle::CFamily);
        assert_eq!(normalized, r#"let url = "http://example.com";"#);

        let escaped = HashService::normalize_body(r#"let s = "a\"//b";"#, CommentStyle::CFamily);
        assert_eq!(escaped, r#"let s = "a\"//b";"#);
    }

    #[test]
    fn test_body_change_changes_hash() {
        assert_ne!(
            HashService::function_hash("{ a + b }", CommentStyle::CFamily),
            HashService::function_hash("{ a - b }", CommentStyle::CFamily)
        );
    }

    #[test]
    fn test_style_from_path() {
        assert_eq!(CommentStyle::from_path(Path::new("a.py")), CommentStyle::Hash);
        assert_eq!(CommentStyle::from_path(Path::new("a.rs")), CommentStyle::Rust);
        assert_eq!(CommentStyle::from_path(Path::new("a.ts")), CommentStyle::CFamily);
        assert_eq!(CommentStyle::from_path(Path::new("Makefile")), CommentStyle::CFamily);
    }
}
