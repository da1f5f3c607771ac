//! Regex based function extractor used by the `fnindex` binary.
//!
//! Recognizes function definitions line by line and finds the end of each
//! body by brace matching (Rust, TypeScript, JavaScript, Go) or indentation
//! (Python). Good enough for change tracking; not a parser.
use anyhow::{Context, Result};
use fnindex_core::{CommentStyle, Extractor, FunctionRecord, HashService};
use regex::{Captures, Regex};
use std::path::Path;

/// Supported languages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Rust,
    TypeScript,
    JavaScript,
    Python,
    Go,
}

impl Language {
    /// Guess the language from the file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        let language = match ext {
            "rs" => Language::Rust,
            "ts" | "tsx" | "mts" | "cts" => Language::TypeScript,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "py" | "pyi" => Language::Python,
            "go" => Language::Go,
            _ => return None,
        };
        Some(language)
    }
}

/// How to read one kind of definition line.
struct DefinitionPattern {
    regex: Regex,
    name: usize,
    exported: Option<usize>,
    is_async: Option<usize>,
}

impl DefinitionPattern {
    fn new(pattern: &str, name: usize, exported: Option<usize>, is_async: Option<usize>) -> Result<Self> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            name,
            exported,
            is_async,
        })
    }
}

struct Definition {
    identifier: String,
    exported: bool,
    is_async: bool,
}

pub struct RegexExtractor {
    domain: String,
    rust: Vec<DefinitionPattern>,
    script: Vec<DefinitionPattern>,
    python: Vec<DefinitionPattern>,
    go: Vec<DefinitionPattern>,
}

fn has(caps: &Captures<'_>, group: Option<usize>) -> bool {
    group.map_or(false, |g| caps.get(g).is_some())
}

impl RegexExtractor {
    pub fn new(domain: impl Into<String>) -> Result<Self> {
        Ok(Self {
            domain: domain.into(),
            rust: vec![DefinitionPattern::new(
                r#"^\s*(pub(?:\([^)]*\))?\s+)?(?:default\s+)?(?:const\s+)?(async\s+)?(?:unsafe\s+)?(?:extern\s+"[^"]*"\s+)?fn\s+(\w+)"#,
                3,
                Some(1),
                Some(2),
            )?],
            script: vec![
                // function declarations
                DefinitionPattern::new(
                    r"^\s*(export\s+(?:default\s+)?)?(async\s+)?function\s*\*?\s*(\w+)",
                    3,
                    Some(1),
                    Some(2),
                )?,
                // arrow functions and function expressions bound to a name
                DefinitionPattern::new(
                    r"^\s*(export\s+)?(?:const|let|var)\s+(\w+)\s*(?::[^=]+)?=\s*(async\s+)?(?:function\b|\([^)]*\)\s*(?::\s*[^=]+)?=>|\w+\s*=>)",
                    2,
                    Some(1),
                    Some(3),
                )?,
                // class methods
                DefinitionPattern::new(
                    r"^\s+(?:(?:public|private|protected|static|readonly|override)\s+)*(async\s+)?(\w+)\s*(?:<[^>]*>)?\([^)]*\)\s*(?::\s*[^{]+)?\{",
                    2,
                    None,
                    Some(1),
                )?,
            ],
            python: vec![DefinitionPattern::new(
                r"^\s*(async\s+)?def\s+(\w+)",
                2,
                None,
                Some(1),
            )?],
            go: vec![DefinitionPattern::new(
                r"^func\s+(?:\([^)]*\)\s*)?(\w+)",
                1,
                None,
                None,
            )?],
        })
    }

    fn patterns(&self, language: Language) -> &[DefinitionPattern] {
        match language {
            Language::Rust => &self.rust,
            Language::TypeScript | Language::JavaScript => &self.script,
            Language::Python => &self.python,
            Language::Go => &self.go,
        }
    }

    fn match_line(&self, language: Language, line: &str) -> Option<Definition> {
        self.patterns(language).iter().find_map(|pattern| {
            let caps = pattern.regex.captures(line)?;
            let identifier = caps.get(pattern.name)?.as_str().to_string();
            if language != Language::Rust && is_keyword(&identifier) {
                return None;
            }
            let exported = match language {
                Language::Python => !identifier.starts_with('_'),
                Language::Go => identifier.starts_with(|c: char| c.is_ascii_uppercase()),
                _ => has(&caps, pattern.exported),
            };
            Some(Definition {
                is_async: has(&caps, pattern.is_async),
                exported,
                identifier,
            })
        })
    }

    /// Extract records from already loaded text.
    pub fn extract_source(&self, path: &Path, content: &str) -> Vec<FunctionRecord> {
        let Some(language) = Language::from_path(path) else {
            return Vec::new();
        };
        let style = CommentStyle::from_path(path);
        let hash_file = HashService::file_hash(content.as_bytes());
        let lines: Vec<&str> = content.lines().collect();

        let mut records = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            let Some(definition) = self.match_line(language, line) else {
                continue;
            };
            let end = match language {
                Language::Python => indented_block_end(&lines, index),
                _ => brace_block_end(&lines, index),
            };
            let body = lines[index..=end].join("\n");

            records.push(FunctionRecord {
                file: path.display().to_string(),
                identifier: definition.identifier,
                signature: signature_of(line),
                start_line: index as u32 + 1,
                end_line: end as u32 + 1,
                hash_function: HashService::function_hash(&body, style),
                hash_file: hash_file.clone(),
                exported: definition.exported,
                is_async: definition.is_async,
                metrics: serde_json::json!({ "lines": end - index + 1 }),
                domain: self.domain.clone(),
            });
        }
        records
    }
}

impl Extractor for RegexExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<FunctionRecord>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(self.extract_source(path, &content))
    }
}

fn is_keyword(word: &str) -> bool {
    matches!(
        word,
        "if" | "for" | "while" | "switch" | "catch" | "return" | "function" | "constructor"
    )
}

fn signature_of(line: &str) -> String {
    line.trim()
        .trim_end_matches('{')
        .trim_end_matches(':')
        .trim_end()
        .to_string()
}

/// Last line of a brace-delimited body starting at `start`.
///
/// A `;` before the first `{` means a declaration without a body.
fn brace_block_end(lines: &[&str], start: usize) -> usize {
    let mut depth = 0usize;
    let mut opened = false;
    let mut in_string: Option<char> = None;

    for (offset, line) in lines[start..].iter().enumerate() {
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            if let Some(quote) = in_string {
                if c == '\\' {
                    chars.next();
                } else if c == quote {
                    in_string = None;
                }
                continue;
            }
            match c {
                '"' | '`' => in_string = Some(c),
                '/' if chars.peek() == Some(&'/') => break,
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' if opened => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return start + offset;
                    }
                }
                ';' if !opened => return start + offset,
                _ => {}
            }
        }
    }
    if opened {
        lines.len() - 1
    } else {
        start
    }
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Last non-blank line indented deeper than the `def` at `start`.
fn indented_block_end(lines: &[&str], start: usize) -> usize {
    let base = indent_of(lines[start]);
    let mut end = start;
    for (offset, line) in lines[start + 1..].iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if indent_of(line) <= base {
            break;
        }
        end = start + 1 + offset;
    }
    end
}
