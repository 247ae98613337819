//! Exclusion rules: path globs compiled once, matched per path component.
//!
//! ## Matching rules
//! - A pattern is split on `/` into components; `*` and `?` never cross a
//!   component boundary.
//! - Supported syntax per component: `*`, `?`, `[abc]`, `[a-z]`, `[!abc]`.
//! - A relative pattern (`*.log`, `cache/*`) matches the trailing components
//!   of a path, at any depth.
//! - An absolute pattern (`/var/log`, `/proc/*`) must match the whole path.
//!
//! The same set is applied to directories during capture; a matching directory
//! is pruned together with everything beneath it.

use std::path::{Component, Path};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("empty exclusion pattern")]
    Empty,

    #[error("unterminated character class in pattern '{0}'")]
    UnterminatedClass(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    AnySeq,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

impl Token {
    fn matches(&self, c: char) -> bool {
        match self {
            Token::Literal(l) => *l == c,
            Token::AnyChar => true,
            Token::AnySeq => true,
            Token::Class { negated, ranges } => {
                let hit = ranges.iter().any(|(lo, hi)| *lo <= c && c <= *hi);
                hit != *negated
            }
        }
    }
}

/// A single compiled exclusion glob.
#[derive(Debug, Clone)]
pub struct ExclusionRule {
    pattern: String,
    absolute: bool,
    components: Vec<Vec<Token>>,
}

impl ExclusionRule {
    /// Compile a glob pattern.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let trimmed = pattern.trim();
        let absolute = trimmed.starts_with('/');
        let components = trimmed
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .map(|c| compile_component(c, pattern))
            .collect::<Result<Vec<_>, _>>()?;

        if components.is_empty() {
            return Err(PatternError::Empty);
        }

        Ok(Self {
            pattern: pattern.to_string(),
            absolute,
            components,
        })
    }

    /// The pattern as written in configuration.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Test a path against this rule.
    pub fn matches(&self, path: &Path) -> bool {
        let names = path_names(path);
        self.matches_names(path.has_root(), &names)
    }

    fn matches_names(&self, rooted: bool, names: &[String]) -> bool {
        if self.absolute {
            if !rooted || names.len() != self.components.len() {
                return false;
            }
        } else if names.len() < self.components.len() {
            return false;
        }

        let tail = &names[names.len() - self.components.len()..];
        self.components
            .iter()
            .zip(tail)
            .all(|(tokens, name)| match_component(tokens, name))
    }
}

/// The immutable set of exclusion rules for a run.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    rules: Vec<ExclusionRule>,
}

impl ExclusionSet {
    /// Compile every pattern; fails on the first invalid one.
    pub fn new<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = patterns
            .into_iter()
            .map(|p| ExclusionRule::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// An empty set that excludes nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if any rule matches `path`.
    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let names = path_names(path);
        let rooted = path.has_root();
        self.rules.iter().any(|r| r.matches_names(rooted, &names))
    }

    /// Patterns in configuration order, as recorded in a birth certificate.
    pub fn patterns(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.pattern.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn path_names(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

fn compile_component(component: &str, pattern: &str) -> Result<Vec<Token>, PatternError> {
    let chars: Vec<char> = component.chars().collect();
    let mut tokens = Vec::with_capacity(chars.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => {
                // Runs of `*` collapse; `**` behaves like `*` within a component.
                if tokens.last() != Some(&Token::AnySeq) {
                    tokens.push(Token::AnySeq);
                }
                i += 1;
            }
            '?' => {
                tokens.push(Token::AnyChar);
                i += 1;
            }
            '[' => {
                let (token, next) = compile_class(&chars, i + 1)
                    .ok_or_else(|| PatternError::UnterminatedClass(pattern.to_string()))?;
                tokens.push(token);
                i = next;
            }
            c => {
                tokens.push(Token::Literal(c));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

/// Parse a `[...]` class starting just after the `[`. Returns the token and
/// the index after the closing `]`.
fn compile_class(chars: &[char], start: usize) -> Option<(Token, usize)> {
    let mut i = start;
    let negated = matches!(chars.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }

    let mut ranges = Vec::new();
    let mut first = true;
    loop {
        let c = *chars.get(i)?;
        if c == ']' && !first {
            return Some((Token::Class { negated, ranges }, i + 1));
        }
        first = false;

        if chars.get(i + 1) == Some(&'-') && chars.get(i + 2).is_some_and(|h| *h != ']') {
            ranges.push((c, chars[i + 2]));
            i += 3;
        } else {
            ranges.push((c, c));
            i += 1;
        }
    }
}

/// Wildcard match with single-star backtracking.
fn match_component(tokens: &[Token], name: &str) -> bool {
    let text: Vec<char> = name.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if let Some(token) = tokens.get(p) {
            if *token == Token::AnySeq {
                star = Some((p + 1, t));
                p += 1;
                continue;
            }
            if token.matches(text[t]) {
                p += 1;
                t += 1;
                continue;
            }
        }
        match star {
            Some((resume, consumed)) => {
                p = resume;
                t = consumed + 1;
                star = Some((resume, consumed + 1));
            }
            None => return false,
        }
    }

    tokens[p..].iter().all(|tok| *tok == Token::AnySeq)
}
