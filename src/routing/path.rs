//! Path normalization and parameterized path patterns.

use crate::Error;
use regex::{Captures, Regex};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Default expression of a `{name}` parameter: one path segment.
const SEGMENT: &str = "[^/]*";

/// Remove empty and `.` segments and resolve `..` segments. A trailing slash is kept.
///
/// ```
/// use hreq_exchange::routing::normalize_path;
///
/// assert_eq!(normalize_path("/a//b/./c/../d/"), "/a/b/d/");
/// assert_eq!(normalize_path("/../x"), "/x");
/// ```
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = vec![];

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut out = String::with_capacity(path.len());
    for s in &segments {
        out.push('/');
        out.push_str(s);
    }

    let trailing = path.ends_with('/') || path.ends_with("/.") || path.ends_with("/..");
    if out.is_empty() || trailing {
        out.push('/');
    }

    out
}

/// Whether `path` contains parameters and must be matched as a pattern.
pub(crate) fn is_parameterized(path: &str) -> bool {
    path.contains('{')
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal,
    /// A parameter, `None` for `{:regex}` which matches without capturing.
    Param(Option<String>),
}

/// A path with parameters: `/book/{id}`, `/file/{path:.*}` or `/x/{:[a-z]+}`.
///
/// Each literal run and each parameter is one group of the compiled
/// expression, which is how competing matches are ranked.
#[derive(Clone)]
pub struct PathPattern {
    raw: String,
    regex: Regex,
    /// Piece and its capture group index, in path order.
    pieces: Vec<(Piece, usize)>,
}

impl PathPattern {
    /// Compile a pattern. With `match_trailing_slash`, the path matches with
    /// or without a trailing slash.
    pub fn parse(path: &str, match_trailing_slash: bool) -> Result<Self, Error> {
        let raw = normalize_pattern(path);
        let mut body = raw.as_str();

        if match_trailing_slash && body.len() > 1 && body.ends_with('/') {
            body = &body[..body.len() - 1];
        }

        let mut expr = String::from("^");
        let mut pieces = vec![];
        let mut group = 1;
        let mut literal = String::new();

        let mut chars = body.char_indices().peekable();
        while let Some((start, c)) = chars.next() {
            if c != '{' {
                literal.push(c);
                continue;
            }

            if !literal.is_empty() {
                expr.push('(');
                expr.push_str(&regex::escape(&literal));
                expr.push(')');
                pieces.push((Piece::Literal, group));
                group += 1;
                literal.clear();
            }

            // find the matching brace, the expression may contain braces of its own.
            let mut depth = 1;
            let mut end = None;
            for (i, c) in chars.by_ref() {
                match c {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            end = Some(i);
                            break;
                        }
                    }
                    _ => {}
                }
            }
            let end = end.ok_or_else(|| {
                Error::User(format!("Unclosed parameter in path pattern: {}", path))
            })?;

            let param = &body[start + 1..end];
            let (name, re) = match param.split_once(':') {
                Some((name, re)) => (name.trim(), re),
                None => (param.trim(), SEGMENT),
            };

            if !name.is_empty() && !name.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'-') {
                return Err(Error::User(format!("Invalid parameter name in path pattern: {}", path)));
            }

            let inner = Regex::new(re)
                .map_err(|e| Error::User(format!("Invalid expression in path pattern {}: {}", path, e)))?;

            expr.push('(');
            expr.push_str(re);
            expr.push(')');

            let name = if name.is_empty() { None } else { Some(name.to_string()) };
            pieces.push((Piece::Param(name), group));

            // groups inside the parameter expression shift the following pieces.
            group += inner.captures_len();
        }

        if !literal.is_empty() {
            expr.push('(');
            expr.push_str(&regex::escape(&literal));
            expr.push(')');
            pieces.push((Piece::Literal, group));
        }

        if match_trailing_slash && body != "/" {
            expr.push_str("/?");
        }
        expr.push('$');

        let regex = Regex::new(&expr)
            .map_err(|e| Error::User(format!("Invalid path pattern {}: {}", path, e)))?;

        Ok(PathPattern { raw, regex, pieces })
    }

    /// The pattern as registered.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Compiled expression, which also tells the trailing slash variants apart.
    pub fn regex(&self) -> &str {
        self.regex.as_str()
    }

    /// Match a normalized path.
    pub fn matches<'a>(&'a self, path: &'a str) -> Option<PathMatch<'a>> {
        self.regex.captures(path).map(|captures| PathMatch {
            pattern: self,
            captures,
        })
    }
}

/// Collapse duplicate slashes in a pattern, outside of parameters.
fn normalize_pattern(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    let mut depth = 0;

    if !path.starts_with('/') {
        out.push('/');
    }

    for c in path.chars() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            '/' if depth == 0 && out.ends_with('/') => continue,
            _ => {}
        }
        out.push(c);
    }

    out
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.regex.as_str() == other.regex.as_str()
    }
}

impl Eq for PathPattern {}

impl Hash for PathPattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.regex.as_str().hash(state);
    }
}

impl fmt::Debug for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathPattern({})", self.raw)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// A successful match of a path against a pattern.
pub struct PathMatch<'a> {
    pattern: &'a PathPattern,
    captures: Captures<'a>,
}

impl<'a> PathMatch<'a> {
    /// Values of the named parameters.
    pub fn params(&self) -> HashMap<String, String> {
        self.pattern
            .pieces
            .iter()
            .filter_map(|(piece, group)| match piece {
                Piece::Param(Some(name)) => {
                    let value = self.captures.get(*group).map(|m| m.as_str()).unwrap_or("");
                    Some((name.clone(), value.to_string()))
                }
                _ => None,
            })
            .collect()
    }

    fn group(&self, index: usize) -> (&str, bool) {
        let (piece, group) = &self.pattern.pieces[index];
        let value = self.captures.get(*group).map(|m| m.as_str()).unwrap_or("");
        (value, matches!(piece, Piece::Param(_)))
    }

    /// Rank two matches of the same path, `Greater` is the more specific.
    ///
    /// Group by group: a longer literal beats a shorter one, a literal beats a
    /// parameter of the same length, and a parameter swallowing more of the
    /// path loses to the other side. When all shared groups are equal, the
    /// pattern with fewer groups wins.
    pub fn compare(&self, other: &PathMatch<'_>) -> Ordering {
        let common = self.pattern.pieces.len().min(other.pattern.pieces.len());

        for i in 0..common {
            let (this, this_param) = self.group(i);
            let (that, that_param) = other.group(i);

            match this.len().cmp(&that.len()) {
                Ordering::Less => {
                    return if that_param {
                        Ordering::Greater
                    } else {
                        Ordering::Less
                    };
                }
                Ordering::Greater => {
                    return if this_param {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    };
                }
                Ordering::Equal => match (this_param, that_param) {
                    (false, true) => return Ordering::Greater,
                    (true, false) => return Ordering::Less,
                    _ => {}
                },
            }
        }

        other.pattern.pieces.len().cmp(&self.pattern.pieces.len())
    }
}

impl<'a> fmt::Debug for PathMatch<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathMatch")
            .field("pattern", &self.pattern.raw)
            .field("params", &self.params())
            .finish()
    }
}
