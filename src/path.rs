use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use crate::value::Value;

/// One step into nested form data: an object key or an array index.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A location within nested form data, parsed from dot/bracket notation
/// such as `profile.emails[0].address`. The empty string is the root path.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldPath {
    segments: Vec<PathSegment>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PathError {
    EmptyKey,
    UnterminatedIndex,
    InvalidIndex(String),
    MissingSeparator,
}

impl Display for PathError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PathError::EmptyKey => f.write_str("path contains an empty key segment"),
            PathError::UnterminatedIndex => f.write_str("path index bracket is never closed"),
            PathError::InvalidIndex(raw) => write!(f, "path index `{raw}` is not a number"),
            PathError::MissingSeparator => {
                f.write_str("path index must be followed by `.`, `[` or the end of the path")
            }
        }
    }
}

impl std::error::Error for PathError {}

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: impl IntoIterator<Item = PathSegment>) -> Self {
        Self {
            segments: segments.into_iter().collect(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let mut segments = Vec::new();
        let bytes = raw.as_bytes();
        let mut at = 0;
        while at < bytes.len() {
            match bytes[at] {
                b'[' => {
                    let close = raw[at..]
                        .find(']')
                        .map(|offset| at + offset)
                        .ok_or(PathError::UnterminatedIndex)?;
                    let digits = &raw[at + 1..close];
                    let index = digits
                        .parse::<usize>()
                        .map_err(|_| PathError::InvalidIndex(digits.to_string()))?;
                    segments.push(PathSegment::Index(index));
                    at = close + 1;
                    at = consume_separator(bytes, at)?;
                }
                b'.' => return Err(PathError::EmptyKey),
                _ => {
                    let end = raw[at..]
                        .find(['.', '['])
                        .map(|offset| at + offset)
                        .unwrap_or(raw.len());
                    segments.push(PathSegment::Key(raw[at..end].to_string()));
                    at = end;
                    if at < bytes.len() && bytes[at] == b'.' {
                        at += 1;
                        if at == bytes.len() || bytes[at] == b'.' || bytes[at] == b'[' {
                            return Err(PathError::EmptyKey);
                        }
                    }
                }
            }
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }
}

/// After `]`, only `.key`, another `[index]` or the end of the path may follow.
fn consume_separator(bytes: &[u8], at: usize) -> Result<usize, PathError> {
    if at == bytes.len() || bytes[at] == b'[' {
        return Ok(at);
    }
    if bytes[at] == b'.' {
        if at + 1 == bytes.len() || bytes[at + 1] == b'.' || bytes[at + 1] == b'[' {
            return Err(PathError::EmptyKey);
        }
        return Ok(at + 1);
    }
    Err(PathError::MissingSeparator)
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (position, segment) in self.segments.iter().enumerate() {
            match segment {
                PathSegment::Key(key) => {
                    if position > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(key)?;
                }
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

impl FromStr for FieldPath {
    type Err = PathError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

/// Resolves `path` against `root`, disambiguating objects and arrays by the
/// runtime shape of each node. Returns `None` as soon as a segment does not fit.
pub fn get_value<'a>(root: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.segments() {
        node = match (segment, node) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key)?,
            (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Functional update at `path`: the transform receives the existing value
/// (`None` when the location is absent) and its result replaces it. Only the
/// ancestor chain down to the target is reallocated; siblings keep their
/// `Arc` identity. Missing intermediate nodes are created per segment shape,
/// with arrays padded up to the index with `Value::Null`.
pub fn set_value<F>(root: &Value, path: &FieldPath, update: F) -> Value
where
    F: FnOnce(Option<&Value>) -> Value,
{
    set_at(Some(root), path.segments(), update)
}

fn set_at<F>(node: Option<&Value>, segments: &[PathSegment], update: F) -> Value
where
    F: FnOnce(Option<&Value>) -> Value,
{
    let Some((head, rest)) = segments.split_first() else {
        return update(node);
    };
    match head {
        PathSegment::Key(key) => {
            let mut map = match node {
                Some(Value::Object(map)) => (**map).clone(),
                _ => BTreeMap::new(),
            };
            let child = map.get(key).cloned();
            let next = set_at(child.as_ref(), rest, update);
            map.insert(key.clone(), next);
            Value::Object(Arc::new(map))
        }
        PathSegment::Index(index) => {
            let mut items = match node {
                Some(Value::Array(items)) => (**items).clone(),
                _ => Vec::new(),
            };
            let child = items.get(*index).cloned();
            let next = set_at(child.as_ref(), rest, update);
            if items.len() <= *index {
                items.resize(*index, Value::Null);
                items.push(next);
            } else {
                items[*index] = next;
            }
            Value::Array(Arc::new(items))
        }
    }
}
