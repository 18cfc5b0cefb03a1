//! Array shapes as the engine reports them (`mx_uint` dimensions).

use std::fmt;
use std::str::FromStr;

/// An array shape (dimensions).
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Shape(pub Vec<u32>);

impl Shape {
    /// Create a new shape from dimensions.
    pub fn new(dims: Vec<u32>) -> Self {
        Shape(dims)
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Get dimension at index.
    pub fn dim(&self, idx: usize) -> u32 {
        self.0[idx]
    }

    /// Get dimensions as slice.
    pub fn dims(&self) -> &[u32] {
        &self.0
    }

    /// Total number of elements. An unknown (0-dim) shape has none.
    pub fn numel(&self) -> usize {
        if self.0.is_empty() {
            return 0;
        }
        self.0.iter().map(|&d| d as usize).product()
    }

    /// True when the engine could not determine this shape.
    pub fn is_unknown(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        if self.0.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<u32>> for Shape {
    fn from(v: Vec<u32>) -> Self {
        Shape(v)
    }
}

impl From<&[u32]> for Shape {
    fn from(s: &[u32]) -> Self {
        Shape(s.to_vec())
    }
}

/// Error returned when a shape string such as `"2,3"` cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid shape '{0}': expected comma-separated positive integers")]
pub struct ParseShapeError(String);

impl FromStr for Shape {
    type Err = ParseShapeError;

    /// Parses `"2,3"`, `"(2, 3)"` or `"4"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('(').trim_end_matches(')');
        let mut dims = Vec::new();
        for part in trimmed.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.parse::<u32>() {
                Ok(d) if d > 0 => dims.push(d),
                _ => return Err(ParseShapeError(s.to_string())),
            }
        }
        if dims.is_empty() {
            return Err(ParseShapeError(s.to_string()));
        }
        Ok(Shape(dims))
    }
}
