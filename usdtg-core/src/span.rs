//! Source locations.

use serde::Serialize;

/// Byte range into a single source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Span { start, end }
    }

    /// Smallest span covering both `self` and `other`.
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// 1-based line and column of `start` within `source`.
    pub fn line_col(&self, source: &str) -> (usize, usize) {
        let offset = (self.start as usize).min(source.len());
        let before = &source.as_bytes()[..offset];
        let line = before.iter().filter(|&&b| b == b'\n').count() + 1;
        let column = match before.iter().rposition(|&b| b == b'\n') {
            Some(newline) => offset - newline,
            None => offset + 1,
        };
        (line, column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_line_and_column() {
        let source = "contract A {\n  storage x: i32;\n}";
        let span = Span::new(15, 22);
        assert_eq!(span.line_col(source), (2, 3));
        assert_eq!(Span::new(0, 1).line_col(source), (1, 1));
    }

    #[test]
    fn merges_spans() {
        let merged = Span::new(4, 6).to(Span::new(1, 3));
        assert_eq!(merged, Span::new(1, 6));
    }
}
