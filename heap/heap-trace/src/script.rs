//! Trace-script model and parser.
//!
//! A script is ASCII text, one request per line. Blank lines and lines whose
//! first non-whitespace character is `#` are skipped. Requests:
//!
//! ```text
//! a <id> <size>    allocate `size` bytes, remember the pointer under `id`
//! r <id> <size>    reallocate the block held by `id` to `size` bytes
//! f <id>           deallocate the block held by `id`
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Request {
    Alloc { id: usize, size: usize },
    Realloc { id: usize, size: usize },
    Free { id: usize },
}

/// One request together with its 1-based source line.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TraceLine {
    pub number: usize,
    pub request: Request,
}

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: unknown request {op:?}")]
    UnknownRequest { line: usize, op: String },
    #[error("line {line}: missing field")]
    MissingField { line: usize },
    #[error("line {line}: bad number {field:?}")]
    BadNumber { line: usize, field: String },
    #[error("line {line}: trailing fields")]
    TrailingFields { line: usize },
}

/// A parsed script: the requests in order plus the id universe they declare.
#[derive(Debug, Clone, Default)]
pub struct TraceScript {
    pub lines: Vec<TraceLine>,
    max_id: Option<usize>,
}

impl TraceScript {
    /// Parse script text.
    ///
    /// # Errors
    /// The first malformed line, see [`ScriptError`].
    pub fn parse(text: &str) -> Result<Self, ScriptError> {
        let mut lines = Vec::new();
        let mut max_id = None;

        for (index, raw) in text.lines().enumerate() {
            let number = index + 1;
            let trimmed = raw.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let mut fields = trimmed.split_whitespace();
            let op = fields.next().unwrap_or_default();
            let request = match op {
                "a" | "r" => {
                    let id = number_field(fields.next(), number)?;
                    let size = number_field(fields.next(), number)?;
                    if op == "a" {
                        Request::Alloc { id, size }
                    } else {
                        Request::Realloc { id, size }
                    }
                }
                "f" => Request::Free {
                    id: number_field(fields.next(), number)?,
                },
                other => {
                    return Err(ScriptError::UnknownRequest {
                        line: number,
                        op: other.to_string(),
                    });
                }
            };
            if fields.next().is_some() {
                return Err(ScriptError::TrailingFields { line: number });
            }

            let id = match request {
                Request::Alloc { id, .. } | Request::Realloc { id, .. } | Request::Free { id } => {
                    id
                }
            };
            max_id = Some(max_id.map_or(id, |seen: usize| seen.max(id)));
            lines.push(TraceLine { number, request });
        }

        Ok(Self { lines, max_id })
    }

    /// Read and parse a script file.
    ///
    /// # Errors
    /// IO failure or the first malformed line.
    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let text = fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Number of distinct ids the script declares (`max_id + 1`).
    #[must_use]
    pub fn id_count(&self) -> usize {
        self.max_id.map_or(0, |id| id + 1)
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        self.lines.len()
    }
}

fn number_field(field: Option<&str>, line: usize) -> Result<usize, ScriptError> {
    let field = field.ok_or(ScriptError::MissingField { line })?;
    field.parse().map_err(|_| ScriptError::BadNumber {
        line,
        field: field.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_requests_with_comments_and_blanks() {
        let script = TraceScript::parse(
            "# weighted mix\n\
             a 0 24\n\
             \n\
             \t a 1 100\n\
             r 0 56\n\
             f 1\n\
             # trailing comment\n\
             f 0\n",
        )
        .unwrap();
        assert_eq!(script.request_count(), 5);
        assert_eq!(script.id_count(), 2);
        assert_eq!(
            script.lines[0],
            TraceLine {
                number: 2,
                request: Request::Alloc { id: 0, size: 24 }
            }
        );
        assert_eq!(
            script.lines[2],
            TraceLine {
                number: 5,
                request: Request::Realloc { id: 0, size: 56 }
            }
        );
        assert_eq!(
            script.lines[4],
            TraceLine {
                number: 8,
                request: Request::Free { id: 0 }
            }
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(
            TraceScript::parse("x 0 1\n"),
            Err(ScriptError::UnknownRequest { line: 1, .. })
        ));
        assert!(matches!(
            TraceScript::parse("a 0\n"),
            Err(ScriptError::MissingField { line: 1 })
        ));
        assert!(matches!(
            TraceScript::parse("a zero 12\n"),
            Err(ScriptError::BadNumber { line: 1, .. })
        ));
        assert!(matches!(
            TraceScript::parse("f 0 12\n"),
            Err(ScriptError::TrailingFields { line: 1 })
        ));
    }

    #[test]
    fn empty_script_declares_no_ids() {
        let script = TraceScript::parse("# nothing\n").unwrap();
        assert_eq!(script.request_count(), 0);
        assert_eq!(script.id_count(), 0);
    }
}
