//! File handles and the print/say/readline primitives.
//!
//! Handles are shared cells like everything else at runtime. The `Capture`
//! variant collects output into a string for tests and embedders, replacing
//! process stdout the way a host-supplied writer would.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::rc::Rc;

use crate::runtime::error::RunError;

/// Shared handle to a file handle.
pub type HandleRef = Rc<RefCell<FileHandle>>;

/// Wraps a file handle in a fresh shared handle.
#[inline]
#[must_use]
pub fn handle_ref(handle: FileHandle) -> HandleRef {
    Rc::new(RefCell::new(handle))
}

/// A file handle the I/O opcodes operate on.
#[derive(Debug)]
pub enum FileHandle {
    /// Process standard output.
    Stdout,
    /// Process standard error.
    Stderr,
    /// In-memory capture buffer (tests, embedders).
    Capture(String),
    /// Readable file.
    Read(BufReader<File>),
    /// Writable file.
    Write(BufWriter<File>),
    /// Closed or never-opened handle.
    Closed,
}

impl FileHandle {
    /// Writes a string to the handle.
    pub fn write_str(&mut self, text: &str) -> Result<(), RunError> {
        let result = match self {
            FileHandle::Stdout => io::stdout().write_all(text.as_bytes()),
            FileHandle::Stderr => io::stderr().write_all(text.as_bytes()),
            FileHandle::Capture(buf) => {
                buf.push_str(text);
                Ok(())
            }
            FileHandle::Write(w) => w.write_all(text.as_bytes()),
            FileHandle::Read(_) => return Err(RunError::msg("Filehandle opened only for input")),
            FileHandle::Closed => return Err(RunError::msg("print on closed filehandle")),
        };
        result.map_err(|e| RunError::msg(format!("write failed: {e}")))
    }

    /// Reads one line, newline included. `None` at end of file.
    pub fn read_line(&mut self) -> Result<Option<String>, RunError> {
        match self {
            FileHandle::Read(r) => {
                let mut line = String::new();
                let n = r
                    .read_line(&mut line)
                    .map_err(|e| RunError::msg(format!("readline failed: {e}")))?;
                Ok(if n == 0 { None } else { Some(line) })
            }
            FileHandle::Closed => Err(RunError::msg("readline on closed filehandle")),
            _ => Err(RunError::msg("Filehandle opened only for output")),
        }
    }

    /// Reads all remaining lines (list-context readline).
    pub fn read_all_lines(&mut self) -> Result<Vec<String>, RunError> {
        let mut lines = Vec::new();
        while let Some(line) = self.read_line()? {
            lines.push(line);
        }
        Ok(lines)
    }
}

/// The text collected by a `Capture` handle, if it is one.
#[must_use]
pub fn capture_text(handle: &HandleRef) -> Option<String> {
    match &*handle.borrow() {
        FileHandle::Capture(buf) => Some(buf.clone()),
        _ => None,
    }
}

/// Opens a file with a source-language mode string: `"<"` read, `">"`
/// truncate-write, `">>"` append.
pub fn open(mode: &str, path: &str) -> Result<FileHandle, RunError> {
    let failure = |e: io::Error| RunError::msg(format!("open '{path}' failed: {e}"));
    match mode {
        "<" => File::open(path).map(|f| FileHandle::Read(BufReader::new(f))).map_err(failure),
        ">" => File::create(path).map(|f| FileHandle::Write(BufWriter::new(f))).map_err(failure),
        ">>" => std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map(|f| FileHandle::Write(BufWriter::new(f)))
            .map_err(failure),
        other => Err(RunError::msg(format!("Unknown open mode: '{other}'"))),
    }
}
