//! Response body outputs.
//!
//! A response body can be written either as raw bytes through an
//! [`OutputStream`] or as text through a [`PrintWriter`], never both. Which
//! form is in use is latched in an [`OutputMode`] the first time either is
//! obtained.
//!
//! [`BodySink`] is the discarding target used to emulate HEAD: it swallows
//! every write and only keeps a byte count.

use std::fmt;
use std::io;

use bytes::{BufMut, BytesMut};

use crate::error::StateError;

/// Which output form a body target has handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Unused,
    Stream,
    Writer,
}

impl OutputMode {
    fn label(self) -> &'static str {
        match self {
            Self::Unused => "unused",
            Self::Stream => "output stream",
            Self::Writer => "writer",
        }
    }

    /// Latches `wanted`, or fails if the other form is already active.
    ///
    /// Claiming the form that is already active is a no-op.
    pub fn claim(&mut self, wanted: OutputMode) -> Result<(), StateError> {
        match *self {
            Self::Unused => {
                *self = wanted;
                Ok(())
            }
            active if active == wanted => Ok(()),
            active => Err(StateError::OutputMode {
                requested: wanted.label(),
                active: active.label(),
            }),
        }
    }
}

/// A write-only sink that discards bytes but counts them.
///
/// # Examples
///
/// ```
/// use std::io::Write;
/// use servlet_core::body::BodySink;
///
/// let mut sink = BodySink::new();
/// sink.output_stream().unwrap().write_all(b"hello").unwrap();
/// assert_eq!(sink.len(), 5);
/// assert!(sink.writer().is_err());
/// ```
#[derive(Debug, Default)]
pub struct BodySink {
    written: u64,
    mode: OutputMode,
}

impl BodySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes swallowed so far.
    pub fn len(&self) -> u64 {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Hands out the sink as a byte stream.
    pub fn output_stream(&mut self) -> Result<OutputStream<'_>, StateError> {
        self.mode.claim(OutputMode::Stream)?;
        Ok(OutputStream {
            target: Target::Discard(self),
        })
    }

    /// Hands out the sink as a character writer.
    pub fn writer(&mut self) -> Result<PrintWriter<'_>, StateError> {
        self.mode.claim(OutputMode::Writer)?;
        Ok(PrintWriter {
            target: Target::Discard(self),
        })
    }

    fn swallow(&mut self, bytes: &[u8]) {
        self.written += bytes.len() as u64;
    }
}

// Where an output handle sends its bytes.
#[derive(Debug)]
pub(crate) enum Target<'a> {
    Transport(&'a mut BytesMut),
    Discard(&'a mut BodySink),
}

impl Target<'_> {
    fn put(&mut self, bytes: &[u8]) {
        match self {
            Self::Transport(buf) => buf.put_slice(bytes),
            Self::Discard(sink) => sink.swallow(bytes),
        }
    }
}

/// Byte-oriented body output.
#[derive(Debug)]
pub struct OutputStream<'a> {
    target: Target<'a>,
}

impl<'a> OutputStream<'a> {
    pub(crate) fn new(target: Target<'a>) -> Self {
        Self { target }
    }

    /// Writes `text` verbatim as UTF-8 bytes.
    pub fn print(&mut self, text: &str) -> io::Result<()> {
        self.target.put(text.as_bytes());
        Ok(())
    }
}

impl io::Write for OutputStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.target.put(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Character-oriented body output.
#[derive(Debug)]
pub struct PrintWriter<'a> {
    target: Target<'a>,
}

impl<'a> PrintWriter<'a> {
    pub(crate) fn new(target: Target<'a>) -> Self {
        Self { target }
    }
}

impl fmt::Write for PrintWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.target.put(s.as_bytes());
        Ok(())
    }
}
