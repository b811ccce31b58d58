//! Guacamole instruction codec.
//!
//! An instruction is a list of elements, each prefixed with its length in
//! *bytes* followed by `.`, joined with `,` and terminated by `;`:
//!
//! ```text
//! 3.key,5.65507,1.1;
//! ```
//!
//! Because lengths are byte counts, element content may freely contain the
//! `.`/`,`/`;` literals and multibyte UTF-8 — the framing never scans inside
//! an element.

use thiserror::Error;

/// Framing-level decode failure. Any of these poisons the stream; the tunnel
/// tears the connection down rather than attempting resynchronization.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("non-numeric or oversized element length prefix")]
    InvalidLength,
    #[error("expected ',' or ';' after element, found {0:?}")]
    BadSeparator(char),
    #[error("instruction element is not valid UTF-8")]
    InvalidUtf8,
}

/// A single parsed instruction: opcode plus zero or more arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<String>,
}

impl Instruction {
    pub fn new(opcode: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            opcode: opcode.into(),
            args,
        }
    }

    /// Argument at `index`, or `""` when the instruction is shorter.
    pub fn arg(&self, index: usize) -> &str {
        self.args.get(index).map_or("", String::as_str)
    }

    /// Render the wire form, including the trailing `;`.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (i, elem) in std::iter::once(&self.opcode).chain(&self.args).enumerate() {
            if i > 0 {
                out.push(',');
            }
            // String::len is the byte length, which is what the protocol wants.
            out.push_str(&elem.len().to_string());
            out.push('.');
            out.push_str(elem);
        }
        out.push(';');
        out
    }

    /// Decode one instruction from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial frame, and
    /// `Ok(Some((instruction, consumed)))` once a full frame is present.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, FramingError> {
        let mut elems: Vec<String> = Vec::new();
        let mut pos = 0;
        loop {
            let (len, after_dot) = match scan_length(buf, pos)? {
                Some(v) => v,
                None => return Ok(None),
            };
            // Need the element plus its trailing separator.
            if buf.len() < after_dot + len + 1 {
                return Ok(None);
            }
            let elem = std::str::from_utf8(&buf[after_dot..after_dot + len])
                .map_err(|_| FramingError::InvalidUtf8)?;
            elems.push(elem.to_owned());
            pos = after_dot + len;
            match buf[pos] {
                b',' => pos += 1,
                b';' => {
                    let mut it = elems.into_iter();
                    let opcode = it.next().unwrap_or_default();
                    return Ok(Some((
                        Self {
                            opcode,
                            args: it.collect(),
                        },
                        pos + 1,
                    )));
                }
                other => return Err(FramingError::BadSeparator(other as char)),
            }
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Length of the complete instruction at the front of `buf`, terminator
/// included, or `None` while the frame is still partial. Used by the relay
/// path to forward raw frames without building an [`Instruction`].
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, FramingError> {
    let mut pos = 0;
    loop {
        let (len, after_dot) = match scan_length(buf, pos)? {
            Some(v) => v,
            None => return Ok(None),
        };
        if buf.len() < after_dot + len + 1 {
            return Ok(None);
        }
        pos = after_dot + len;
        match buf[pos] {
            b',' => pos += 1,
            b';' => return Ok(Some(pos + 1)),
            other => return Err(FramingError::BadSeparator(other as char)),
        }
    }
}

/// Parse the `<digits>.` length prefix starting at `pos`. Returns the length
/// and the offset just past the `.`, or `None` when the buffer ends mid-prefix.
fn scan_length(buf: &[u8], mut pos: usize) -> Result<Option<(usize, usize)>, FramingError> {
    let mut len: usize = 0;
    let mut digits = 0u8;
    loop {
        match buf.get(pos) {
            None => return Ok(None),
            Some(b'.') if digits > 0 => return Ok(Some((len, pos + 1))),
            Some(b @ b'0'..=b'9') => {
                len = len * 10 + usize::from(b - b'0');
                digits += 1;
                // Guacamole elements never approach 10 MB; treat longer
                // prefixes as corruption instead of allocating.
                if digits > 7 {
                    return Err(FramingError::InvalidLength);
                }
                pos += 1;
            }
            Some(_) => return Err(FramingError::InvalidLength),
        }
    }
}
