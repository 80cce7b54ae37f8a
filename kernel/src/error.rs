/// Error kinds, the crate-wide error type and the last-error slot.
///
/// Recoverable failures travel as `Result<T, Error>`. `ErrorState` keeps the
/// most recent failure plus a small stack of saved errors so probing loops
/// can keep a diagnostic trace while they move on to the next driver.
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

/// Maximum number of saved errors.
pub const ERROR_STACK_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OutOfMemory,
    BadModule,
    BadOs,
    UnknownDevice,
    BadDevice,
    BadPartTable,
    OutOfRange,
    NotImplementedYet,
    ReadError,
    WriteError,
    BadFs,
    UnknownFs,
    FileNotFound,
    BadFilename,
    BadArgument,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::OutOfMemory => write!(f, "out of memory"),
            ErrorKind::BadModule => write!(f, "bad module"),
            ErrorKind::BadOs => write!(f, "bad os"),
            ErrorKind::UnknownDevice => write!(f, "unknown device"),
            ErrorKind::BadDevice => write!(f, "bad device"),
            ErrorKind::BadPartTable => write!(f, "bad partition table"),
            ErrorKind::OutOfRange => write!(f, "out of range"),
            ErrorKind::NotImplementedYet => write!(f, "not implemented yet"),
            ErrorKind::ReadError => write!(f, "read error"),
            ErrorKind::WriteError => write!(f, "write error"),
            ErrorKind::BadFs => write!(f, "bad filesystem"),
            ErrorKind::UnknownFs => write!(f, "unknown filesystem"),
            ErrorKind::FileNotFound => write!(f, "file not found"),
            ErrorKind::BadFilename => write!(f, "bad filename"),
            ErrorKind::BadArgument => write!(f, "bad argument"),
            ErrorKind::Io => write!(f, "i/o error"),
        }
    }
}

/// An error code with its formatted message.
#[derive(Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            f.write_str(&self.message)
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error({:?}: {})", self.kind, self)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Build an `Error` from a kind and a format string.
#[macro_export]
macro_rules! error {
    ($kind:ident, $($arg:tt)*) => {
        $crate::error::Error::new(
            $crate::error::ErrorKind::$kind,
            alloc::format!($($arg)*),
        )
    };
}

// ---- Last error and error stack ----

/// Process-wide error slot with a fixed-depth save stack.
#[derive(Default)]
pub struct ErrorState {
    current: Option<Error>,
    stack: Vec<Option<Error>>,
    overflows: u32,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` as the active error and hand it back to the caller.
    pub fn raise(&mut self, err: Error) -> Error {
        self.current = Some(err.clone());
        err
    }

    pub fn last(&self) -> Option<&Error> {
        self.current.as_ref()
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// How many saves were dropped because the stack was full.
    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    /// Save the active error and start over with a clean slot.
    ///
    /// A full stack drops its oldest entry.
    pub fn push(&mut self) {
        if self.stack.len() == ERROR_STACK_SIZE {
            self.stack.remove(0);
            self.overflows += 1;
        }
        self.stack.push(self.current.take());
    }

    /// Restore the most recently saved error. Returns false (and clears the
    /// slot) when nothing was saved.
    pub fn pop(&mut self) -> bool {
        match self.stack.pop() {
            Some(saved) => {
                self.current = saved;
                true
            }
            None => {
                self.current = None;
                false
            }
        }
    }

    /// Record a skipped failure and keep it on the stack.
    pub fn save(&mut self, err: Error) {
        self.current = Some(err);
        self.push();
    }

    /// Forget everything saved after the stack was `depth` deep.
    pub fn unwind_to(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }

    /// Write the active error and the saved ones, newest first, then reset.
    pub fn print(&mut self, out: &mut impl fmt::Write) -> fmt::Result {
        loop {
            if let Some(err) = self.current.take() {
                writeln!(out, "error: {}.", err)?;
            }
            if !self.pop() {
                break;
            }
        }
        if self.overflows > 0 {
            writeln!(out, "assert: error stack overflow detected!")?;
            self.overflows = 0;
        }
        Ok(())
    }
}
