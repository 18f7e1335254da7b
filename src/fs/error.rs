//! POSIX-style filesystem errors
//!
//! Call sites match on [`FsError::code`], never on the message. The message
//! mirrors Node's shape: `ENOENT: no such file or directory, open '/x'`.

use std::fmt;
use thiserror::Error;

/// POSIX error codes produced by the virtual filesystem
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ENOENT,
    EEXIST,
    EISDIR,
    ENOTDIR,
    ENOTEMPTY,
    EBADF,
    EINVAL,
    EBUSY,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ENOENT => "ENOENT",
            ErrorCode::EEXIST => "EEXIST",
            ErrorCode::EISDIR => "EISDIR",
            ErrorCode::ENOTDIR => "ENOTDIR",
            ErrorCode::ENOTEMPTY => "ENOTEMPTY",
            ErrorCode::EBADF => "EBADF",
            ErrorCode::EINVAL => "EINVAL",
            ErrorCode::EBUSY => "EBUSY",
        }
    }

    /// Negative errno as reported in Node's `err.errno` (Linux numbering)
    pub fn errno(self) -> i32 {
        match self {
            ErrorCode::ENOENT => -2,
            ErrorCode::EBADF => -9,
            ErrorCode::EBUSY => -16,
            ErrorCode::EEXIST => -17,
            ErrorCode::ENOTDIR => -20,
            ErrorCode::EISDIR => -21,
            ErrorCode::EINVAL => -22,
            ErrorCode::ENOTEMPTY => -39,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::ENOENT => "no such file or directory",
            ErrorCode::EEXIST => "file already exists",
            ErrorCode::EISDIR => "illegal operation on a directory",
            ErrorCode::ENOTDIR => "not a directory",
            ErrorCode::ENOTEMPTY => "directory not empty",
            ErrorCode::EBADF => "bad file descriptor",
            ErrorCode::EINVAL => "invalid argument",
            ErrorCode::EBUSY => "resource busy or locked",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn describe(code: &ErrorCode) -> &'static str {
    code.description()
}

fn quoted(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!(" '{}'", path)
    }
}

/// A failed filesystem call: code, attempted syscall and offending path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {}, {syscall}{}", describe(.code), quoted(.path))]
pub struct FsError {
    pub code: ErrorCode,
    pub syscall: &'static str,
    pub path: String,
}

impl FsError {
    pub fn new(code: ErrorCode, syscall: &'static str, path: impl Into<String>) -> Self {
        Self {
            code,
            syscall,
            path: path.into(),
        }
    }

    pub fn not_found(syscall: &'static str, path: impl Into<String>) -> Self {
        Self::new(ErrorCode::ENOENT, syscall, path)
    }

    pub fn bad_descriptor(syscall: &'static str) -> Self {
        Self::new(ErrorCode::EBADF, syscall, "")
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::ENOENT
    }
}

/// Result type for filesystem operations
pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_shape() {
        let err = FsError::not_found("open", "/missing.txt");
        assert_eq!(
            err.to_string(),
            "ENOENT: no such file or directory, open '/missing.txt'"
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_error_without_path() {
        let err = FsError::bad_descriptor("read");
        assert_eq!(err.to_string(), "EBADF: bad file descriptor, read");
        assert_eq!(err.code.errno(), -9);
    }
}
