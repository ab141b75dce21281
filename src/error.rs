//! Application error type with a process exit code.
//!
//! Exit code conventions used across the pipeline:
//!
//! - `2` — usage, configuration, or local I/O problems (bad CLI input,
//!   unreadable config/mapping files, staging failures)
//! - `3` — fatal/authentication-class API failures that abort a run
//! - `4` — data-level fetch/store failures (bad payloads, store rejects)

#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    /// Usage/config/local-I/O error (exit code 2).
    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(2, message)
    }

    /// Fatal/authentication-class error (exit code 3).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(3, message)
    }

    /// Data-level fetch/store error (exit code 4).
    pub fn data(message: impl Into<String>) -> Self {
        Self::new(4, message)
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}
