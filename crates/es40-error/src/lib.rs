//! Shared error kinds for the ES40 interconnect substrate.
//!
//! The original emulator raises a `CException` carrying a `fault_t` kind
//! (`Configuration`, `Runtime`, `InvalidArgument`, ...) across thread
//! boundaries. We keep the same kind taxonomy but express it as a
//! `std::error::Error` returned from fallible entry points instead of an
//! exception, per the worker-result convention in the design notes.

use std::fmt;

/// Error kinds, matching the taxonomy the source's `FAILURE` macro encodes
/// as its first argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Configuration,
    Runtime,
    InvalidArgument,
    NotImplemented,
    OutOfMemory,
    Thread,
    Timeout,
    IllegalState,
    Graceful,
    Abort,
    Logic,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Configuration => "Configuration",
            Kind::Runtime => "Runtime",
            Kind::InvalidArgument => "InvalidArgument",
            Kind::NotImplemented => "NotImplemented",
            Kind::OutOfMemory => "OutOfMemory",
            Kind::Thread => "Thread",
            Kind::Timeout => "Timeout",
            Kind::IllegalState => "IllegalState",
            Kind::Graceful => "Graceful",
            Kind::Abort => "Abort",
            Kind::Logic => "Logic",
        };
        f.write_str(s)
    }
}

/// An error carrying a [`Kind`], a message, the component that raised it
/// (the source's `devid_string`), and the call-site location.
#[derive(Debug, thiserror::Error)]
#[error("{component}: {kind}: {message} ({location})")]
pub struct Error {
    pub kind: Kind,
    pub message: String,
    pub component: &'static str,
    pub location: &'static std::panic::Location<'static>,
}

impl Error {
    #[track_caller]
    pub fn new(kind: Kind, component: &'static str, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            component,
            location: std::panic::Location::caller(),
        }
    }

    #[track_caller]
    pub fn configuration(component: &'static str, message: impl Into<String>) -> Self {
        Self::new(Kind::Configuration, component, message)
    }

    #[track_caller]
    pub fn invalid_argument(component: &'static str, message: impl Into<String>) -> Self {
        Self::new(Kind::InvalidArgument, component, message)
    }

    #[track_caller]
    pub fn illegal_state(component: &'static str, message: impl Into<String>) -> Self {
        Self::new(Kind::IllegalState, component, message)
    }

    #[track_caller]
    pub fn timeout(component: &'static str, message: impl Into<String>) -> Self {
        Self::new(Kind::Timeout, component, message)
    }

    #[track_caller]
    pub fn runtime(component: &'static str, message: impl Into<String>) -> Self {
        Self::new(Kind::Runtime, component, message)
    }

    #[track_caller]
    pub fn thread(component: &'static str, message: impl Into<String>) -> Self {
        Self::new(Kind::Thread, component, message)
    }

    #[track_caller]
    pub fn graceful(component: &'static str, message: impl Into<String>) -> Self {
        Self::new(Kind::Graceful, component, message)
    }

    pub fn is_graceful(&self) -> bool {
        self.kind == Kind::Graceful
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_component_and_kind() {
        let e = Error::invalid_argument("pic0", "unknown OCW3 bit");
        let s = e.to_string();
        assert!(s.contains("pic0"));
        assert!(s.contains("InvalidArgument"));
        assert!(s.contains("unknown OCW3 bit"));
    }

    #[test]
    fn graceful_is_recognized() {
        let e = Error::graceful("serial0", "break menu requested shutdown");
        assert!(e.is_graceful());
    }
}
