//! Common types used across swapvm
//!
//! This module defines shared types to avoid circular dependencies.

use core::fmt;

/// Highest pid that still belongs to the operating system itself
/// (init and the shell). Such processes are never paged.
pub const OS_PID_LIMIT: u32 = 2;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(pub u32);

impl Pid {
    /// True for init and the shell
    pub const fn is_os(self) -> bool {
        self.0 <= OS_PID_LIMIT
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
