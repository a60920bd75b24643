// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error handling. Configuration and setup mistakes are recoverable
// (`SchedulerError`, `Result`); the scheduler's inner loops are not built
// to unwind through, so conditions discovered there that cannot be
// repaired in place go through `FatalError`/`abort` instead of a panic.

use std::fmt;

/// Recoverable errors raised while assembling or reconfiguring a scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// A thread index or block/transporter id fell outside the configured
    /// range.
    InvalidIndex { what: &'static str, index: usize, limit: usize },
    /// `Config::validate` rejected a configuration.
    InvalidConfig(String),
    /// A block was registered twice under the same block number, or a
    /// dispatch target named a block number nothing registered.
    UnknownBlock(u16),
    /// A transporter id outside `0..MAX_SEND_THREADS` transporter slots.
    UnknownTransporter(u32),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIndex { what, index, limit } => {
                write!(f, "{what} index {index} out of range (limit {limit})")
            }
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::UnknownBlock(no) => write!(f, "no block registered at block number {no}"),
            Self::UnknownTransporter(id) => write!(f, "unknown transporter id {id}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// A condition the running scheduler cannot recover from: a corrupted
/// ring index, an invariant violated by a block implementation, or a
/// resource exhaustion path with nowhere left to degrade to. Mirrors the
/// choke point the original reaches through `STOP_FOR_CRASH` — logged at
/// error level, then the process is torn down rather than left to run in
/// an inconsistent state.
#[derive(Debug, Clone)]
pub struct FatalError {
    pub reason: String,
}

impl FatalError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal scheduler error: {}", self.reason)
    }
}

impl std::error::Error for FatalError {}

/// Log `err` at error level and terminate the process. Never returns.
/// Call only for conditions where continuing would silently corrupt
/// scheduler state (never for configuration or I/O errors — those are
/// `SchedulerError`).
#[cold]
pub fn abort(err: &FatalError) -> ! {
    log::error!("{err}");
    std::process::abort();
}
