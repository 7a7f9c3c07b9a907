// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Spoolbox.

use thiserror::Error;

/// Top-level error type for all Spoolbox operations.
#[derive(Debug, Error)]
pub enum SpoolError {
    // -- Network / protocol --
    #[error("print server error: {0}")]
    PrintServer(String),

    // -- Queue / storage --
    #[error("storage error: {0}")]
    Storage(String),

    #[error("spool storage is below the safety margin")]
    QueueFull,

    #[error("client slot {client} has no open job")]
    NoOpenJob { client: usize },

    #[error("client slot {client} already has job {seq} open")]
    JobAlreadyOpen { client: usize, seq: u32 },

    #[error("no completed job is open for reading")]
    NoReadableJob,

    // -- Output device --
    #[error("output sink is not ready")]
    SinkUnavailable,

    #[error("output sink error: {0}")]
    Sink(String),

    // -- Configuration --
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SpoolError>;
