// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Spoolbox print service.

use serde::{Deserialize, Serialize};

/// Which listening socket a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    /// Plain TCP job upload (JetDirect style, port 9100).
    Raw,
    /// IPP over HTTP/1.1 (port 631).
    Ipp,
    /// HTTP status/assets; POSTs to a printer path behave like IPP.
    Http,
}

impl PortKind {
    pub const ALL: [PortKind; 3] = [PortKind::Raw, PortKind::Ipp, PortKind::Http];

    /// Short label used in log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Ipp => "ipp",
            Self::Http => "http",
        }
    }
}

/// Lifecycle states of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// A client is still appending bytes.
    Writing,
    /// All bytes stored; waiting to be drained.
    Completed,
    /// Aborted before completion; storage deleted.
    Canceled,
}

/// A job owned by one client slot while it is being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    /// Name of the printer whose queue owns the job.
    pub printer: String,
    /// Sequence number assigned at creation.
    pub seq: u32,
    pub state: JobState,
}

/// Durable per-printer queue state.
///
/// `head` is the sequence number of the most recently created job, `tail`
/// the most recently drained one.  `head - tail` is the number of jobs not
/// yet fully drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePointers {
    pub head: u32,
    pub tail: u32,
}

impl QueuePointers {
    /// Number of jobs created but not yet drained.
    pub fn pending(&self) -> u32 {
        self.head.saturating_sub(self.tail)
    }
}

/// What to do with uploads a previous run left in the `Writing` state.
///
/// Canceled jobs have no storage and are always skipped by the drain.  An
/// upload still in `Writing` after a restart never completes, so under
/// `Block` it holds every later job back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StalledJobPolicy {
    /// Keep them; the drain waits for the upload to finish.
    #[default]
    Block,
    /// Delete them at startup so the drain can pass them.
    DiscardOrphans,
}

/// IPP status codes returned by the server (RFC 8011 §4.1.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IppStatus {
    SuccessfulOk,
    ClientErrorBadRequest,
    ServerErrorInternalError,
    ServerErrorOperationNotSupported,
    ServerErrorVersionNotSupported,
}

impl IppStatus {
    pub fn code(&self) -> u16 {
        match self {
            Self::SuccessfulOk => 0x0000,
            Self::ClientErrorBadRequest => 0x0400,
            Self::ServerErrorInternalError => 0x0500,
            Self::ServerErrorOperationNotSupported => 0x0501,
            Self::ServerErrorVersionNotSupported => 0x0503,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Self::SuccessfulOk => "successful-ok",
            Self::ClientErrorBadRequest => "client-error-bad-request",
            Self::ServerErrorInternalError => "server-error-internal-error",
            Self::ServerErrorOperationNotSupported => "server-error-operation-not-supported",
            Self::ServerErrorVersionNotSupported => "server-error-version-not-supported",
        }
    }
}

/// IPP operation identifiers this device knows about (RFC 8011 §5.2.2).
///
/// Only a subset is actually handled; the rest are advertised in
/// `operations-supported` and answered with operation-not-supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    PrintJob,
    ValidateJob,
    CreateJob,
    SendDocument,
    CancelJob,
    GetJobAttributes,
    GetJobs,
    GetPrinterAttributes,
    CancelMyJobs,
    CloseJob,
    IdentifyPrinter,
}

impl Operation {
    /// Advertised operations, in `operations-supported` order.
    pub const ADVERTISED: [Operation; 11] = [
        Operation::PrintJob,
        Operation::ValidateJob,
        Operation::CreateJob,
        Operation::SendDocument,
        Operation::CancelJob,
        Operation::GetJobAttributes,
        Operation::GetJobs,
        Operation::GetPrinterAttributes,
        Operation::CancelMyJobs,
        Operation::CloseJob,
        Operation::IdentifyPrinter,
    ];

    pub fn code(&self) -> u16 {
        match self {
            Self::PrintJob => 0x0002,
            Self::ValidateJob => 0x0004,
            Self::CreateJob => 0x0005,
            Self::SendDocument => 0x0006,
            Self::CancelJob => 0x0008,
            Self::GetJobAttributes => 0x0009,
            Self::GetJobs => 0x000A,
            Self::GetPrinterAttributes => 0x000B,
            Self::CancelMyJobs => 0x0039,
            Self::CloseJob => 0x003B,
            Self::IdentifyPrinter => 0x003C,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ADVERTISED.iter().copied().find(|op| op.code() == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_counts_undrained_jobs() {
        let p = QueuePointers { head: 7, tail: 4 };
        assert_eq!(p.pending(), 3);
        assert_eq!(QueuePointers::default().pending(), 0);
    }

    #[test]
    fn operation_codes_roundtrip() {
        for op in Operation::ADVERTISED {
            assert_eq!(Operation::from_code(op.code()), Some(op));
        }
        assert_eq!(Operation::from_code(0x0001), None);
    }

    #[test]
    fn status_keywords_match_codes() {
        assert_eq!(IppStatus::SuccessfulOk.keyword(), "successful-ok");
        assert_eq!(IppStatus::ClientErrorBadRequest.code(), 0x0400);
        assert_eq!(
            IppStatus::ServerErrorVersionNotSupported.keyword(),
            "server-error-version-not-supported"
        );
    }

    #[test]
    fn stalled_policy_uses_kebab_case() {
        let json = serde_json::to_string(&StalledJobPolicy::DiscardOrphans).unwrap();
        assert_eq!(json, "\"discard-orphans\"");
    }
}
