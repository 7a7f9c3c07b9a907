// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spoolbox Print: IPP attribute codec, printer attribute table, HTTP/IPP
// protocol stream, persistent job queue, output sinks and the single-threaded
// connection multiplexer that ties them together.

pub mod attributes;
pub mod codec;
pub mod http;
pub mod mdns;
pub mod queue;
pub mod server;
pub mod sink;
pub mod storage;
pub mod stream;

pub use mdns::MdnsAdvertiser;
pub use queue::PrintQueue;
pub use server::{PrintServer, Printer, ServerStats};
pub use sink::{OutputSink, Panel, RefreshingSink, StreamPanel};
pub use storage::{BlockStorage, DirectoryStorage, SpaceEstimate, StorageWriter};
pub use stream::{Exchange, IppStream, PrinterDirectory};
