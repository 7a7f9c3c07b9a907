// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Output sinks: where drained job bytes end up.
//
// The drain step asks `can_accept()` before every byte and simply tries again
// on a later tick when the device is busy, so a slow panel never stalls the
// connection loop.

use std::io::Write;

use tracing::trace;

use spoolbox_core::error::{Result, SpoolError};

/// Byte consumer fed by a printer's drain step.
pub trait OutputSink: Send {
    /// True when `write_byte` would be accepted right now.
    fn can_accept(&self) -> bool;

    /// Hand one byte to the device.  Fails with
    /// [`SpoolError::SinkUnavailable`] while the device is busy.
    fn write_byte(&mut self, byte: u8) -> Result<()>;
}

/// A display-like device that needs explicit refreshes.
pub trait Panel: Send {
    /// True while a refresh is still in progress.
    fn is_busy(&self) -> bool;

    /// Place one byte in the device's frame buffer.
    fn draw_byte(&mut self, byte: u8) -> Result<()>;

    /// Slow, complete refresh that clears ghosting.
    fn full_refresh(&mut self) -> Result<()>;

    /// Fast refresh of what changed since the last one.
    fn partial_refresh(&mut self) -> Result<()>;
}

/// Drives a [`Panel`] with a fixed full/partial refresh cadence.
///
/// Every `threshold`-th byte triggers a full refresh; the bytes in between
/// get partial refreshes.
pub struct RefreshingSink<P: Panel> {
    panel: P,
    threshold: u32,
    since_full: u32,
}

impl<P: Panel> RefreshingSink<P> {
    pub fn new(panel: P, threshold: u32) -> Self {
        Self {
            panel,
            threshold: threshold.max(1),
            since_full: 0,
        }
    }

    pub fn panel(&self) -> &P {
        &self.panel
    }

    pub fn into_panel(self) -> P {
        self.panel
    }
}

impl<P: Panel> OutputSink for RefreshingSink<P> {
    fn can_accept(&self) -> bool {
        !self.panel.is_busy()
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        if self.panel.is_busy() {
            return Err(SpoolError::SinkUnavailable);
        }
        self.panel.draw_byte(byte)?;
        self.since_full += 1;
        if self.since_full >= self.threshold {
            self.since_full = 0;
            trace!("full refresh");
            self.panel.full_refresh()
        } else {
            self.panel.partial_refresh()
        }
    }
}

/// Panel that writes bytes to any writer, e.g. stdout or a file.
#[derive(Debug)]
pub struct StreamPanel<W: Write + Send> {
    out: W,
    full_refreshes: u64,
    partial_refreshes: u64,
}

impl<W: Write + Send> StreamPanel<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            full_refreshes: 0,
            partial_refreshes: 0,
        }
    }

    pub fn full_refreshes(&self) -> u64 {
        self.full_refreshes
    }

    pub fn partial_refreshes(&self) -> u64 {
        self.partial_refreshes
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }
}

impl<W: Write + Send> Panel for StreamPanel<W> {
    fn is_busy(&self) -> bool {
        false
    }

    fn draw_byte(&mut self, byte: u8) -> Result<()> {
        self.out
            .write_all(&[byte])
            .map_err(|e| SpoolError::Sink(e.to_string()))
    }

    fn full_refresh(&mut self) -> Result<()> {
        self.full_refreshes += 1;
        self.out.flush().map_err(|e| SpoolError::Sink(e.to_string()))
    }

    fn partial_refresh(&mut self) -> Result<()> {
        self.partial_refreshes += 1;
        Ok(())
    }
}
