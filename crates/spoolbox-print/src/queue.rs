// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Persistent per-printer job queue.
//
// Each job is one file in block storage: `<printer>.<seq>` while a client is
// writing it, `<printer>.<seq>.ok` once complete.  Canceled jobs are deleted.
// The pointer pair (`head` = newest job created, `tail` = newest job taken for
// draining) lives in `<printer>.queue` and is replaced atomically whenever it
// changes, so jobs survive restarts and drain strictly in sequence order.
// A sequence number with no file and no open writer was canceled and is
// skipped; one whose upload is still in `Writing` holds the drain.

use std::io::{Read, Write};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use spoolbox_core::error::{Result, SpoolError};
use spoolbox_core::types::{JobHandle, JobState, QueuePointers, StalledJobPolicy};

use crate::storage::{BlockStorage, SpaceEstimate, StorageWriter};

/// Suffix marking a job whose bytes are all stored.
const COMPLETED_SUFFIX: &str = ".ok";

/// Suffix of the pointer record.
const POINTER_SUFFIX: &str = ".queue";

/// A job a client slot is appending to.
struct OpenJob {
    seq: u32,
    writer: Box<dyn StorageWriter>,
    bytes: u64,
}

/// The completed job currently being drained.
struct OpenReader {
    seq: u32,
    reader: Box<dyn Read + Send>,
    remaining: u64,
}

/// FIFO of spooled jobs for one printer.
pub struct PrintQueue {
    printer: String,
    storage: Arc<dyn BlockStorage>,
    space: SpaceEstimate,
    policy: StalledJobPolicy,
    pointers: QueuePointers,
    /// Indexed by client slot; sized once at init.
    writers: Vec<Option<OpenJob>>,
    reader: Option<OpenReader>,
}

impl PrintQueue {
    /// Load (or recover) the queue for `printer` and resync the free-space
    /// estimate.
    #[instrument(skip(storage, space))]
    pub fn init(
        printer: &str,
        storage: Arc<dyn BlockStorage>,
        space: SpaceEstimate,
        policy: StalledJobPolicy,
        max_clients: usize,
    ) -> Result<Self> {
        let mut queue = Self {
            printer: printer.to_string(),
            storage,
            space,
            policy,
            pointers: QueuePointers::default(),
            writers: std::iter::repeat_with(|| None).take(max_clients).collect(),
            reader: None,
        };

        queue.pointers = queue.load_pointers()?;
        if queue.pointers.tail > queue.pointers.head {
            warn!(
                head = queue.pointers.head,
                tail = queue.pointers.tail,
                "tail ahead of head, clamping"
            );
            queue.pointers.tail = queue.pointers.head;
        }

        // The job at `tail` was being drained when the process stopped.
        let tail = queue.pointers.tail;
        if tail > 0 && queue.storage.exists(&queue.completed_name(tail)) {
            warn!(seq = tail, "discarding partially drained job");
            if let Err(e) = queue.storage.remove(&queue.completed_name(tail)) {
                warn!(seq = tail, error = %e, "could not delete drained job");
            }
        }

        if queue.policy == StalledJobPolicy::DiscardOrphans {
            for seq in queue.pointers.tail.saturating_add(1)..=queue.pointers.head {
                let name = queue.job_name(seq);
                if queue.storage.exists(&name) {
                    warn!(seq, "discarding job left incomplete by a previous run");
                    if let Err(e) = queue.storage.remove(&name) {
                        warn!(seq, error = %e, "could not delete orphaned job");
                    }
                }
            }
        }

        queue.persist_pointers()?;
        let free = queue.space.resync(queue.storage.as_ref())?;
        info!(
            head = queue.pointers.head,
            tail = queue.pointers.tail,
            free,
            "print queue ready"
        );
        Ok(queue)
    }

    pub fn printer(&self) -> &str {
        &self.printer
    }

    pub fn pointers(&self) -> QueuePointers {
        self.pointers
    }

    /// Jobs created but not yet taken for draining.
    pub fn pending_jobs(&self) -> u32 {
        self.pointers.pending()
    }

    /// Sequence number of the job `client` is writing, if any.
    pub fn open_job(&self, client: usize) -> Option<u32> {
        self.writers.get(client)?.as_ref().map(|job| job.seq)
    }

    /// Backpressure signal: false once stored bytes would eat into the
    /// safety margin.
    pub fn can_store_byte(&self) -> bool {
        self.space.can_store_byte()
    }

    /// Create the next job and attach it to `client`.
    #[instrument(skip(self), fields(printer = %self.printer))]
    pub fn start_job(&mut self, client: usize) -> Result<JobHandle> {
        let slot = self.writers.get(client).ok_or_else(|| {
            SpoolError::PrintServer(format!("client slot {client} out of range"))
        })?;
        if let Some(job) = slot {
            return Err(SpoolError::JobAlreadyOpen {
                client,
                seq: job.seq,
            });
        }

        let seq = self
            .pointers
            .head
            .checked_add(1)
            .ok_or_else(|| SpoolError::Storage("job sequence numbers exhausted".into()))?;
        let name = self.job_name(seq);
        let writer = self.storage.create(&name)?;

        let previous = self.pointers;
        self.pointers.head = seq;
        if let Err(e) = self.persist_pointers() {
            self.pointers = previous;
            if let Err(e) = self.storage.remove(&name) {
                warn!(seq, error = %e, "could not delete unrecorded job");
            }
            return Err(e);
        }

        self.writers[client] = Some(OpenJob {
            seq,
            writer,
            bytes: 0,
        });
        info!(seq, client, "job started");
        Ok(JobHandle {
            printer: self.printer.clone(),
            seq,
            state: JobState::Writing,
        })
    }

    /// Append one byte to the job `client` is writing.  Refused with
    /// [`SpoolError::QueueFull`] once the safety margin is reached.
    pub fn print_byte(&mut self, client: usize, byte: u8) -> Result<()> {
        if !self.space.can_store_byte() {
            return Err(SpoolError::QueueFull);
        }
        let job = self
            .writers
            .get_mut(client)
            .and_then(Option::as_mut)
            .ok_or(SpoolError::NoOpenJob { client })?;
        job.writer.write_all(&[byte])?;
        job.bytes += 1;
        self.space.consume(1);
        Ok(())
    }

    /// Close the job `client` is writing: delete it when `cancel`, otherwise
    /// mark it complete.  Storage failures are logged, not returned.
    #[instrument(skip(self), fields(printer = %self.printer))]
    pub fn end_job(&mut self, client: usize, cancel: bool) -> Option<JobHandle> {
        let mut job = self.writers.get_mut(client)?.take()?;
        if let Err(e) = job.writer.sync() {
            warn!(seq = job.seq, error = %e, "could not flush job");
        }
        drop(job.writer);

        let name = self.job_name(job.seq);
        let state = if cancel {
            if let Err(e) = self.storage.remove(&name) {
                warn!(seq = job.seq, error = %e, "could not delete canceled job");
            }
            info!(seq = job.seq, bytes = job.bytes, "job canceled");
            JobState::Canceled
        } else {
            if let Err(e) = self.storage.rename(&name, &self.completed_name(job.seq)) {
                warn!(seq = job.seq, error = %e, "could not mark job complete");
            }
            info!(seq = job.seq, bytes = job.bytes, "job completed");
            JobState::Completed
        };
        Some(JobHandle {
            printer: self.printer.clone(),
            seq: job.seq,
            state,
        })
    }

    /// True when a byte is ready for the sink.
    ///
    /// Deletes an exhausted job and opens the next completed one on the way.
    pub fn has_data(&mut self) -> bool {
        loop {
            if let Some(open) = &self.reader {
                if open.remaining > 0 {
                    return true;
                }
                let seq = open.seq;
                self.reader = None;
                if let Err(e) = self.storage.remove(&self.completed_name(seq)) {
                    warn!(printer = %self.printer, seq, error = %e, "could not delete drained job");
                }
                debug!(printer = %self.printer, seq, "job drained");
            }

            if self.pointers.tail >= self.pointers.head {
                return false;
            }
            let next = self.pointers.tail + 1;
            let completed = self.completed_name(next);

            if self.storage.exists(&completed) {
                let (reader, len) = match self.storage.open(&completed) {
                    Ok(opened) => opened,
                    Err(e) => {
                        warn!(printer = %self.printer, seq = next, error = %e, "could not open job");
                        return false;
                    }
                };
                self.advance_tail(next);
                debug!(printer = %self.printer, seq = next, len, "draining job");
                self.reader = Some(OpenReader {
                    seq: next,
                    reader,
                    remaining: len,
                });
                continue;
            }

            let writing = self.storage.exists(&self.job_name(next))
                || self.writers.iter().flatten().any(|job| job.seq == next);
            if writing {
                return false;
            }
            debug!(printer = %self.printer, seq = next, "skipping canceled job");
            self.advance_tail(next);
        }
    }

    /// Next byte of the job being drained.  Call after [`has_data`].
    ///
    /// [`has_data`]: PrintQueue::has_data
    pub fn read_data(&mut self) -> Result<u8> {
        let open = self
            .reader
            .as_mut()
            .filter(|open| open.remaining > 0)
            .ok_or(SpoolError::NoReadableJob)?;
        let mut byte = [0u8; 1];
        if let Err(e) = open.reader.read_exact(&mut byte) {
            // Shorter than its recorded length; finish it early.
            open.remaining = 0;
            return Err(e.into());
        }
        open.remaining -= 1;
        Ok(byte[0])
    }

    fn job_name(&self, seq: u32) -> String {
        format!("{}.{seq}", self.printer)
    }

    fn completed_name(&self, seq: u32) -> String {
        format!("{}.{seq}{COMPLETED_SUFFIX}", self.printer)
    }

    fn pointer_name(&self) -> String {
        format!("{}{POINTER_SUFFIX}", self.printer)
    }

    fn advance_tail(&mut self, seq: u32) {
        self.pointers.tail = seq;
        if let Err(e) = self.persist_pointers() {
            warn!(printer = %self.printer, seq, error = %e, "could not persist queue pointers");
        }
    }

    fn persist_pointers(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.pointers)?;
        self.storage.replace(&self.pointer_name(), &bytes)
    }

    fn load_pointers(&self) -> Result<QueuePointers> {
        match self.storage.read(&self.pointer_name())? {
            Some(bytes) => match serde_json::from_slice::<QueuePointers>(&bytes) {
                Ok(pointers) => Ok(pointers),
                Err(e) => {
                    warn!(error = %e, "queue record unreadable, rebuilding from job files");
                    self.scan_pointers()
                }
            },
            None => self.scan_pointers(),
        }
    }

    /// Rebuild the pointer pair from the job files present in storage.
    fn scan_pointers(&self) -> Result<QueuePointers> {
        let prefix = format!("{}.", self.printer);
        let seqs: Vec<u32> = self
            .storage
            .list(&prefix)?
            .iter()
            .filter_map(|name| {
                let rest = name.strip_prefix(&prefix)?;
                let digits = rest.strip_suffix(COMPLETED_SUFFIX).unwrap_or(rest);
                digits.parse::<u32>().ok()
            })
            .filter(|&seq| seq > 0)
            .collect();

        let pointers = match (seqs.iter().min(), seqs.iter().max()) {
            (Some(&lowest), Some(&highest)) => QueuePointers {
                head: highest,
                tail: lowest - 1,
            },
            _ => QueuePointers::default(),
        };
        if pointers.head > 0 {
            info!(head = pointers.head, tail = pointers.tail, "recovered queue from job files");
        }
        Ok(pointers)
    }
}
