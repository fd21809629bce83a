//! Poll loop owning the card reader.
//!
//! One iteration per card in the field:
//!
//! ```text
//! connect ─► pending write? ─► no NDEF ─► no_tag()
//!                          └─► NDEF    ─► tag_present(event)
//!    while sense(): pending write? / re-read, report changed content, sleep
//! ```

use crate::cancel::CancellationToken;
use crate::coordinator::{TagWriter, WriteSlot};
use crate::error::{ErrorPolicy, ReaderError, Result};
use crate::reader::CardReader;
use spooltag_protocol::defaults::{
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_WRITE_TIMEOUT_SECS, WRITE_FAILED_STATUS, WRITE_PROTECTED_STATUS,
};
use spooltag_protocol::ndef::{self, CapabilityContainer};
use spooltag_protocol::{format_identifier, ReadEvent, WriteRequest};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Receives what the poll loop sees. Called on the poll loop thread.
pub trait TagEvents: Send + Sync {
    fn tag_present(&self, event: &ReadEvent);

    /// A card without NDEF content is in the field.
    fn no_tag(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    pub poll_interval: Duration,
    pub write_timeout: Duration,
    pub error_policy: ErrorPolicy,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            error_policy: ErrorPolicy::default(),
        }
    }
}

pub struct ReaderLoop {
    reader: Box<dyn CardReader>,
    events: Arc<dyn TagEvents>,
    slot: Arc<WriteSlot>,
    status: Arc<Mutex<String>>,
    cancel: CancellationToken,
    config: LoopConfig,
}

/// Handle to a running poll loop.
pub struct ReaderHandle {
    writer: TagWriter,
    cancel: CancellationToken,
    thread: Option<JoinHandle<Result<()>>>,
}

impl ReaderLoop {
    /// Spawn the poll loop thread. `open` runs on that thread; its failure
    /// is returned here.
    pub fn start<F>(open: F, events: Arc<dyn TagEvents>, config: LoopConfig, cancel: CancellationToken) -> Result<ReaderHandle>
    where
        F: FnOnce() -> Result<Box<dyn CardReader>> + Send + 'static,
    {
        let slot = Arc::new(WriteSlot::new());
        let status = Arc::new(Mutex::new(String::new()));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let thread = {
            let slot = slot.clone();
            let status = status.clone();
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("spooltag-reader".to_string())
                .spawn(move || {
                    let reader = match open() {
                        Ok(reader) => reader,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return Ok(());
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    ReaderLoop {
                        reader,
                        events,
                        slot,
                        status,
                        cancel,
                        config,
                    }
                    .run()
                })?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(ReaderError::Thread(format!("reader initialization failed: {}", e))),
        }
        info!(poll_ms = config.poll_interval.as_millis() as u64, "reader loop started");

        Ok(ReaderHandle {
            writer: TagWriter::new(slot, status, config.write_timeout),
            cancel,
            thread: Some(thread),
        })
    }

    fn run(mut self) -> Result<()> {
        while !self.cancel.is_cancelled() {
            match self.poll_once() {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "transient reader fault");
                    self.cancel.sleep(self.config.poll_interval);
                }
                Err(e) => match self.config.error_policy {
                    ErrorPolicy::Continue => {
                        error!(error = %e, "reader fault");
                        self.cancel.sleep(self.config.poll_interval);
                    }
                    ErrorPolicy::Stop => {
                        error!(error = %e, "reader loop stopped");
                        return Err(e);
                    }
                },
            }
        }
        info!("reader loop finished");
        Ok(())
    }

    fn poll_once(&mut self) -> Result<()> {
        let Some(card) = self.reader.connect()? else {
            self.cancel.sleep(self.config.poll_interval);
            return Ok(());
        };
        let uid = card.uid;
        let mut memory = card.memory;

        self.service_write(&mut memory)?;
        self.report(&uid, &memory);
        let mut last = memory;

        // Wait for removal
        while !self.cancel.is_cancelled() && self.reader.sense()? {
            let mut current = last.clone();
            let wrote = self.service_write(&mut current)?;
            if !wrote {
                current = self.reader.read()?;
            }
            if wrote || current != last {
                self.report(&uid, &current);
                last = current;
            }
            self.cancel.sleep(self.config.poll_interval);
        }
        debug!(identifier = %format_identifier(&uid), "card left the field");
        Ok(())
    }

    fn report(&self, uid: &[u8], memory: &Option<Vec<u8>>) {
        let has_ndef = memory
            .as_deref()
            .is_some_and(|m| ndef::locate_message(m).is_ok());
        if has_ndef {
            self.events.tag_present(&ReadEvent::new(memory.clone(), uid));
        } else {
            self.events.no_tag();
        }
    }

    /// Write the pending request, if any. Returns whether a write happened.
    fn service_write(&mut self, memory: &mut Option<Vec<u8>>) -> Result<bool> {
        let Some((generation, request)) = self.slot.take() else {
            return Ok(false);
        };

        match self.write_card(memory.as_deref(), request) {
            Ok(written) => {
                info!(spool = request.spool, filament = request.filament, "wrote tag");
                *memory = Some(written);
                self.set_status("");
                self.slot.complete(generation);
                Ok(true)
            }
            Err(ReaderError::WriteProtected) => {
                warn!(?request, "tag is write protected");
                self.set_status(WRITE_PROTECTED_STATUS);
                Ok(false)
            }
            Err(e) if e.is_transient() || matches!(e, ReaderError::Framing(_)) => {
                warn!(?request, error = %e, "failed to write tag");
                self.set_status(WRITE_FAILED_STATUS);
                Ok(false)
            }
            Err(e) => {
                self.set_status(WRITE_FAILED_STATUS);
                Err(e)
            }
        }
    }

    fn write_card(&mut self, memory: Option<&[u8]>, request: WriteRequest) -> Result<Vec<u8>> {
        // Only NDEF formatted cards are written
        let memory = memory.ok_or(ReaderError::WriteProtected)?;
        let cc = CapabilityContainer::parse(memory).map_err(|_| ReaderError::WriteProtected)?;
        if !cc.is_writable() {
            return Err(ReaderError::WriteProtected);
        }

        let mut image = memory.to_vec();
        ndef::replace_ndef_message(&mut image, &ndef::text_record_message(request.spool, request.filament))?;
        self.reader.write(&image)?;
        Ok(image)
    }

    fn set_status(&self, status: &str) {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        current.clear();
        current.push_str(status);
    }
}

impl ReaderHandle {
    /// Handle for other threads to request writes.
    pub fn writer(&self) -> TagWriter {
        self.writer.clone()
    }

    pub fn write_to_tag(&self, spool: u64, filament: u64) -> bool {
        self.writer.write_to_tag(spool, filament)
    }

    pub fn status(&self) -> String {
        self.writer.status()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the loop thread and return how it ended.
    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| ReaderError::Thread("reader thread panicked".to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
