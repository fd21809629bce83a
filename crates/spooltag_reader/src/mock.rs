//! Readers without hardware.

use crate::error::{ReaderError, Result};
use crate::reader::{Card, CardReader};
use spooltag_protocol::ndef::{self, CapabilityContainer};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

// ============================================================================
// Scriptable reader
// ============================================================================

#[derive(Debug, Default)]
struct MockState {
    card: Option<Card>,
    write_protected: bool,
    writes: usize,
    faults: VecDeque<ReaderError>,
}

/// Reader driven from a [`MockCard`] handle, for tests.
#[derive(Debug, Clone, Default)]
pub struct MockReader {
    state: Arc<Mutex<MockState>>,
}

/// Controls what a [`MockReader`] sees.
#[derive(Debug, Clone)]
pub struct MockCard {
    state: Arc<Mutex<MockState>>,
}

impl MockReader {
    pub fn new() -> (Self, MockCard) {
        let reader = Self::default();
        let handle = MockCard {
            state: reader.state.clone(),
        };
        (reader, handle)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_fault(&self) -> Result<()> {
        match self.lock().faults.pop_front() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

impl MockCard {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place a card in the field.
    pub fn present(&self, uid: &[u8], memory: Option<Vec<u8>>) {
        self.lock().card = Some(Card {
            uid: uid.to_vec(),
            memory,
        });
    }

    pub fn remove(&self) {
        self.lock().card = None;
    }

    /// Memory of the card in the field.
    pub fn memory(&self) -> Option<Vec<u8>> {
        self.lock().card.as_ref().and_then(|c| c.memory.clone())
    }

    pub fn set_write_protected(&self, protected: bool) {
        self.lock().write_protected = protected;
    }

    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Fail the next reader call with `fault`.
    pub fn inject_fault(&self, fault: ReaderError) {
        self.lock().faults.push_back(fault);
    }
}

impl CardReader for MockReader {
    fn connect(&mut self) -> Result<Option<Card>> {
        self.next_fault()?;
        Ok(self.lock().card.clone())
    }

    fn sense(&mut self) -> Result<bool> {
        self.next_fault()?;
        Ok(self.lock().card.is_some())
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        self.next_fault()?;
        Ok(self.lock().card.as_ref().and_then(|c| c.memory.clone()))
    }

    fn write(&mut self, memory: &[u8]) -> Result<()> {
        self.next_fault()?;
        let mut state = self.lock();
        if state.write_protected {
            return Err(ReaderError::WriteProtected);
        }
        let card = state
            .card
            .as_mut()
            .ok_or_else(|| ReaderError::Protocol("card left the field".to_string()))?;
        card.memory = Some(memory.to_vec());
        state.writes += 1;
        Ok(())
    }
}

// ============================================================================
// Demo reader
// ============================================================================

const DEMO_PHASE: Duration = Duration::from_secs(2);
const DEMO_CARD_SIZE: usize = 64;

/// Alternates every two seconds between a text card naming one of the
/// sample spools and an unformatted card.
#[derive(Debug)]
pub struct DemoReader {
    started: Instant,
    connected_phase: Option<u64>,
    memory: Option<Vec<u8>>,
}

impl DemoReader {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            connected_phase: None,
            memory: None,
        }
    }

    fn phase(&self) -> u64 {
        (self.started.elapsed().as_millis() / DEMO_PHASE.as_millis()) as u64
    }

    fn card(iteration: u64) -> Result<Card> {
        let uid = vec![0xaa, 0xbb, 0xcc, 0xdd, (iteration % 10) as u8];
        if iteration % 2 == 0 {
            return Ok(Card { uid, memory: None });
        }
        let message = ndef::text_record_message(1 + iteration % 3, 10 + iteration % 3);
        let memory = ndef::wrap_ndef_message(&CapabilityContainer::new(DEMO_CARD_SIZE), &message)?;
        Ok(Card {
            uid,
            memory: Some(memory),
        })
    }
}

impl Default for DemoReader {
    fn default() -> Self {
        Self::new()
    }
}

impl CardReader for DemoReader {
    fn connect(&mut self) -> Result<Option<Card>> {
        let phase = self.phase();
        let card = Self::card(phase)?;
        self.connected_phase = Some(phase);
        self.memory = card.memory.clone();
        Ok(Some(card))
    }

    fn sense(&mut self) -> Result<bool> {
        Ok(self.connected_phase == Some(self.phase()))
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.memory.clone())
    }

    fn write(&mut self, memory: &[u8]) -> Result<()> {
        self.memory = Some(memory.to_vec());
        Ok(())
    }
}
