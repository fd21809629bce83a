//! Poll loop driven by the scriptable reader.

use spooltag_protocol::defaults::WRITE_PROTECTED_STATUS;
use spooltag_protocol::ndef::{self, CapabilityContainer, OwnedRecord};
use spooltag_protocol::ReadEvent;
use spooltag_reader::{
    CancellationToken, CardReader, ErrorPolicy, LoopConfig, MockCard, MockReader, ReaderError, ReaderHandle,
    ReaderLoop, TagEvents,
};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Tag(ReadEvent),
    NoTag,
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

impl TagEvents for Recorder {
    fn tag_present(&self, event: &ReadEvent) {
        self.seen.lock().unwrap().push(Seen::Tag(event.clone()));
    }

    fn no_tag(&self) {
        self.seen.lock().unwrap().push(Seen::NoTag);
    }
}

fn config(policy: ErrorPolicy) -> LoopConfig {
    LoopConfig {
        poll_interval: Duration::from_millis(10),
        write_timeout: Duration::from_millis(2000),
        error_policy: policy,
    }
}

fn start(policy: ErrorPolicy) -> (ReaderHandle, MockCard, Arc<Recorder>) {
    let (reader, card) = MockReader::new();
    let recorder = Arc::new(Recorder::default());
    let handle = ReaderLoop::start(
        move || Ok(Box::new(reader) as Box<dyn CardReader>),
        recorder.clone(),
        config(policy),
        CancellationToken::new(),
    )
    .unwrap();
    (handle, card, recorder)
}

fn text_card(text: &str) -> Vec<u8> {
    let message = ndef::encode_message(&[OwnedRecord::text(text, "en")]);
    ndef::wrap_ndef_message(&CapabilityContainer::new(128), &message).unwrap()
}

fn card_text(memory: &[u8]) -> String {
    let records = ndef::read_message(memory).unwrap();
    ndef::decode_text(records[0].payload(memory)).unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_pending_write_lands_on_next_card() {
    let (handle, card, recorder) = start(ErrorPolicy::Stop);
    let writer = handle.writer();
    let request = thread::spawn(move || writer.write_to_tag(5, 12));

    thread::sleep(Duration::from_millis(100));
    card.present(&[0x04, 0x0a], Some(text_card("old")));

    assert!(request.join().unwrap());
    assert_eq!(card_text(&card.memory().unwrap()), "SPOOL:5\nFILAMENT:12\n");
    assert!(wait_until(|| recorder.seen().iter().any(|s| matches!(
        s,
        Seen::Tag(event) if card_text(event.memory().unwrap()) == "SPOOL:5\nFILAMENT:12\n"
    ))));
    if let Some(Seen::Tag(event)) = recorder.seen().first() {
        assert_eq!(event.identifier, "4:a");
    }
    handle.stop();
    handle.join().unwrap();
}

#[test]
fn test_write_without_card_times_out() {
    let (reader, _card) = MockReader::new();
    let handle = ReaderLoop::start(
        move || Ok(Box::new(reader) as Box<dyn CardReader>),
        Arc::new(Recorder::default()),
        LoopConfig {
            write_timeout: Duration::from_millis(300),
            ..config(ErrorPolicy::Stop)
        },
        CancellationToken::new(),
    )
    .unwrap();

    let start = Instant::now();
    assert!(!handle.write_to_tag(5, 12));
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[test]
fn test_unformatted_card_reports_no_tag_and_refuses_writes() {
    let (handle, card, recorder) = start(ErrorPolicy::Stop);
    card.present(&[0x01], None);
    assert!(wait_until(|| recorder.seen().contains(&Seen::NoTag)));

    let writer = handle.writer();
    let request = thread::spawn(move || writer.write_to_tag(1, 2));
    assert!(wait_until(|| handle.status() == WRITE_PROTECTED_STATUS));
    assert_eq!(card.writes(), 0);
    assert!(!request.join().unwrap());
}

#[test]
fn test_content_change_is_reported_once() {
    let (handle, card, recorder) = start(ErrorPolicy::Stop);
    card.present(&[0x01], Some(text_card("SPOOL:1\nFILAMENT:2\n")));
    assert!(wait_until(|| recorder.seen().len() == 1));

    thread::sleep(Duration::from_millis(100));
    assert_eq!(recorder.seen().len(), 1);

    card.present(&[0x01], Some(text_card("SPOOL:3\nFILAMENT:4\n")));
    assert!(wait_until(|| recorder.seen().len() == 2));
    handle.stop();
}

#[test]
fn test_transient_fault_is_survived() {
    let (handle, card, recorder) = start(ErrorPolicy::Stop);
    card.inject_fault(ReaderError::Timeout("poll".to_string()));
    card.inject_fault(ReaderError::Protocol("crc".to_string()));
    card.present(&[0x02], Some(text_card("x")));

    assert!(wait_until(|| !recorder.seen().is_empty()));
    assert!(!handle.is_finished());
}

#[test]
fn test_fatal_fault_policy() {
    let (handle, card, _) = start(ErrorPolicy::Stop);
    card.inject_fault(ReaderError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "gone")));
    assert!(wait_until(|| handle.is_finished()));
    assert!(matches!(handle.join(), Err(ReaderError::Io(_))));

    let (handle, card, recorder) = start(ErrorPolicy::Continue);
    card.inject_fault(ReaderError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "gone")));
    card.present(&[0x03], Some(text_card("y")));
    assert!(wait_until(|| !recorder.seen().is_empty()));
    assert!(!handle.is_finished());
}

#[test]
fn test_open_failure_is_returned_from_start() {
    let result = ReaderLoop::start(
        || Err(ReaderError::UnsupportedDevice("usb".to_string())),
        Arc::new(Recorder::default()),
        LoopConfig::default(),
        CancellationToken::new(),
    );
    assert!(matches!(result, Err(ReaderError::UnsupportedDevice(_))));
}
