//! Card reader ownership, the poll loop and the write hand-off.
//!
//! The reader is opened and driven by a single thread. Other threads only
//! talk to it through [`TagWriter`], which blocks until the next card in
//! the field was written or the timeout elapsed.

pub mod cancel;
pub mod coordinator;
pub mod error;
pub mod mock;
pub mod poll;
pub mod reader;

pub use cancel::CancellationToken;
pub use coordinator::{TagWriter, WriteOutcome, WriteSlot};
pub use error::{ErrorPolicy, ReaderError, Result};
pub use mock::{DemoReader, MockCard, MockReader};
pub use poll::{LoopConfig, ReaderHandle, ReaderLoop, TagEvents};
pub use reader::{open_device, Card, CardReader, FileReader};
