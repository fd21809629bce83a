//! Card reader seam and the file-backed reader.

use crate::error::{ReaderError, Result};
use crate::mock::DemoReader;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A card in the reader's field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    pub uid: Vec<u8>,
    /// Raw memory, `None` when the card could not be read.
    pub memory: Option<Vec<u8>>,
}

/// Hardware access. Owned by the poll loop thread for its whole life.
pub trait CardReader: Send {
    /// Poll for a card entering the field.
    fn connect(&mut self) -> Result<Option<Card>>;

    /// Whether the connected card is still in the field.
    fn sense(&mut self) -> Result<bool>;

    /// Read the connected card's memory again.
    fn read(&mut self) -> Result<Option<Vec<u8>>>;

    /// Write a full memory image to the connected card.
    fn write(&mut self, memory: &[u8]) -> Result<()>;
}

/// Open a reader from a device string.
///
/// - `mock`: cycles through sample cards every two seconds
/// - `file:<path>`: card image file, present while it exists
pub fn open_device(device: &str) -> Result<Box<dyn CardReader>> {
    if device == "mock" {
        info!("using demo card reader");
        return Ok(Box::new(DemoReader::new()));
    }
    if let Some(path) = device.strip_prefix("file:") {
        return Ok(Box::new(FileReader::open(path)?));
    }
    Err(ReaderError::UnsupportedDevice(device.to_string()))
}

// ============================================================================
// File-backed reader
// ============================================================================

/// Treats a file as the memory of a card lying on the reader.
///
/// The card UID is read from `<path>.uid` (hex, `:` separators allowed)
/// when that file exists.
#[derive(Debug)]
pub struct FileReader {
    path: PathBuf,
}

impl FileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if !parent.is_dir() {
            return Err(ReaderError::Open {
                device: format!("file:{}", path.display()),
                message: format!("directory {} does not exist", parent.display()),
            });
        }
        Ok(Self { path })
    }

    fn uid_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".uid");
        PathBuf::from(name)
    }

    fn uid(&self) -> Result<Vec<u8>> {
        match fs::read_to_string(self.uid_path()) {
            Ok(text) => {
                let digits: String = text.chars().filter(|c| c.is_ascii_hexdigit()).collect();
                hex::decode(digits).map_err(|e| ReaderError::Protocol(format!("bad uid file: {}", e)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl CardReader for FileReader {
    fn connect(&mut self) -> Result<Option<Card>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let uid = self.uid()?;
        let memory = self.read()?;
        debug!(path = %self.path.display(), uid = %hex::encode(&uid), "card image present");
        Ok(Some(Card { uid, memory }))
    }

    fn sense(&mut self) -> Result<bool> {
        Ok(self.path.exists())
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, memory: &[u8]) -> Result<()> {
        fs::write(&self.path, memory)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_reader_presence_and_uid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("card.bin");
        let mut reader = FileReader::open(&path).unwrap();
        assert!(reader.connect().unwrap().is_none());

        fs::write(&path, [0xE1, 0x40, 0x08, 0x01]).unwrap();
        fs::write(dir.path().join("card.bin.uid"), "04:0a:ff\n").unwrap();
        let card = reader.connect().unwrap().unwrap();
        assert_eq!(card.uid, vec![0x04, 0x0a, 0xff]);
        assert_eq!(card.memory.as_deref(), Some(&[0xE1, 0x40, 0x08, 0x01][..]));
        assert!(reader.sense().unwrap());

        reader.write(&[1, 2, 3]).unwrap();
        assert_eq!(reader.read().unwrap(), Some(vec![1, 2, 3]));

        fs::remove_file(&path).unwrap();
        assert!(!reader.sense().unwrap());
    }

    #[test]
    fn test_open_device() {
        assert!(open_device("mock").is_ok());
        assert!(matches!(
            open_device("usb:054c:06c3"),
            Err(ReaderError::UnsupportedDevice(_))
        ));
        assert!(matches!(
            open_device("file:/nonexistent-dir/card.bin"),
            Err(ReaderError::Open { .. })
        ));
    }
}
