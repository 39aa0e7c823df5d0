//! In-memory [`Medium`] with scripted faults, for tests and the simulator.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::{Medium, MediumError};

const SCAN_CHUNK: usize = 64;

/// Scripted failures. Counters are consumed one per affected operation.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Mounts that fail with an I/O error.
    pub failing_mounts: u32,
    /// Appends that fail with an I/O error before writing anything.
    pub failing_appends: u32,
    /// Appends that report zero bytes written.
    pub zero_writes: u32,
    /// Appends that write only half of the data.
    pub short_writes: u32,
    /// Appends that report success but write nothing.
    pub silent_drops: u32,
    pub rename_unsupported: bool,
    /// Files that exist but cannot be opened.
    pub unreadable: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryMedium {
    files: BTreeMap<String, Vec<u8>>,
    card_present: bool,
    mounted: bool,
    mounts: u32,
    faults: Faults,
}

impl MemoryMedium {
    /// A medium with an empty card inserted.
    pub fn new() -> Self {
        Self {
            card_present: true,
            ..Default::default()
        }
    }

    /// Pull the card. Files survive and reappear on [`Self::insert`].
    pub fn eject(&mut self) {
        self.card_present = false;
        self.mounted = false;
    }

    pub fn insert(&mut self) {
        self.card_present = true;
    }

    pub fn card_present(&self) -> bool {
        self.card_present
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Number of successful mounts so far.
    pub fn mounts(&self) -> u32 {
        self.mounts
    }

    pub fn faults_mut(&mut self) -> &mut Faults {
        &mut self.faults
    }

    pub fn file(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    /// Place a file on the card directly, bypassing mount state.
    pub fn set_file(&mut self, name: &str, contents: &[u8]) {
        self.files.insert(name.to_string(), contents.to_vec());
    }

    /// Delete a file behind the store's back.
    pub fn delete_file(&mut self, name: &str) -> bool {
        self.files.remove(name).is_some()
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    fn ready(&self) -> Result<(), MediumError> {
        if !self.card_present {
            Err(MediumError::NoCard)
        } else if !self.mounted {
            Err(MediumError::NotMounted)
        } else {
            Ok(())
        }
    }

    fn readable(&self, name: &str) -> Result<&Vec<u8>, MediumError> {
        self.ready()?;
        if self.faults.unreadable.contains(name) {
            return Err(MediumError::Io("file cannot be opened"));
        }
        self.files.get(name).ok_or(MediumError::NotFound)
    }
}

fn take(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

impl Medium for MemoryMedium {
    fn mount(&mut self) -> Result<(), MediumError> {
        if !self.card_present {
            return Err(MediumError::NoCard);
        }
        if take(&mut self.faults.failing_mounts) {
            return Err(MediumError::Io("card did not answer"));
        }
        self.mounted = true;
        self.mounts += 1;
        Ok(())
    }

    fn unmount(&mut self) {
        self.mounted = false;
    }

    fn exists(&mut self, name: &str) -> Result<bool, MediumError> {
        self.ready()?;
        Ok(self.files.contains_key(name))
    }

    fn size(&mut self, name: &str) -> Result<u64, MediumError> {
        Ok(self.readable(name)?.len() as u64)
    }

    fn create(&mut self, name: &str, contents: &[u8]) -> Result<usize, MediumError> {
        self.ready()?;
        self.faults.unreadable.remove(name);
        self.files.insert(name.to_string(), contents.to_vec());
        Ok(contents.len())
    }

    fn append(&mut self, name: &str, data: &[u8]) -> Result<usize, MediumError> {
        self.ready()?;
        if take(&mut self.faults.failing_appends) {
            return Err(MediumError::Io("write rejected"));
        }
        if self.faults.unreadable.contains(name) {
            return Err(MediumError::Io("file cannot be opened"));
        }
        if take(&mut self.faults.zero_writes) {
            return Ok(0);
        }
        let written = if take(&mut self.faults.short_writes) {
            data.len() / 2
        } else {
            data.len()
        };
        let silent = take(&mut self.faults.silent_drops);
        let file = self.files.entry(name.to_string()).or_default();
        if silent {
            return Ok(data.len());
        }
        file.extend_from_slice(&data[..written]);
        Ok(written)
    }

    fn scan<F: FnMut(&[u8])>(&mut self, name: &str, mut visit: F) -> Result<u64, MediumError> {
        let contents = self.readable(name)?;
        for chunk in contents.chunks(SCAN_CHUNK) {
            visit(chunk);
        }
        Ok(contents.len() as u64)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), MediumError> {
        self.ready()?;
        if self.faults.rename_unsupported {
            return Err(MediumError::Unsupported);
        }
        let contents = self.files.remove(from).ok_or(MediumError::NotFound)?;
        self.files.insert(to.to_string(), contents);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<(), MediumError> {
        self.ready()?;
        self.faults.unreadable.remove(name);
        self.files.remove(name).map(|_| ()).ok_or(MediumError::NotFound)
    }
}
