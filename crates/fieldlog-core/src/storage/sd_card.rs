use alloc::string::String;
use core::fmt::Debug;

use embedded_sdmmc::{Directory, Mode, SdCard, TimeSource, VolumeIdx, VolumeManager};
use log::{debug, warn};

use super::{Medium, MediumError};

const COPY_CHUNK: usize = 512;

type Volumes<S, D, T> = VolumeManager<SdCard<S, D>, T, 4, 4, 1>;
type Dir<'v, S, D, T> = Directory<'v, SdCard<S, D>, T, 4, 4, 1>;

impl<E: Debug> From<embedded_sdmmc::Error<E>> for MediumError {
    fn from(e: embedded_sdmmc::Error<E>) -> Self {
        debug!("SD card error: {:?}", e);
        match e {
            embedded_sdmmc::Error::DeviceError(_) => MediumError::NoCard,
            embedded_sdmmc::Error::NotFound => MediumError::NotFound,
            embedded_sdmmc::Error::Unsupported => MediumError::Unsupported,
            embedded_sdmmc::Error::DiskFull | embedded_sdmmc::Error::NotEnoughSpace => {
                MediumError::Io("card full")
            }
            _ => MediumError::Io("filesystem error"),
        }
    }
}

/// FAT location of a log file name.
///
/// The volume only holds 8.3 short names, so archive names of the form
/// `data_YYYYMMDD_HHMMSS.csv` are kept as `YYYYMMDD/HHMMSS.CSV`. Other names are
/// used as-is in the root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatPath<'n> {
    pub dir: Option<&'n str>,
    pub file: FileName<'n>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileName<'n> {
    Borrowed(&'n str),
    Archive(String),
}

impl FileName<'_> {
    pub fn as_str(&self) -> &str {
        match self {
            FileName::Borrowed(name) => name,
            FileName::Archive(name) => name.as_str(),
        }
    }
}

impl<'n> FatPath<'n> {
    pub fn of(name: &'n str) -> Self {
        let archive = name
            .strip_prefix("data_")
            .and_then(|rest| rest.strip_suffix(".csv"))
            .and_then(|stamp| stamp.split_once('_'))
            .filter(|(date, time)| {
                date.len() == 8
                    && time.len() == 6
                    && date.bytes().chain(time.bytes()).all(|b| b.is_ascii_digit())
            });

        match archive {
            Some((date, time)) => {
                let mut file = String::with_capacity(10);
                file.push_str(time);
                file.push_str(".CSV");
                FatPath {
                    dir: Some(date),
                    file: FileName::Archive(file),
                }
            }
            None => FatPath {
                dir: None,
                file: FileName::Borrowed(name),
            },
        }
    }
}

/// [`Medium`] on a FAT-formatted SD card over SPI.
///
/// These operations are blocking, like every other user of the SPI bus. Handles are
/// opened per operation and closed before returning. Mounting rebuilds the volume
/// manager around the card, dropping any cached blocks of a card that was swapped out.
pub struct SdCardMedium<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    /// Only `None` while the manager is being rebuilt.
    volume_mgr: Option<Volumes<S, D, T>>,
    mounted: bool,
}

impl<S, D, T> SdCardMedium<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    pub fn new(sd_card: SdCard<S, D>, ts: T) -> Self {
        Self {
            volume_mgr: Some(VolumeManager::new(sd_card, ts)),
            mounted: false,
        }
    }

    /// Hand the card to a fresh volume manager, forcing it through its init sequence on
    /// the next access. `inspect` runs on the bare card in between.
    fn reset_card<R>(&mut self, inspect: impl FnOnce(&SdCard<S, D>) -> R) -> Option<R> {
        let (card, ts) = self.volume_mgr.take()?.free();
        card.mark_card_uninit();
        let result = inspect(&card);
        self.volume_mgr = Some(VolumeManager::new(card, ts));
        Some(result)
    }

    /// Run `f` with the root directory of the volume open.
    fn with_root<R>(
        &self,
        f: impl FnOnce(&Dir<'_, S, D, T>) -> Result<R, MediumError>,
    ) -> Result<R, MediumError> {
        let Some(volume_mgr) = self.volume_mgr.as_ref().filter(|_| self.mounted) else {
            return Err(MediumError::NotMounted);
        };
        let volume = volume_mgr.open_volume(VolumeIdx(0))?;
        let root = volume.open_root_dir()?;
        let result = f(&root);
        root.close()?;
        volume.close()?;
        result
    }

    /// Run `f` in the directory holding `path`, creating that directory when `create` is set.
    fn in_dir<R>(
        &self,
        path: &FatPath<'_>,
        create: bool,
        f: impl FnOnce(&Dir<'_, S, D, T>) -> Result<R, MediumError>,
    ) -> Result<R, MediumError> {
        self.with_root(|root| in_subdir(root, path.dir, create, f))
    }
}

fn in_subdir<S, D, T, R>(
    root: &Dir<'_, S, D, T>,
    dir: Option<&str>,
    create: bool,
    f: impl FnOnce(&Dir<'_, S, D, T>) -> Result<R, MediumError>,
) -> Result<R, MediumError>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    let Some(dir) = dir else {
        return f(root);
    };
    if create {
        match root.make_dir_in_dir(dir) {
            Ok(()) | Err(embedded_sdmmc::Error::DirAlreadyExists) => {}
            Err(e) => return Err(e.into()),
        }
    }
    let sub = root.open_dir(dir)?;
    let result = f(&sub);
    sub.close()?;
    result
}

impl<S, D, T> Medium for SdCardMedium<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    fn mount(&mut self) -> Result<(), MediumError> {
        self.mounted = false;
        // The card may have been swapped since the last mount.
        match self.reset_card(|card| card.num_bytes()) {
            Some(Ok(bytes)) => debug!("SD card detected, {} bytes", bytes),
            Some(Err(e)) => {
                warn!("SD card not detected: {:?}", e);
                return Err(MediumError::NoCard);
            }
            None => return Err(MediumError::NoCard),
        }

        let volume_mgr = self.volume_mgr.as_ref().ok_or(MediumError::NoCard)?;
        let volume = volume_mgr.open_volume(VolumeIdx(0))?;
        volume.close()?;
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) {
        self.mounted = false;
        self.reset_card(|_| ());
    }

    fn exists(&mut self, name: &str) -> Result<bool, MediumError> {
        let path = FatPath::of(name);
        let found = self.in_dir(&path, false, |dir| {
            match dir.find_directory_entry(path.file.as_str()) {
                Ok(_) => Ok(true),
                Err(embedded_sdmmc::Error::NotFound) => Ok(false),
                Err(e) => Err(e.into()),
            }
        });
        match found {
            // The dated directory itself is missing.
            Err(MediumError::NotFound) => Ok(false),
            other => other,
        }
    }

    fn size(&mut self, name: &str) -> Result<u64, MediumError> {
        let path = FatPath::of(name);
        self.in_dir(&path, false, |dir| {
            Ok(dir.find_directory_entry(path.file.as_str())?.size as u64)
        })
    }

    fn create(&mut self, name: &str, contents: &[u8]) -> Result<usize, MediumError> {
        let path = FatPath::of(name);
        self.in_dir(&path, true, |dir| {
            let file = dir.open_file_in_dir(path.file.as_str(), Mode::ReadWriteCreateOrTruncate)?;
            file.write(contents)?;
            file.flush()?;
            file.close()?;
            Ok(contents.len())
        })
    }

    fn append(&mut self, name: &str, data: &[u8]) -> Result<usize, MediumError> {
        let path = FatPath::of(name);
        self.in_dir(&path, false, |dir| {
            let file = dir.open_file_in_dir(path.file.as_str(), Mode::ReadWriteAppend)?;
            file.write(data)?;
            file.flush()?;
            file.close()?;
            Ok(data.len())
        })
    }

    fn scan<F: FnMut(&[u8])>(&mut self, name: &str, mut visit: F) -> Result<u64, MediumError> {
        let path = FatPath::of(name);
        self.in_dir(&path, false, |dir| {
            let file = dir.open_file_in_dir(path.file.as_str(), Mode::ReadOnly)?;
            let mut buffer = [0u8; COPY_CHUNK];
            let mut total = 0u64;
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                visit(&buffer[..read]);
                total += read as u64;
            }
            file.close()?;
            Ok(total)
        })
    }

    /// FAT has no cross-directory rename here, so the file is copied and the source deleted.
    fn rename(&mut self, from: &str, to: &str) -> Result<(), MediumError> {
        let source = FatPath::of(from);
        let target = FatPath::of(to);
        if source.dir.is_some() {
            return Err(MediumError::Unsupported);
        }

        let copied = self.with_root(|root| {
            let input = root.open_file_in_dir(source.file.as_str(), Mode::ReadOnly)?;
            let copied = in_subdir(root, target.dir, true, |target_dir| {
                let output = target_dir
                    .open_file_in_dir(target.file.as_str(), Mode::ReadWriteCreateOrTruncate)?;
                let mut buffer = [0u8; COPY_CHUNK];
                let mut total = 0usize;
                loop {
                    let read = input.read(&mut buffer)?;
                    if read == 0 {
                        break;
                    }
                    output.write(&buffer[..read])?;
                    total += read;
                }
                output.flush()?;
                output.close()?;
                Ok(total)
            });
            input.close()?;
            copied
        })?;
        debug!("Copied {} bytes from {} to {}", copied, from, to);
        self.remove(from)
    }

    fn remove(&mut self, name: &str) -> Result<(), MediumError> {
        let path = FatPath::of(name);
        self.in_dir(&path, false, |dir| {
            dir.delete_file_in_dir(path.file.as_str())?;
            Ok(())
        })
    }
}
