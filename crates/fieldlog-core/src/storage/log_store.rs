use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use chrono::NaiveDateTime;
use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;
use log::{debug, error, info, warn};

use super::{Backoff, Medium, MediumError, Phase, RetryPolicy, StorageHealth, StoreError, with_retry};
use crate::config::StorageConfig;
use crate::reading::{HEADER, Reading, RecentRow, archive_name};

/// Rows kept for the status display.
pub const RECENT_ROWS: usize = 3;

/// Longest line kept while scanning for recent rows; longer lines are skipped.
const MAX_LINE: usize = 256;

/// Append-only CSV log on an unreliable medium.
///
/// The tracked row count only advances after a row was physically written, and is
/// resynchronized against a counting pass after every append. Every failure other than
/// a verify mismatch marks the store unavailable, which switches the scheduler to
/// monitoring-only mode until a later [`LogStore::ensure_ready`] succeeds.
pub struct LogStore<'a, M, D> {
    medium: M,
    delay: D,
    config: StorageConfig<'a>,
    health: StorageHealth,
    rows: u32,
    mounted: bool,
    /// Whether the log may end in a torn row without its line terminator.
    tail_unknown: bool,
    /// Last rows for the display, `None` until loaded from the medium.
    recent: Option<VecDeque<RecentRow>>,
}

impl<'a, M: Medium, D: DelayNs> LogStore<'a, M, D> {
    pub fn new(medium: M, delay: D, config: StorageConfig<'a>) -> Self {
        Self {
            medium,
            delay,
            config,
            health: StorageHealth::default(),
            rows: 0,
            mounted: false,
            tail_unknown: true,
            recent: None,
        }
    }

    pub fn health(&self) -> &StorageHealth {
        &self.health
    }

    pub fn is_available(&self) -> bool {
        self.health.available
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Internally tracked data rows (header excluded).
    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn file_name(&self) -> &'a str {
        self.config.file_name
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    pub fn medium_mut(&mut self) -> &mut M {
        &mut self.medium
    }

    /// Make sure the medium is mounted and the log file is valid.
    ///
    /// Returns at once when the store is already usable, or when it is unavailable and the
    /// recovery cool-down since the last attempt has not elapsed. Otherwise runs a bounded
    /// number of initialization attempts, more during boot than afterwards.
    pub async fn ensure_ready(&mut self, now: Instant, phase: Phase) -> Result<(), StoreError> {
        if self.health.available && self.mounted {
            return Ok(());
        }
        if !self.health.available {
            if let Some(last) = self.health.last_recovery_attempt {
                if now.saturating_duration_since(last) < self.config.recovery_cooldown() {
                    debug!("Storage recovery cooling down");
                    return Err(StoreError::MediumAbsent);
                }
            }
        }

        self.health.last_recovery_attempt = Some(now);
        let attempts = match phase {
            Phase::Boot => self.config.boot_attempts,
            Phase::Running => self.config.running_attempts,
        };
        let policy = RetryPolicy::new(attempts, self.config.settle());

        match with_retry(self, policy, async |store: &mut Self, _| store.try_init().await).await {
            Ok(rows) => {
                self.rows = rows;
                self.health.available = true;
                self.health.consecutive_failures = 0;
                info!("Storage ready, {} holds {} rows", self.config.file_name, rows);
                Ok(())
            }
            Err(e) => {
                self.medium.unmount();
                self.mounted = false;
                self.mark_unavailable("initialize", &e);
                Err(e)
            }
        }
    }

    /// Append one reading. Returns the tracked row count after the append.
    pub async fn append(&mut self, reading: &Reading) -> Result<u32, StoreError> {
        if !self.health.available || !self.mounted {
            return Err(StoreError::MediumAbsent);
        }

        let row = reading.to_row();
        let policy = RetryPolicy::new(self.config.append_attempts, self.config.settle());
        let result = with_retry(self, policy, async |store: &mut Self, _| {
            store.try_append(row.as_bytes())
        })
        .await;

        match result {
            Ok(()) => {
                self.rows += 1;
                if let Some(recent) = self.recent.as_mut() {
                    recent.push_back(reading.to_recent());
                    while recent.len() > RECENT_ROWS {
                        recent.pop_front();
                    }
                }
                debug!("Appended row {}", self.rows);
                Ok(self.rows)
            }
            Err(e) => {
                self.mark_unavailable("append", &e);
                Err(e)
            }
        }
    }

    /// Count the rows on the medium and resynchronize the tracked count to it.
    ///
    /// Fewer rows than tracked is reported as [`StoreError::VerifyMismatch`]; the store
    /// stays available and later appends continue from the observed count.
    pub async fn verify(&mut self) -> Result<u32, StoreError> {
        if !self.health.available || !self.mounted {
            return Err(StoreError::MediumAbsent);
        }
        let observed = match self.count_lines() {
            Ok(rows) => rows,
            Err(e) => {
                self.mark_unavailable("verify", &e);
                return Err(e);
            }
        };

        let tracked = self.rows;
        self.rows = observed;
        if observed < tracked {
            warn!("Verify found {} rows, {} tracked; resynchronizing", observed, tracked);
            self.recent = None;
            Err(StoreError::VerifyMismatch { observed, tracked })
        } else {
            if observed > tracked {
                info!("Verify found {} rows, {} tracked; catching up", observed, tracked);
                self.recent = None;
            }
            Ok(observed)
        }
    }

    /// Archive the active log under a name derived from `local` and start a fresh one.
    ///
    /// Returns the archive name, or `None` when archiving failed and the old log was
    /// discarded instead. The fresh log always starts with just the header.
    pub async fn rotate(
        &mut self,
        local: &NaiveDateTime,
        now: Instant,
    ) -> Result<Option<String>, StoreError> {
        self.ensure_ready(now, Phase::Running).await?;

        let archive = archive_name(local);
        let mut archived = false;
        let policy = RetryPolicy::new(self.config.running_attempts, self.config.settle());
        let result = with_retry(self, policy, async |store: &mut Self, _| {
            if store.move_to_archive(&archive)? {
                archived = true;
            }
            store.create_fresh()
        })
        .await;

        match result {
            Ok(()) if archived => {
                info!("Rotated log to {}", archive);
                Ok(Some(archive))
            }
            Ok(()) => {
                warn!("Log could not be archived, started a fresh one");
                Ok(None)
            }
            Err(e) => {
                self.mark_unavailable("rotate", &e);
                Err(e)
            }
        }
    }

    /// Ground-truth row count from a full scan, 0 when storage is unavailable.
    pub fn count_rows(&mut self) -> u32 {
        if !self.health.available || !self.mounted {
            return 0;
        }
        match self.count_lines() {
            Ok(rows) => rows,
            Err(e) => {
                self.mark_unavailable("count rows", &e);
                0
            }
        }
    }

    /// Up to the last `k` well-formed rows, oldest first, from a single forward scan.
    pub fn read_last_rows(&mut self, k: usize) -> Vec<RecentRow> {
        if k == 0 || !self.health.available || !self.mounted {
            return Vec::new();
        }

        let mut window: VecDeque<RecentRow> = VecDeque::with_capacity(k);
        let mut line: Vec<u8> = Vec::with_capacity(MAX_LINE);
        let mut oversized = false;
        let scanned = self.medium.scan(self.config.file_name, |chunk| {
            for &byte in chunk {
                if byte != b'\n' {
                    if line.len() < MAX_LINE {
                        line.push(byte);
                    } else {
                        oversized = true;
                    }
                    continue;
                }
                let row = core::str::from_utf8(&line).ok().and_then(RecentRow::parse_line);
                if let (Some(row), false) = (row, oversized) {
                    if window.len() == k {
                        window.pop_front();
                    }
                    window.push_back(row);
                }
                line.clear();
                oversized = false;
            }
        });

        if let Err(e) = scanned {
            warn!("Reading recent rows failed: {}", e);
            return Vec::new();
        }
        window.into()
    }

    /// The last rows for the display, loaded from the medium on first use.
    pub fn snapshot_rows(&mut self) -> heapless::Vec<RecentRow, RECENT_ROWS> {
        if self.recent.is_none() && self.health.available && self.mounted {
            self.recent = Some(self.read_last_rows(RECENT_ROWS).into());
        }
        self.recent
            .iter()
            .flatten()
            .take(RECENT_ROWS)
            .cloned()
            .collect()
    }

    /// Unmount the medium to save power. The next [`Self::ensure_ready`] remounts it.
    pub fn release(&mut self) {
        if self.mounted {
            self.medium.unmount();
            self.mounted = false;
            info!("Storage released");
        }
    }

    async fn try_init(&mut self) -> Result<u32, StoreError> {
        self.medium.unmount();
        self.mounted = false;
        self.delay.delay_ms(self.config.settle_ms).await;

        self.medium.mount()?;
        self.mounted = true;

        let name = self.config.file_name;
        let valid = self.medium.exists(name)?
            && match self.medium.size(name) {
                Ok(0) => {
                    warn!("{} is empty, recreating", name);
                    false
                }
                Ok(_) => true,
                Err(e @ (MediumError::NoCard | MediumError::NotMounted)) => return Err(e.into()),
                Err(e) => {
                    warn!("{} cannot be opened ({}), recreating", name, e);
                    false
                }
            };

        if valid {
            match self.ensure_terminated().and_then(|_| self.count_lines()) {
                Ok(rows) => {
                    self.recent = None;
                    return Ok(rows);
                }
                Err(StoreError::MediumUnreadable) => warn!("{} unreadable, recreating", name),
                Err(e) => return Err(e),
            }
        }
        self.recreate()?;
        Ok(0)
    }

    fn try_append(&mut self, row: &[u8]) -> Result<(), StoreError> {
        let name = self.config.file_name;
        if !self.medium.exists(name)? {
            warn!("{} disappeared, starting a fresh log", name);
            self.create_fresh()?;
        } else if self.tail_unknown {
            self.ensure_terminated()?;
        }
        let written = match self.medium.append(name, row) {
            Ok(written) => written,
            Err(e) => {
                self.tail_unknown = true;
                return Err(e.into());
            }
        };
        if written != row.len() {
            if written > 0 {
                self.tail_unknown = true;
            }
            return Err(StoreError::WriteIncomplete {
                written,
                expected: row.len(),
            });
        }
        Ok(())
    }

    /// Move the active log to `archive`. Returns whether anything was archived.
    fn move_to_archive(&mut self, archive: &str) -> Result<bool, StoreError> {
        let name = self.config.file_name;
        if !self.medium.exists(name)? {
            return Ok(false);
        }
        if self.medium.exists(archive)? {
            self.medium.remove(archive)?;
        }
        match self.medium.rename(name, archive) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Archiving {} failed ({}), discarding it", name, e);
                remove_if_present(&mut self.medium, name)?;
                Ok(false)
            }
        }
    }

    fn recreate(&mut self) -> Result<(), StoreError> {
        remove_if_present(&mut self.medium, self.config.file_name)?;
        self.create_fresh()
    }

    /// Write a header-only log and check it reads back with a non-zero size.
    fn create_fresh(&mut self) -> Result<(), StoreError> {
        let name = self.config.file_name;
        let expected = HEADER.len();
        let written = self.medium.create(name, HEADER.as_bytes())?;
        if written != expected || self.medium.size(name)? == 0 {
            return Err(StoreError::WriteIncomplete { written, expected });
        }
        self.rows = 0;
        self.tail_unknown = false;
        self.recent = Some(VecDeque::new());
        Ok(())
    }

    /// Close a torn last row with a line terminator so the next row starts on its own
    /// line. Returns whether a repair was written; the repaired fragment counts as a row.
    fn ensure_terminated(&mut self) -> Result<bool, StoreError> {
        let name = self.config.file_name;
        let mut last = None;
        self.medium.scan(name, |chunk| {
            if let Some(&byte) = chunk.last() {
                last = Some(byte);
            }
        })?;
        if matches!(last, None | Some(b'\n')) {
            self.tail_unknown = false;
            return Ok(false);
        }

        let written = self.medium.append(name, b"\n")?;
        if written != 1 {
            return Err(StoreError::WriteIncomplete {
                written,
                expected: 1,
            });
        }
        warn!("{} ended in a torn row, terminated it", name);
        self.rows += 1;
        self.tail_unknown = false;
        self.recent = None;
        Ok(true)
    }

    fn count_lines(&mut self) -> Result<u32, StoreError> {
        let mut newlines: u32 = 0;
        self.medium.scan(self.config.file_name, |chunk| {
            newlines += chunk.iter().filter(|&&b| b == b'\n').count() as u32;
        })?;
        Ok(newlines.saturating_sub(1))
    }

    fn mark_unavailable(&mut self, operation: &str, e: &StoreError) {
        if !e.degrades_health() {
            warn!("Storage {} reported: {}", operation, e);
            return;
        }
        if self.health.available {
            error!("Storage failed to {}: {}; switching to monitoring only", operation, e);
        } else {
            warn!("Storage failed to {}: {}", operation, e);
        }
        self.health.available = false;
        self.health.consecutive_failures = self.health.consecutive_failures.saturating_add(1);
    }
}

fn remove_if_present<M: Medium>(medium: &mut M, name: &str) -> Result<(), StoreError> {
    match medium.remove(name) {
        Ok(()) | Err(MediumError::NotFound) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl<M, D: DelayNs> Backoff for LogStore<'_, M, D> {
    async fn backoff(&mut self, delay: Duration) {
        self.delay.delay_ms(delay.as_millis() as u32).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::ClimateReadings;
    use crate::storage::MemoryMedium;
    use crate::testing::{FakeDelay, Rig, reading_at};
    use chrono::NaiveDate;
    use embassy_futures::block_on;

    type Store = LogStore<'static, MemoryMedium, FakeDelay>;

    fn fresh_store(rig: &Rig) -> Store {
        LogStore::new(
            MemoryMedium::new(),
            rig.delay(),
            StorageConfig::default(),
        )
    }

    fn ready_store(rig: &Rig) -> Store {
        let mut store = fresh_store(rig);
        block_on(store.ensure_ready(rig.now(), Phase::Boot)).unwrap();
        store
    }

    fn reading(minute: u32) -> Reading {
        reading_at(
            2025,
            5,
            1,
            minute,
            Some(ClimateReadings {
                temperature_c: 20.0 + minute as f32,
                humidity_pct: 50.0,
            }),
            Some(7.5),
        )
    }

    fn contents(store: &Store) -> String {
        String::from_utf8(store.medium().file("data.csv").unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_init_creates_header_only_log() {
        let rig = Rig::new();
        let mut store = ready_store(&rig);
        assert!(store.is_available());
        assert_eq!(store.rows(), 0);
        assert_eq!(contents(&store), HEADER);
        assert_eq!(store.count_rows(), 0);
    }

    #[test]
    fn test_init_keeps_existing_rows() {
        let rig = Rig::new();
        let mut store = fresh_store(&rig);
        let mut existing = String::from(HEADER);
        existing.push_str(&reading(1).to_row());
        existing.push_str(&reading(2).to_row());
        store.medium_mut().set_file("data.csv", existing.as_bytes());

        block_on(store.ensure_ready(rig.now(), Phase::Boot)).unwrap();
        assert_eq!(store.rows(), 2);
        assert_eq!(contents(&store), existing);
    }

    #[test]
    fn test_init_replaces_empty_and_unreadable_files() {
        let rig = Rig::new();
        let mut store = fresh_store(&rig);
        store.medium_mut().set_file("data.csv", b"");
        block_on(store.ensure_ready(rig.now(), Phase::Boot)).unwrap();
        assert_eq!(contents(&store), HEADER);

        let mut store = fresh_store(&rig);
        store.medium_mut().set_file("data.csv", b"garbage\ngarbage\n");
        store.medium_mut().faults_mut().unreadable.insert("data.csv".into());
        block_on(store.ensure_ready(rig.now(), Phase::Boot)).unwrap();
        assert_eq!(contents(&store), HEADER);
        assert_eq!(store.rows(), 0);
    }

    #[test]
    fn test_missing_card_exhausts_attempts_then_cools_down() {
        let rig = Rig::new();
        let mut store = fresh_store(&rig);
        store.medium_mut().eject();

        assert_eq!(
            block_on(store.ensure_ready(rig.now(), Phase::Boot)),
            Err(StoreError::MediumAbsent)
        );
        assert!(!store.is_available());
        assert_eq!(store.health().consecutive_failures, 1);

        // Card back, but still inside the cool-down: no hardware access.
        store.medium_mut().insert();
        rig.advance_ms(10_000);
        assert!(block_on(store.ensure_ready(rig.now(), Phase::Running)).is_err());
        assert_eq!(store.medium().mounts(), 0);

        rig.advance_ms(60_000);
        block_on(store.ensure_ready(rig.now(), Phase::Running)).unwrap();
        assert!(store.is_available());
        assert_eq!(store.health().consecutive_failures, 0);
    }

    #[test]
    fn test_boot_gets_more_attempts() {
        let rig = Rig::new();
        let mut store = fresh_store(&rig);
        store.medium_mut().faults_mut().failing_mounts = 4;
        block_on(store.ensure_ready(rig.now(), Phase::Boot)).unwrap();

        let mut store = fresh_store(&rig);
        store.medium_mut().faults_mut().failing_mounts = 4;
        assert!(block_on(store.ensure_ready(rig.now(), Phase::Running)).is_err());
    }

    #[test]
    fn test_append_counts_only_written_rows() {
        let rig = Rig::new();
        let mut store = ready_store(&rig);

        let before = store.count_rows();
        assert_eq!(block_on(store.append(&reading(1))), Ok(1));
        assert_eq!(store.count_rows(), before + 1);
        assert_eq!(block_on(store.append(&reading(2))), Ok(2));
        assert_eq!(block_on(store.verify()), Ok(2));
        assert!(contents(&store).ends_with(&reading(2).to_row()));
    }

    #[test]
    fn test_append_recreates_vanished_file() {
        let rig = Rig::new();
        let mut store = ready_store(&rig);
        for minute in 0..4 {
            block_on(store.append(&reading(minute))).unwrap();
        }
        assert_eq!(store.rows(), 4);

        assert!(store.medium_mut().delete_file("data.csv"));
        assert_eq!(block_on(store.append(&reading(5))), Ok(1));
        assert_eq!(block_on(store.verify()), Ok(1));

        let mut expected = String::from(HEADER);
        expected.push_str(&reading(5).to_row());
        assert_eq!(contents(&store), expected);
    }

    #[test]
    fn test_zero_byte_write_is_retried() {
        let rig = Rig::new();
        let mut store = ready_store(&rig);
        store.medium_mut().faults_mut().zero_writes = 1;

        assert_eq!(block_on(store.append(&reading(1))), Ok(1));
        assert!(store.is_available());
        assert_eq!(store.count_rows(), 1);
    }

    #[test]
    fn test_failed_append_degrades_health() {
        let rig = Rig::new();
        let mut store = ready_store(&rig);
        store.medium_mut().faults_mut().short_writes = 1;

        assert!(matches!(
            block_on(store.append(&reading(1))),
            Err(StoreError::WriteIncomplete { .. })
        ));
        assert!(!store.is_available());
        assert_eq!(store.rows(), 0);
        assert_eq!(store.count_rows(), 0);
        assert_eq!(block_on(store.append(&reading(2))), Err(StoreError::MediumAbsent));

        let mut store = ready_store(&rig);
        store.medium_mut().eject();
        assert_eq!(block_on(store.append(&reading(1))), Err(StoreError::MediumAbsent));
        assert!(!store.is_available());
    }

    #[test]
    fn test_torn_row_is_terminated_before_next_append() {
        let rig = Rig::new();
        let mut store = ready_store(&rig);
        block_on(store.append(&reading(1))).unwrap();
        store.medium_mut().faults_mut().short_writes = 1;
        assert!(matches!(
            block_on(store.append(&reading(2))),
            Err(StoreError::WriteIncomplete { written, .. }) if written > 0
        ));
        assert!(!store.is_available());
        assert!(!contents(&store).ends_with('\n'));

        rig.advance_ms(61_000);
        block_on(store.ensure_ready(rig.now(), Phase::Running)).unwrap();
        assert!(contents(&store).ends_with('\n'));
        assert_eq!(store.rows(), 2);

        assert_eq!(block_on(store.append(&reading(3))), Ok(3));
        assert_eq!(block_on(store.verify()), Ok(3));

        let text = contents(&store);
        assert!(text.ends_with('\n'));
        assert_eq!(text.lines().count(), 4);
        assert_eq!(text.lines().last(), Some(reading(3).to_row().trim_end()));
        let rows = store.read_last_rows(3);
        assert_eq!(rows.last().map(|r| r.temperature_c), Some(23.0));
    }

    #[test]
    fn test_clean_tail_is_left_untouched_on_recovery() {
        let rig = Rig::new();
        let mut store = ready_store(&rig);
        block_on(store.append(&reading(1))).unwrap();
        block_on(store.append(&reading(2))).unwrap();
        store.medium_mut().faults_mut().short_writes = 1;
        assert!(block_on(store.append(&reading(3))).is_err());

        // Swapped card whose log already ends cleanly.
        let mut clean = String::from(HEADER);
        clean.push_str(&reading(4).to_row());
        store.medium_mut().set_file("data.csv", clean.as_bytes());
        rig.advance_ms(61_000);
        block_on(store.ensure_ready(rig.now(), Phase::Running)).unwrap();
        assert_eq!(store.rows(), 1);
        assert_eq!(block_on(store.append(&reading(5))), Ok(2));
        assert_eq!(contents(&store).lines().count(), 3);
    }

    #[test]
    fn test_verify_resyncs_down_and_reports_mismatch() {
        let rig = Rig::new();
        let mut store = ready_store(&rig);
        for minute in 0..5 {
            block_on(store.append(&reading(minute))).unwrap();
        }
        // The sixth write is acknowledged but never reaches the card.
        store.medium_mut().faults_mut().silent_drops = 1;
        assert_eq!(block_on(store.append(&reading(5))), Ok(6));

        assert_eq!(
            block_on(store.verify()),
            Err(StoreError::VerifyMismatch {
                observed: 5,
                tracked: 6
            })
        );
        assert_eq!(store.rows(), 5);
        assert!(store.is_available());

        assert_eq!(block_on(store.append(&reading(6))), Ok(6));
        assert_eq!(block_on(store.verify()), Ok(6));
    }

    #[test]
    fn test_verify_resyncs_up() {
        let rig = Rig::new();
        let mut store = ready_store(&rig);
        block_on(store.append(&reading(0))).unwrap();

        let mut grown = contents(&store);
        grown.push_str(&reading(1).to_row());
        store.medium_mut().set_file("data.csv", grown.as_bytes());
        assert_eq!(block_on(store.verify()), Ok(2));
        assert_eq!(store.rows(), 2);
    }

    fn local() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 5, 1)
            .unwrap()
            .and_hms_opt(14, 30, 5)
            .unwrap()
    }

    #[test]
    fn test_rotate_archives_and_starts_fresh() {
        let rig = Rig::new();
        let mut store = ready_store(&rig);
        block_on(store.append(&reading(0))).unwrap();
        block_on(store.append(&reading(1))).unwrap();
        let old = contents(&store);
        store.medium_mut().set_file("data_20250501_143005.csv", b"stale");

        let archived = block_on(store.rotate(&local(), rig.now())).unwrap();
        assert_eq!(archived.as_deref(), Some("data_20250501_143005.csv"));
        assert_eq!(
            store.medium().file("data_20250501_143005.csv"),
            Some(old.as_bytes())
        );
        assert_eq!(contents(&store), HEADER);
        assert_eq!(store.rows(), 0);
        assert!(store.snapshot_rows().is_empty());
    }

    #[test]
    fn test_rotate_discards_when_rename_fails() {
        let rig = Rig::new();
        let mut store = ready_store(&rig);
        block_on(store.append(&reading(0))).unwrap();
        store.medium_mut().faults_mut().rename_unsupported = true;

        assert_eq!(block_on(store.rotate(&local(), rig.now())), Ok(None));
        assert_eq!(contents(&store), HEADER);
        assert_eq!(store.rows(), 0);
        assert_eq!(store.count_rows(), 0);
        assert_eq!(store.medium().file_names().count(), 1);
    }

    #[test]
    fn test_rotate_remounts_released_storage() {
        let rig = Rig::new();
        let mut store = ready_store(&rig);
        store.release();
        assert!(!store.is_mounted());

        block_on(store.rotate(&local(), rig.now())).unwrap();
        assert!(store.is_mounted());
        assert_eq!(store.medium().mounts(), 2);
    }

    #[test]
    fn test_last_rows_in_order_skipping_malformed() {
        let rig = Rig::new();
        let mut store = ready_store(&rig);
        for minute in 0..5 {
            block_on(store.append(&reading(minute))).unwrap();
        }
        let mut text = contents(&store);
        text.push_str("not,a,row\n");
        text.push_str(&"x".repeat(400));
        text.push('\n');
        store.medium_mut().set_file("data.csv", text.as_bytes());

        let rows = store.read_last_rows(3);
        let temps: Vec<f32> = rows.iter().map(|r| r.temperature_c).collect();
        assert_eq!(temps, [22.0, 23.0, 24.0]);
        assert_eq!(rows[0].local, "2025-05-01 00:02:00");
    }

    #[test]
    fn test_snapshot_follows_appends() {
        let rig = Rig::new();
        let mut store = ready_store(&rig);
        assert!(store.snapshot_rows().is_empty());
        for minute in 0..4 {
            block_on(store.append(&reading(minute))).unwrap();
        }
        let temps: Vec<f32> = store.snapshot_rows().iter().map(|r| r.temperature_c).collect();
        assert_eq!(temps, [21.0, 22.0, 23.0]);
    }

    #[test]
    fn test_unavailable_store_reads_nothing() {
        let rig = Rig::new();
        let mut store = fresh_store(&rig);
        assert_eq!(store.count_rows(), 0);
        assert!(store.read_last_rows(3).is_empty());
        assert_eq!(block_on(store.verify()), Err(StoreError::MediumAbsent));
    }
}
