//! Checkpoint images
//!
//! An image is a complete serialization of the metadata state as of one
//! sequence id. Recovery loads the newest valid image and replays the
//! journal after it, which bounds both recovery time and journal size:
//! once an image is durable, journal entries below it (minus a retained
//! tail for lagging followers) are discarded.
//!
//! Images are written to a temporary file, fsynced and renamed into place
//! as `image.<up_to_sequence>`, so a crash mid-write never leaves a
//! partial image under the final name.

mod image;

pub use image::{IMAGE_FORMAT_VERSION, ImageHeader, decode_image, encode_image};

use crate::journal::JournalStore;
use crate::metric_definitions::{
    CHECKPOINT_CREATED, CHECKPOINT_FAILURES, CHECKPOINT_LAST_SEQUENCE, CHECKPOINT_SIZE_BYTES,
};
use crate::state::{MetadataState, MetadataStore};
use crate::task::cancelled;
use meridian_common::config::CheckpointConfig;
use meridian_common::{Error, Result, SequenceId, now_millis};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const IMAGE_PREFIX: &str = "image.";
const TEMP_SUFFIX: &str = ".tmp";

/// Result of a checkpoint
#[derive(Clone, Debug, Serialize)]
pub struct CheckpointInfo {
    pub up_to_sequence: SequenceId,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub entity_count: u64,
    pub created_at: u64,
}

/// Writes, prunes and loads checkpoint images
pub struct CheckpointManager {
    dir: PathBuf,
    config: CheckpointConfig,
    store: Arc<MetadataStore>,
    journal: Arc<dyn JournalStore>,
    /// One checkpoint at a time
    lock: Mutex<()>,
    last_image: AtomicU64,
}

impl CheckpointManager {
    /// Create a manager for images under `dir`
    pub fn new(
        dir: impl AsRef<Path>,
        config: CheckpointConfig,
        store: Arc<MetadataStore>,
        journal: Arc<dyn JournalStore>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        remove_temp_files(&dir);

        let last_image = list_images(&dir)?.first().map_or(0, |(seq, _)| *seq);
        Ok(Self {
            dir,
            config,
            store,
            journal,
            lock: Mutex::new(()),
            last_image: AtomicU64::new(last_image),
        })
    }

    /// Sequence id covered by the newest image on disk
    pub fn last_image_sequence(&self) -> SequenceId {
        self.last_image.load(Ordering::SeqCst)
    }

    /// Whether enough entries were applied since the last image
    pub fn is_due(&self) -> bool {
        let applied = self.store.last_applied();
        let last = self.last_image_sequence();
        applied > last && applied - last >= self.config.min_entries.max(1)
    }

    /// Write an image of the current state, prune old images and truncate
    /// the journal below it.
    ///
    /// Failures leave the previous images and the journal untouched.
    pub fn create_checkpoint(&self) -> Result<CheckpointInfo> {
        let _guard = self.lock.lock();

        // Clone under the read lock, serialize outside it
        let state = self.store.snapshot();
        let created_at = now_millis();
        let up_to = state.last_applied();
        let entity_count = state.stats().total() as u64;

        let result = encode_image(&state, created_at).and_then(|bytes| {
            self.write_image(up_to, &bytes)
                .map(|path| (path, bytes.len() as u64))
        });
        drop(state);
        let (path, size_bytes) = match result {
            Ok(written) => written,
            Err(e) => {
                counter!(CHECKPOINT_FAILURES).increment(1);
                return Err(e);
            }
        };

        self.last_image.store(up_to, Ordering::SeqCst);
        self.prune();

        let keep_from = up_to.saturating_sub(self.config.journal_retain_entries);
        if keep_from > 1
            && let Err(e) = self.journal.truncate_before(keep_from)
        {
            warn!("Journal truncation below {} failed: {}", keep_from, e);
        }

        counter!(CHECKPOINT_CREATED).increment(1);
        #[allow(clippy::cast_precision_loss)]
        {
            gauge!(CHECKPOINT_LAST_SEQUENCE).set(up_to as f64);
            gauge!(CHECKPOINT_SIZE_BYTES).set(size_bytes as f64);
        }
        info!(
            "Checkpoint at sequence {} written: {} entities, {} bytes",
            up_to, entity_count, size_bytes
        );

        Ok(CheckpointInfo {
            up_to_sequence: up_to,
            path,
            size_bytes,
            entity_count,
            created_at,
        })
    }

    /// Load the newest image that verifies. Corrupt images and images from
    /// a newer format are skipped in favour of older ones.
    pub fn load_latest(&self) -> Result<Option<(ImageHeader, MetadataState)>> {
        for (sequence, path) in list_images(&self.dir)? {
            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    warn!("Cannot read image {}: {}", path.display(), e);
                    continue;
                }
            };
            match decode_image(&bytes) {
                Ok(loaded) => {
                    info!(
                        "Loaded checkpoint image at sequence {} ({} entities)",
                        sequence, loaded.0.entity_count
                    );
                    return Ok(Some(loaded));
                }
                Err(e) => {
                    warn!(
                        "Skipping unusable image {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }
        Ok(None)
    }

    /// Raw bytes of the newest valid image, as served to followers
    pub fn latest_image(&self) -> Result<Option<Vec<u8>>> {
        for (_, path) in list_images(&self.dir)? {
            let Ok(bytes) = fs::read(&path) else {
                continue;
            };
            if decode_image(&bytes).is_ok() {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    /// Verify an image received from the leader and keep it as the newest
    /// local image. Returns the decoded state for the caller to install.
    pub fn install(&self, bytes: &[u8]) -> Result<(ImageHeader, MetadataState)> {
        let _guard = self.lock.lock();
        let (header, state) = decode_image(bytes)?;
        self.write_image(header.up_to_sequence, bytes)?;
        self.last_image
            .fetch_max(header.up_to_sequence, Ordering::SeqCst);
        self.prune();
        Ok((header, state))
    }

    /// Images on disk, newest first
    pub fn list(&self) -> Result<Vec<(SequenceId, PathBuf)>> {
        list_images(&self.dir)
    }

    fn write_image(&self, up_to: SequenceId, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.dir.join(format!("{IMAGE_PREFIX}{up_to:020}"));
        let tmp = self.dir.join(format!("{IMAGE_PREFIX}{up_to:020}{TEMP_SUFFIX}"));

        let written = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)?;
            if let Ok(dir) = File::open(&self.dir) {
                let _ = dir.sync_all();
            }
            Ok(())
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            if e.kind() == io::ErrorKind::StorageFull {
                error!(
                    "Checkpoint at {} failed: storage full in {}",
                    up_to,
                    self.dir.display()
                );
            }
            return Err(Error::checkpoint(format!(
                "writing image at sequence {up_to} failed: {e}"
            )));
        }
        Ok(path)
    }

    fn prune(&self) {
        let images = match list_images(&self.dir) {
            Ok(images) => images,
            Err(e) => {
                warn!("Cannot list images for pruning: {}", e);
                return;
            }
        };
        for (sequence, path) in images.into_iter().skip(self.config.retain_images.max(1)) {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed old image at sequence {}", sequence),
                Err(e) => warn!("Cannot remove old image {}: {}", path.display(), e),
            }
        }
    }
}

/// Image files in `dir`, newest first
fn list_images(dir: &Path) -> Result<Vec<(SequenceId, PathBuf)>> {
    let mut images: Vec<(SequenceId, PathBuf)> = fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let sequence = name
                .to_str()?
                .strip_prefix(IMAGE_PREFIX)?
                .parse::<SequenceId>()
                .ok()?;
            Some((sequence, entry.path()))
        })
        .collect();
    images.sort_by_key(|(sequence, _)| std::cmp::Reverse(*sequence));
    Ok(images)
}

fn remove_temp_files(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(TEMP_SUFFIX) {
            let _ = fs::remove_file(entry.path());
        }
    }
}

/// Take an image whenever one is due, checking every `interval`.
/// Failures are logged and retried on the next tick.
pub(crate) async fn checkpoint_loop(
    manager: Arc<CheckpointManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancelled(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }
        if !manager.is_due() {
            continue;
        }

        let m = Arc::clone(&manager);
        match tokio::task::spawn_blocking(move || m.create_checkpoint()).await {
            Ok(Ok(info)) => debug!("Scheduled checkpoint at {} done", info.up_to_sequence),
            Ok(Err(e)) => warn!("Scheduled checkpoint failed: {}", e),
            Err(e) => warn!("Checkpoint task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{JournalEntry, MemoryJournal};
    use crate::state::Operation;
    use tempfile::tempdir;

    fn setup(
        config: CheckpointConfig,
        entries: u64,
    ) -> (tempfile::TempDir, Arc<MetadataStore>, Arc<MemoryJournal>, CheckpointManager) {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetadataStore::new());
        let journal = Arc::new(MemoryJournal::new());
        for seq in 1..=entries {
            let entry =
                JournalEntry::new(seq, &Operation::create_table(1, format!("t{seq}")), seq).unwrap();
            journal.append(1, std::slice::from_ref(&entry)).unwrap();
            store.apply(&entry).unwrap();
        }
        let manager =
            CheckpointManager::new(dir.path(), config, store.clone(), journal.clone()).unwrap();
        (dir, store, journal, manager)
    }

    #[test]
    fn test_checkpoint_and_load() {
        let (_dir, store, journal, manager) = setup(
            CheckpointConfig {
                journal_retain_entries: 5,
                ..CheckpointConfig::default()
            },
            20,
        );

        let info = manager.create_checkpoint().unwrap();
        assert_eq!(info.up_to_sequence, 20);
        assert_eq!(info.entity_count, 20);
        assert_eq!(manager.last_image_sequence(), 20);
        assert_eq!(journal.first_sequence(), 15);

        let (header, state) = manager.load_latest().unwrap().unwrap();
        assert_eq!(header.up_to_sequence, 20);
        assert_eq!(state, store.snapshot());
    }

    #[test]
    fn test_retention_and_corrupt_fallback() {
        let (dir, store, journal, manager) = setup(
            CheckpointConfig {
                retain_images: 2,
                ..CheckpointConfig::default()
            },
            3,
        );
        manager.create_checkpoint().unwrap();

        for seq in 4..=6 {
            let entry = JournalEntry::new(seq, &Operation::create_database(format!("d{seq}")), seq)
                .unwrap();
            journal.append(1, std::slice::from_ref(&entry)).unwrap();
            store.apply(&entry).unwrap();
            manager.create_checkpoint().unwrap();
        }
        let images = manager.list().unwrap();
        assert_eq!(
            images.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
            vec![6, 5]
        );

        // corrupt the newest; loading falls back to the older one
        let newest = &images[0].1;
        let mut bytes = fs::read(newest).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(newest, bytes).unwrap();

        let (header, _) = manager.load_latest().unwrap().unwrap();
        assert_eq!(header.up_to_sequence, 5);
        assert!(dir.path().join("image.00000000000000000005").exists());
    }

    #[test]
    fn test_newer_format_image_skipped() {
        let (dir, store, journal, manager) = setup(CheckpointConfig::default(), 3);
        manager.create_checkpoint().unwrap();

        // a later image written by a newer build
        let entry = JournalEntry::new(4, &Operation::create_database("d4"), 4).unwrap();
        journal.append(1, std::slice::from_ref(&entry)).unwrap();
        store.apply(&entry).unwrap();
        let mut bytes = encode_image(&store.snapshot(), 4).unwrap();
        bytes[4..6].copy_from_slice(&(IMAGE_FORMAT_VERSION + 1).to_be_bytes());
        let body_end = bytes.len() - 4;
        let crc = meridian_common::checksum::compute_crc32c(&bytes[..body_end]);
        bytes[body_end..].copy_from_slice(&crc.to_be_bytes());
        let newer = dir.path().join("image.00000000000000000004");
        fs::write(&newer, &bytes).unwrap();
        assert!(matches!(
            decode_image(&bytes),
            Err(Error::VersionSkew { .. })
        ));

        let (header, state) = manager.load_latest().unwrap().unwrap();
        assert_eq!(header.up_to_sequence, 3);
        assert_eq!(state.last_applied(), 3);
        // left in place for the newer build
        assert!(newer.exists());
    }

    #[test]
    fn test_install_from_leader() {
        let (_dir, leader_store, _journal, _manager) = setup(CheckpointConfig::default(), 10);
        let bytes = encode_image(&leader_store.snapshot(), 1).unwrap();

        let (_dir2, _store, _journal2, follower) = setup(CheckpointConfig::default(), 0);
        let (header, state) = follower.install(&bytes).unwrap();
        assert_eq!(header.up_to_sequence, 10);
        assert_eq!(state, leader_store.snapshot());
        assert_eq!(follower.last_image_sequence(), 10);
        assert_eq!(follower.latest_image().unwrap().unwrap(), bytes);
    }

    #[test]
    fn test_is_due() {
        let (_dir, _store, _journal, manager) = setup(
            CheckpointConfig {
                min_entries: 10,
                ..CheckpointConfig::default()
            },
            9,
        );
        assert!(!manager.is_due());
        let (_dir, _store, _journal, manager) = setup(
            CheckpointConfig {
                min_entries: 10,
                ..CheckpointConfig::default()
            },
            10,
        );
        assert!(manager.is_due());
        manager.create_checkpoint().unwrap();
        assert!(!manager.is_due());
    }
}
