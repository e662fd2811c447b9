//! Durable per-replica state: the view number, the latest snapshot, and
//! the proposal log kept under full stable storage.
//!
//! Layout of the replica directory:
//!   - `sync.view` — rewritten atomically on every view change
//!   - `snapshot.<nextInstanceId>` — one file per installed snapshot
//!   - `decisions.log` — appended on every accepted proposal (FullSS)

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::paxos::config::{CrashModel, ProcessDescriptor};
use crate::paxos::error::*;
use crate::paxos::ordering::{ReplicaId, SeqNo, View};
use crate::paxos::snapshot::Snapshot;

const VIEW_FILE: &str = "sync.view";
const SNAPSHOT_PREFIX: &str = "snapshot.";
const DECISIONS_FILE: &str = "decisions.log";

/// Writes a single number to a file so that either the old or the new
/// value survives a crash, never garbage: write aside, sync, rename
/// over, sync the directory.
pub struct SingleNumberWriter {
    path: PathBuf,
    dir: PathBuf,
}

impl SingleNumberWriter {
    pub fn new(dir: &Path, file_name: &str) -> Self {
        SingleNumberWriter {
            path: dir.join(file_name),
            dir: dir.to_path_buf(),
        }
    }

    pub fn read(&self) -> Result<Option<i32>> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                let arr: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Codec("corrupt number file"))?;
                Ok(Some(i32::from_le_bytes(arr)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn write(&self, number: i32) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&number.to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

/// The durably persisted part of [`super::Storage`].
pub struct StableStorage {
    local_id: ReplicaId,
    dir: PathBuf,
    crash_model: CrashModel,
    view_writer: SingleNumberWriter,
    view: View,
    last_snapshot: Option<Arc<Snapshot>>,
    decisions: Option<File>,
}

impl StableStorage {
    pub fn open(descriptor: &ProcessDescriptor) -> Result<Self> {
        let dir = descriptor.storage_dir();
        fs::create_dir_all(&dir)?;

        let view_writer = SingleNumberWriter::new(&dir, VIEW_FILE);
        let view = View::from(view_writer.read()?.unwrap_or(0));

        let last_snapshot = Self::load_latest_snapshot(&dir)?;

        let decisions = match descriptor.config.crash_model {
            CrashModel::FullSS => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(DECISIONS_FILE))?,
            ),
            _ => None,
        };

        info!(
            "{:?} // stable storage opened, view {}, snapshot {:?}",
            descriptor.local_id,
            view,
            last_snapshot.as_ref().map(|s| s.next_instance_id)
        );

        Ok(StableStorage {
            local_id: descriptor.local_id,
            dir,
            crash_model: descriptor.config.crash_model,
            view_writer,
            view,
            last_snapshot,
            decisions,
        })
    }

    fn load_latest_snapshot(dir: &Path) -> Result<Option<Arc<Snapshot>>> {
        let mut newest: Option<(i32, PathBuf)> = None;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_prefix(SNAPSHOT_PREFIX) {
                if let Ok(id) = id.parse::<i32>() {
                    if newest.as_ref().map(|(old, _)| id > *old).unwrap_or(true) {
                        newest = Some((id, entry.path()));
                    }
                }
            }
        }
        match newest {
            Some((_, path)) => {
                let bytes = fs::read(path)?;
                let snapshot: Snapshot = bincode::deserialize(&bytes)?;
                Ok(Some(Arc::new(snapshot)))
            }
            None => Ok(None),
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    /// Durable write first; the in-memory view changes only after the
    /// bytes hit the disk.
    pub fn set_view(&mut self, view: View) -> Result<()> {
        self.view_writer.write(view.into())?;
        self.view = view;
        debug!("{:?} // view {} persisted", self.local_id, view);
        Ok(())
    }

    pub fn last_snapshot(&self) -> Option<&Arc<Snapshot>> {
        self.last_snapshot.as_ref()
    }

    pub fn set_last_snapshot(&mut self, snapshot: Snapshot) -> Result<Arc<Snapshot>> {
        let id: i32 = snapshot.next_instance_id.into();
        let path = self.dir.join(format!("{}{}", SNAPSHOT_PREFIX, id));
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bincode::serialize(&snapshot)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        File::open(&self.dir)?.sync_all()?;

        // older snapshot files are useless once a newer one is durable
        if let Some(previous) = &self.last_snapshot {
            let old: i32 = previous.next_instance_id.into();
            if old != id {
                let _ = fs::remove_file(self.dir.join(format!("{}{}", SNAPSHOT_PREFIX, old)));
            }
        }

        let snapshot = Arc::new(snapshot);
        self.last_snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Synchronously appends one accepted proposal. No-op outside full
    /// stable storage.
    pub fn log_proposal(&mut self, id: SeqNo, view: View, value: &[u8]) -> Result<()> {
        if self.crash_model != CrashModel::FullSS {
            return Ok(());
        }
        let file = self
            .decisions
            .as_mut()
            .ok_or(Error::Disconnected("proposal log not open"))?;
        let id: i32 = id.into();
        let view: i32 = view.into();
        let mut record = Vec::with_capacity(12 + value.len());
        record.extend_from_slice(&id.to_le_bytes());
        record.extend_from_slice(&view.to_le_bytes());
        record.extend_from_slice(&(value.len() as u32).to_le_bytes());
        record.extend_from_slice(value);
        file.write_all(&record)?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::config::Configuration;
    use crate::paxos::ordering::SeqNo;

    fn descriptor(dir: &Path) -> ProcessDescriptor {
        let config = Configuration {
            log_path: dir.to_path_buf(),
            crash_model: CrashModel::ViewSS,
            ..Configuration::default()
        };
        ProcessDescriptor::new(config, 0).unwrap()
    }

    #[test]
    fn view_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = descriptor(dir.path());

        let mut storage = StableStorage::open(&descriptor).unwrap();
        assert_eq!(storage.view(), View::ZERO);
        storage.set_view(View::from(7)).unwrap();
        drop(storage);

        let storage = StableStorage::open(&descriptor).unwrap();
        assert_eq!(storage.view(), View::from(7));
    }

    #[test]
    fn latest_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = descriptor(dir.path());

        let mut storage = StableStorage::open(&descriptor).unwrap();
        storage
            .set_last_snapshot(Snapshot {
                next_instance_id: SeqNo::from(5),
                last_replies: Vec::new(),
                value: b"five".to_vec(),
            })
            .unwrap();
        storage
            .set_last_snapshot(Snapshot {
                next_instance_id: SeqNo::from(9),
                last_replies: Vec::new(),
                value: b"nine".to_vec(),
            })
            .unwrap();
        drop(storage);

        let storage = StableStorage::open(&descriptor).unwrap();
        let snapshot = storage.last_snapshot().unwrap();
        assert_eq!(snapshot.next_instance_id, SeqNo::from(9));
        assert_eq!(snapshot.value, b"nine");
    }
}
