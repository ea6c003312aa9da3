//! Data info provider: the global versioned data registry
//!
//! Allocates data ids on first access, advances versions on writes and
//! resolves reads to concrete instances. Exclusive writes (W/RW) chain
//! successor versions; concurrent and commutative accesses share one pending
//! group version that commits when the last member finishes.
//!
//! The provider is owned by the dispatcher and is therefore single-threaded;
//! instance ids are assigned in a globally-serialized order matching task
//! processing order.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};
use weft_core::{AccessMode, DataId, DataInstanceId, DataVersion, Error, Result};

/// Result of registering one access: up to two concrete instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredAccess {
    pub data_id: DataId,
    /// Instance the access reads, with a reader pinned on it
    pub read: Option<DataInstanceId>,
    /// Instance the access will produce
    pub write: Option<DataInstanceId>,
    /// Whether this was the first access ever on the data
    pub first_access: bool,
    /// Set when the write instance is a shared concurrent/commutative group
    /// version this access joined or opened
    pub joined_group: bool,
}

/// Outcome of confirming a write instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// The instance is now the committed current version
    pub committed: bool,
    /// A relaxed group on this instance just drained its last writer
    pub group_drained: bool,
}

/// An open or draining concurrent/commutative bag on one version.
#[derive(Debug)]
struct RelaxedGroup {
    mode: AccessMode,
    /// Version the group members read from
    base: u32,
    /// Members that have not yet confirmed their write
    open_writers: u32,
    /// Closed groups accept no new members; they still drain
    open: bool,
}

#[derive(Debug)]
struct DataInfo {
    id: DataId,
    key: String,
    versions: BTreeMap<u32, DataVersion>,
    /// Latest allocated version; reads resolve here
    latest: u32,
    /// Relaxed groups keyed by their shared version
    groups: HashMap<u32, RelaxedGroup>,
    /// Version currently open for relaxed joins, if any
    open_group: Option<u32>,
    deleted: bool,
}

impl DataInfo {
    fn new(id: DataId, key: String) -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(1, DataVersion::new(id, 1));
        Self {
            id,
            key,
            versions,
            latest: 1,
            groups: HashMap::new(),
            open_group: None,
            deleted: false,
        }
    }

    fn allocate_version(&mut self) -> DataInstanceId {
        self.latest += 1;
        let dv = DataVersion::new(self.id, self.latest);
        let instance = dv.instance();
        self.versions.insert(self.latest, dv);
        instance
    }

    fn close_open_group(&mut self) {
        if let Some(version) = self.open_group.take() {
            if let Some(group) = self.groups.get_mut(&version) {
                group.open = false;
            }
        }
    }
}

/// Global registry of data ids, versions and instances.
#[derive(Debug, Default)]
pub struct DataInfoProvider {
    next_data_id: u32,
    infos: HashMap<DataId, DataInfo>,
    keys: HashMap<String, DataId>,
    /// Renamings whose backing storage can be evicted
    obsoletes: Vec<String>,
}

impl DataInfoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a user data key to its id, if the data was ever accessed.
    pub fn resolve(&self, key: &str) -> Option<DataId> {
        self.keys.get(key).copied()
    }

    pub fn data_has_been_accessed(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Register one access, allocating the data id and versions as needed.
    ///
    /// For W or first-touch R a fresh instance is returned and the caller is
    /// responsible for backing it with storage before any reader resolves
    /// it. Pure-W first access invalidates the initial version immediately:
    /// no reader will ever need the pre-existing value.
    pub fn register_access(&mut self, key: &str, mode: AccessMode) -> Result<RegisteredAccess> {
        let (data_id, first_access) = match self.keys.entry(key.to_string()) {
            Entry::Occupied(e) => (*e.get(), false),
            Entry::Vacant(e) => {
                self.next_data_id += 1;
                let id = DataId(self.next_data_id);
                e.insert(id);
                self.infos.insert(id, DataInfo::new(id, key.to_string()));
                debug!(data = %id, key, "Registered new data");
                (id, true)
            }
        };

        let info = self.infos.get_mut(&data_id).expect("info registered above");
        if info.deleted {
            return Err(Error::UnknownData(format!("{key} was deleted")));
        }

        if first_access && mode == AccessMode::Write {
            // The original value can never be observed
            info.versions
                .get_mut(&1)
                .expect("initial version")
                .invalidate();
        }

        let access = match mode {
            AccessMode::Read => {
                info.close_open_group();
                let read = info.versions[&info.latest].instance();
                info.versions
                    .get_mut(&info.latest)
                    .expect("latest version")
                    .add_reader();
                RegisteredAccess {
                    data_id,
                    read: Some(read),
                    write: None,
                    first_access,
                    joined_group: false,
                }
            }
            AccessMode::Write => {
                info.close_open_group();
                let write = info.allocate_version();
                RegisteredAccess {
                    data_id,
                    read: None,
                    write: Some(write),
                    first_access,
                    joined_group: false,
                }
            }
            AccessMode::ReadWrite => {
                info.close_open_group();
                let read = info.versions[&info.latest].instance();
                info.versions
                    .get_mut(&info.latest)
                    .expect("latest version")
                    .add_reader();
                let write = info.allocate_version();
                RegisteredAccess {
                    data_id,
                    read: Some(read),
                    write: Some(write),
                    first_access,
                    joined_group: false,
                }
            }
            AccessMode::Concurrent | AccessMode::Commutative => {
                let joinable = info
                    .open_group
                    .and_then(|v| info.groups.get(&v).map(|g| (v, g.mode)))
                    .filter(|(_, group_mode)| *group_mode == mode)
                    .map(|(v, _)| v);

                let version = match joinable {
                    Some(version) => {
                        let group = info.groups.get_mut(&version).expect("open group");
                        group.open_writers += 1;
                        version
                    }
                    None => {
                        info.close_open_group();
                        let base = info.latest;
                        let write = info.allocate_version();
                        info.groups.insert(
                            write.version,
                            RelaxedGroup {
                                mode,
                                base,
                                open_writers: 1,
                                open: true,
                            },
                        );
                        info.open_group = Some(write.version);
                        write.version
                    }
                };

                let base = info.groups[&version].base;
                let read = info.versions[&base].instance();
                info.versions
                    .get_mut(&base)
                    .expect("group base version")
                    .add_reader();
                RegisteredAccess {
                    data_id,
                    read: Some(read),
                    write: Some(DataInstanceId::new(data_id, version)),
                    first_access,
                    joined_group: true,
                }
            }
        };

        debug!(
            data = %data_id,
            ?mode,
            read = ?access.read.map(|d| d.renaming()),
            write = ?access.write.map(|d| d.renaming()),
            "Registered access"
        );
        Ok(access)
    }

    /// Release one reader of an instance. A drained instance with a newer
    /// version becomes obsolete and its renaming is queued for eviction.
    ///
    /// Double-finish is idempotent: logged, never fatal.
    pub fn finish_access(&mut self, instance: DataInstanceId) -> Result<()> {
        let info = self
            .infos
            .get_mut(&instance.data_id)
            .ok_or_else(|| Error::UnknownData(instance.renaming()))?;
        let latest = info.latest;
        let version = info
            .versions
            .get_mut(&instance.version)
            .ok_or_else(|| Error::UnknownData(instance.renaming()))?;

        let drained = version.release_reader();
        if drained && instance.version < latest {
            version.invalidate();
            self.obsoletes.push(instance.renaming());
            debug!(instance = %instance, "Version obsolete after last reader");
        }
        Ok(())
    }

    /// Confirm or abort a write instance after its producer finished.
    ///
    /// On success the instance is marked produced; relaxed group versions
    /// commit only when their last member confirms. On failure the instance
    /// is invalidated and never published.
    pub fn confirm_write(&mut self, instance: DataInstanceId, success: bool) -> Result<WriteOutcome> {
        let info = self
            .infos
            .get_mut(&instance.data_id)
            .ok_or_else(|| Error::UnknownData(instance.renaming()))?;

        if let Some(group) = info.groups.get_mut(&instance.version) {
            group.open_writers = group.open_writers.saturating_sub(1);
            let drained = group.open_writers == 0;
            if !success {
                info.versions
                    .get_mut(&instance.version)
                    .expect("group version")
                    .invalidate();
            }
            if drained {
                info.groups.remove(&instance.version);
                if info.open_group == Some(instance.version) {
                    info.open_group = None;
                }
                let version = info
                    .versions
                    .get_mut(&instance.version)
                    .expect("group version");
                let committed = success && !version.is_invalidated();
                if committed {
                    version.mark_produced();
                }
                return Ok(WriteOutcome {
                    committed,
                    group_drained: true,
                });
            }
            return Ok(WriteOutcome {
                committed: false,
                group_drained: false,
            });
        }

        let version = info
            .versions
            .get_mut(&instance.version)
            .ok_or_else(|| Error::UnknownData(instance.renaming()))?;
        if success {
            version.mark_produced();
        } else {
            version.invalidate();
            self.obsoletes.push(instance.renaming());
        }
        Ok(WriteOutcome {
            committed: success,
            group_drained: false,
        })
    }

    /// Mark all versions of a data id obsolete. Backing storage of versions
    /// with outstanding readers is evicted as readers drain.
    pub fn delete_data(&mut self, key: &str) -> Result<DataId> {
        let data_id = self
            .resolve(key)
            .ok_or_else(|| Error::UnknownData(key.to_string()))?;
        let info = self.infos.get_mut(&data_id).expect("resolved id");
        info.deleted = true;
        for version in info.versions.values_mut() {
            if version.readers() == 0 {
                if !version.is_invalidated() {
                    version.invalidate();
                    self.obsoletes.push(version.instance().renaming());
                }
            } else {
                warn!(
                    instance = %version.instance(),
                    readers = version.readers(),
                    "Deletion deferred until readers drain"
                );
            }
        }
        debug!(data = %data_id, key, "Data deleted");
        Ok(data_id)
    }

    /// Whether any version of the data still has registered readers.
    pub fn has_outstanding_readers(&self, data_id: DataId) -> bool {
        self.infos
            .get(&data_id)
            .map(|info| info.versions.values().any(|v| v.readers() > 0))
            .unwrap_or(false)
    }

    /// Whether a relaxed group is still draining on the data.
    pub fn has_open_relaxed_group(&self, data_id: DataId) -> bool {
        self.infos
            .get(&data_id)
            .map(|info| !info.groups.is_empty())
            .unwrap_or(false)
    }

    /// Pin the latest instance for a synchronous read from the user thread.
    /// The caller must `finish_access` the returned instance when done.
    pub fn block_data(&mut self, key: &str) -> Result<DataInstanceId> {
        let data_id = self
            .resolve(key)
            .ok_or_else(|| Error::UnknownData(key.to_string()))?;
        let info = self.infos.get_mut(&data_id).expect("resolved id");
        let instance = info.versions[&info.latest].instance();
        info.versions
            .get_mut(&info.latest)
            .expect("latest version")
            .add_reader();
        Ok(instance)
    }

    /// The latest allocated instance of a data id.
    pub fn latest_instance(&self, data_id: DataId) -> Option<DataInstanceId> {
        self.infos
            .get(&data_id)
            .map(|info| info.versions[&info.latest].instance())
    }

    /// Whether the latest version of the data has been produced.
    pub fn latest_is_produced(&self, data_id: DataId) -> bool {
        self.infos
            .get(&data_id)
            .map(|info| info.versions[&info.latest].is_produced())
            .unwrap_or(false)
    }

    /// Drain renamings whose backing storage can now be evicted.
    pub fn take_obsoletes(&mut self) -> Vec<String> {
        std::mem::take(&mut self.obsoletes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_read_pins_initial_version() {
        let mut dip = DataInfoProvider::new();
        let a = dip.register_access("file:/tmp/in", AccessMode::Read).unwrap();
        assert!(a.first_access);
        assert_eq!(a.read.unwrap().renaming(), "d1_v1");
        assert!(a.write.is_none());
    }

    #[test]
    fn test_write_chain_advances_versions() {
        let mut dip = DataInfoProvider::new();
        let w1 = dip.register_access("file:/tmp/x", AccessMode::Write).unwrap();
        let w2 = dip.register_access("file:/tmp/x", AccessMode::Write).unwrap();
        assert_eq!(w1.write.unwrap().renaming(), "d1_v2");
        assert_eq!(w2.write.unwrap().renaming(), "d1_v3");
    }

    #[test]
    fn test_rw_reads_latest_and_writes_successor() {
        let mut dip = DataInfoProvider::new();
        dip.register_access("file:/tmp/x", AccessMode::Write).unwrap();
        let rw = dip
            .register_access("file:/tmp/x", AccessMode::ReadWrite)
            .unwrap();
        assert_eq!(rw.read.unwrap().renaming(), "d1_v2");
        assert_eq!(rw.write.unwrap().renaming(), "d1_v3");
    }

    #[test]
    fn test_reader_resolves_to_pending_writer_output() {
        let mut dip = DataInfoProvider::new();
        let w = dip.register_access("file:/tmp/x", AccessMode::Write).unwrap();
        let r = dip.register_access("file:/tmp/x", AccessMode::Read).unwrap();
        assert_eq!(r.read, w.write);
    }

    #[test]
    fn test_unknown_data_errors() {
        let mut dip = DataInfoProvider::new();
        assert!(matches!(
            dip.delete_data("file:/nope"),
            Err(Error::UnknownData(_))
        ));
        assert!(!dip.data_has_been_accessed("file:/nope"));
    }

    #[test]
    fn test_finish_access_marks_old_version_obsolete() {
        let mut dip = DataInfoProvider::new();
        let r = dip.register_access("file:/tmp/x", AccessMode::Read).unwrap();
        dip.register_access("file:/tmp/x", AccessMode::Write).unwrap();
        dip.finish_access(r.read.unwrap()).unwrap();
        assert_eq!(dip.take_obsoletes(), vec!["d1_v1".to_string()]);
    }

    #[test]
    fn test_double_finish_is_not_fatal() {
        let mut dip = DataInfoProvider::new();
        let r = dip.register_access("file:/tmp/x", AccessMode::Read).unwrap();
        dip.finish_access(r.read.unwrap()).unwrap();
        assert!(dip.finish_access(r.read.unwrap()).is_ok());
    }

    #[test]
    fn test_commutative_members_share_version() {
        let mut dip = DataInfoProvider::new();
        let m1 = dip
            .register_access("file:/tmp/acc", AccessMode::Commutative)
            .unwrap();
        let m2 = dip
            .register_access("file:/tmp/acc", AccessMode::Commutative)
            .unwrap();
        let m3 = dip
            .register_access("file:/tmp/acc", AccessMode::Commutative)
            .unwrap();
        assert_eq!(m1.write, m2.write);
        assert_eq!(m2.write, m3.write);
        assert_eq!(m1.read.unwrap().version, 1);
    }

    #[test]
    fn test_reader_closes_commutative_bag() {
        let mut dip = DataInfoProvider::new();
        let m1 = dip
            .register_access("file:/tmp/acc", AccessMode::Commutative)
            .unwrap();
        let r = dip.register_access("file:/tmp/acc", AccessMode::Read).unwrap();
        // Reader sees the bag's merged version
        assert_eq!(r.read, m1.write);
        // A later commutative access opens a fresh bag
        let m2 = dip
            .register_access("file:/tmp/acc", AccessMode::Commutative)
            .unwrap();
        assert_ne!(m2.write, m1.write);
    }

    #[test]
    fn test_group_commits_when_last_member_confirms() {
        let mut dip = DataInfoProvider::new();
        let m1 = dip
            .register_access("file:/tmp/acc", AccessMode::Commutative)
            .unwrap();
        let m2 = dip
            .register_access("file:/tmp/acc", AccessMode::Commutative)
            .unwrap();
        let shared = m1.write.unwrap();

        let first = dip.confirm_write(shared, true).unwrap();
        assert!(!first.committed);
        let _ = m2;
        let second = dip.confirm_write(shared, true).unwrap();
        assert!(second.committed);
        assert!(second.group_drained);
        assert!(!dip.has_open_relaxed_group(DataId(1)));
    }

    #[test]
    fn test_concurrent_does_not_join_commutative_bag() {
        let mut dip = DataInfoProvider::new();
        let m = dip
            .register_access("file:/tmp/acc", AccessMode::Commutative)
            .unwrap();
        let c = dip
            .register_access("file:/tmp/acc", AccessMode::Concurrent)
            .unwrap();
        assert_ne!(m.write, c.write);
    }

    #[test]
    fn test_pure_w_first_touch_invalidates_initial_version() {
        let mut dip = DataInfoProvider::new();
        dip.register_access("file:/tmp/out", AccessMode::Write).unwrap();
        let info = &dip.infos[&DataId(1)];
        assert!(info.versions[&1].is_invalidated());
    }

    #[test]
    fn test_deleted_data_rejects_access() {
        let mut dip = DataInfoProvider::new();
        dip.register_access("file:/tmp/x", AccessMode::Read).unwrap();
        dip.delete_data("file:/tmp/x").unwrap();
        assert!(matches!(
            dip.register_access("file:/tmp/x", AccessMode::Read),
            Err(Error::UnknownData(_))
        ));
    }
}
