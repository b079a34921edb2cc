//! Ordered machine list, pending downloads and selection.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::events::{Event, EventSink};
use crate::core::machine::{self, Entry, Machine, MachineId, Placeholder};
use crate::core::record::{EntryRecord, ListStore, LoadedRecord};
use crate::downloads::{PendingId, PendingMachine};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Registry {
    entries: Vec<Entry>,
    pending: Vec<PendingMachine>,
    selected: Option<MachineId>,
    store: ListStore,
    storage_root: PathBuf,
    persist_shortcuts: bool,
    generation: u64,
    events: EventSink,
}

impl Registry {
    /// Empty registry writing to `store`.
    pub fn new(
        store: ListStore,
        storage_root: impl Into<PathBuf>,
        persist_shortcuts: bool,
        events: EventSink,
    ) -> Self {
        Self {
            entries: Vec::new(),
            pending: Vec::new(),
            selected: None,
            store,
            storage_root: storage_root.into(),
            persist_shortcuts,
            generation: 0,
            events,
        }
    }

    /// Registry populated from the persisted list. Unreadable records are dropped.
    pub fn restore(
        store: ListStore,
        storage_root: impl Into<PathBuf>,
        persist_shortcuts: bool,
        events: EventSink,
    ) -> Self {
        let mut registry = Self::new(store, storage_root, persist_shortcuts, events);
        let records = match registry.store.load() {
            Ok(records) => records,
            Err(err) => {
                log::warn!("machine list could not be restored: {err}");
                Vec::new()
            }
        };

        let mut seen = HashSet::new();
        for record in records {
            let entry = match record {
                LoadedRecord::Entry(record) => registry.resolve_record(record),
                LoadedRecord::Legacy(name) => registry.resolve_legacy(&name),
            };
            let Some(entry) = entry else { continue };
            let key = entry.backing_path().map(canonical);
            if let Some(key) = key {
                if !seen.insert(key) {
                    continue;
                }
            }
            registry.entries.push(entry);
        }
        log::info!("restored {} machine(s)", registry.entries.len());
        registry
    }

    fn resolve_record(&self, record: EntryRecord) -> Option<Entry> {
        if record.shortcut && !self.persist_shortcuts {
            log::info!(
                "dropping shortcut {}: shortcuts are not persisted",
                record.path.display()
            );
            return None;
        }
        let placeholder = Placeholder::new(record.path, record.name, record.shortcut);
        Some(match placeholder.reopen() {
            Some(machine) => Entry::Live(machine),
            None => Entry::Placeholder(placeholder),
        })
    }

    fn resolve_legacy(&self, name: &str) -> Option<Entry> {
        let path = self.storage_root.join(name);
        match Machine::open(&path) {
            Ok(machine) => Some(Entry::Live(machine)),
            Err(err) => {
                log::warn!("dropping legacy list entry {}: {err}", path.display());
                None
            }
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending(&self) -> &[PendingMachine] {
        &self.pending
    }

    pub fn selected(&self) -> Option<MachineId> {
        self.selected
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn persists_shortcuts(&self) -> bool {
        self.persist_shortcuts
    }

    pub fn position(&self, id: MachineId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id() == id)
    }

    pub fn get(&self, id: MachineId) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.id() == id)
    }

    pub fn require(&self, id: MachineId) -> Result<&Entry> {
        self.get(id).ok_or(Error::MachineNotFound { id: id.get() })
    }

    /// Live machine for `id`; placeholders are reported as not found.
    pub fn machine(&self, id: MachineId) -> Result<&Machine> {
        self.require(id)?
            .as_machine()
            .ok_or(Error::MachineNotFound { id: id.get() })
    }

    /// Mutable access to a live machine. Changes are not persisted until [`Registry::touch`].
    pub fn machine_mut(&mut self, id: MachineId) -> Result<&mut Machine> {
        self.entries
            .iter_mut()
            .find(|entry| entry.id() == id)
            .and_then(Entry::as_machine_mut)
            .ok_or(Error::MachineNotFound { id: id.get() })
    }

    /// Whether a non-shortcut machine already uses `name`.
    pub fn has_name(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| !entry.is_shortcut() && entry.name() == name)
    }

    /// Entry whose bundle is `path`, compared after canonicalisation.
    pub fn find_by_path(&self, path: &Path) -> Option<&Entry> {
        let wanted = canonical(path);
        self.entries
            .iter()
            .find(|entry| entry.backing_path().map(canonical).as_ref() == Some(&wanted))
    }

    /// Insert `entry` at `at` (clamped) or append it; returns the final position.
    pub fn add(&mut self, entry: Entry, at: Option<usize>) -> usize {
        let index = at
            .map(|index| index.min(self.entries.len()))
            .unwrap_or(self.entries.len());
        log::debug!("adding `{}` at position {index}", entry.name());
        self.entries.insert(index, entry);
        self.list_changed();
        index
    }

    /// Remove `id`, returning its former position. The removed entry is tombstoned and the
    /// selection cleared if it pointed at it.
    pub fn remove(&mut self, id: MachineId) -> Option<usize> {
        let index = self.position(id);
        if let Some(index) = index {
            let entry = self.entries.remove(index);
            entry.tombstone().set();
            self.list_changed();
        }
        if self.selected == Some(id) {
            self.select(None);
        }
        index
    }

    /// Move the entries at `from` so they land before the element previously at `to`.
    pub fn move_entries(&mut self, from: &[usize], to: usize) {
        let mut offsets: Vec<usize> = from
            .iter()
            .copied()
            .filter(|index| *index < self.entries.len())
            .collect();
        offsets.sort_unstable();
        offsets.dedup();
        if offsets.is_empty() {
            return;
        }

        let to = to.min(self.entries.len());
        let shift = offsets.iter().filter(|index| **index < to).count();
        let mut moved = Vec::with_capacity(offsets.len());
        for index in offsets.iter().rev() {
            moved.push(self.entries.remove(*index));
        }
        moved.reverse();
        let insert_at = to - shift;
        for (offset, entry) in moved.into_iter().enumerate() {
            self.entries.insert(insert_at + offset, entry);
        }
        self.list_changed();
    }

    pub fn select(&mut self, id: Option<MachineId>) {
        if self.selected != id {
            self.selected = id;
            self.events
                .publish(Event::SelectionChanged { selected: id });
        }
    }

    /// Swap the entry `id` for `entry` in the same slot, carrying the selection over.
    pub fn replace(&mut self, id: MachineId, entry: Entry) -> Result<usize> {
        let index = self
            .position(id)
            .ok_or(Error::MachineNotFound { id: id.get() })?;
        let new_id = entry.id();
        self.entries[index] = entry;
        self.list_changed();
        if self.selected == Some(id) {
            self.select(Some(new_id));
        }
        Ok(index)
    }

    /// Persist and announce in-place changes to an entry.
    pub fn touch(&mut self) {
        self.list_changed();
    }

    /// Replace the whole list in one swap when it differs from the current one.
    pub fn replace_all(&mut self, entries: Vec<Entry>) -> bool {
        let unchanged = entries.len() == self.entries.len()
            && entries
                .iter()
                .zip(&self.entries)
                .all(|(new, old)| new.signature() == old.signature());
        if unchanged {
            return false;
        }
        self.entries = entries;
        if let Some(selected) = self.selected {
            if self.position(selected).is_none() {
                self.select(None);
            }
        }
        self.list_changed();
        true
    }

    /// Reconcile the list with the storage directory synchronously.
    pub fn refresh(&mut self) -> bool {
        let plan = plan_refresh(&self.entries, &self.storage_root);
        self.replace_all(plan)
    }

    pub fn add_pending(&mut self, pending: PendingMachine) {
        self.pending.push(pending);
        self.events.publish(Event::PendingChanged {
            len: self.pending.len(),
        });
    }

    pub fn remove_pending(&mut self, id: PendingId) -> Option<usize> {
        let index = self.pending.iter().position(|pending| pending.id() == id)?;
        self.pending.remove(index);
        self.events.publish(Event::PendingChanged {
            len: self.pending.len(),
        });
        Some(index)
    }

    pub fn pending_by_id(&self, id: PendingId) -> Option<&PendingMachine> {
        self.pending.iter().find(|pending| pending.id() == id)
    }

    fn list_changed(&mut self) {
        self.generation += 1;
        self.persist();
        self.events.publish(Event::ListChanged {
            generation: self.generation,
            len: self.entries.len(),
        });
    }

    fn records(&self) -> Vec<EntryRecord> {
        self.entries
            .iter()
            .filter(|entry| self.persist_shortcuts || !entry.is_shortcut())
            .filter_map(|entry| {
                Some(EntryRecord {
                    path: entry.backing_path()?.to_path_buf(),
                    name: Some(entry.name().to_string()),
                    shortcut: entry.is_shortcut(),
                })
            })
            .collect()
    }

    fn persist(&self) {
        if let Err(err) = self.store.store(&self.records()) {
            log::warn!("failed to persist machine list: {err}");
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Compute the reconciled list for `entries` without touching the registry.
///
/// Live machines whose bundle vanished become placeholders; bundles in `storage_root` that are not
/// listed yet are opened and prepended. Enumeration errors are logged and treated as no new
/// bundles.
pub fn plan_refresh(entries: &[Entry], storage_root: &Path) -> Vec<Entry> {
    let mut list: Vec<Entry> = entries
        .iter()
        .filter_map(|entry| match entry {
            Entry::Live(machine) => match machine.path() {
                Some(path) if path.exists() => Some(entry.clone()),
                _ => Placeholder::for_machine(machine).map(Entry::Placeholder),
            },
            Entry::Placeholder(_) => Some(entry.clone()),
        })
        .collect();

    let known: HashSet<PathBuf> = list
        .iter()
        .filter_map(Entry::backing_path)
        .map(canonical)
        .collect();

    let dir = match fs::read_dir(storage_root) {
        Ok(dir) => dir,
        Err(err) => {
            log::warn!(
                "failed to scan storage directory {}: {err}",
                storage_root.display()
            );
            return list;
        }
    };

    let mut candidates: Vec<PathBuf> = dir
        .filter_map(|entry| entry.ok())
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .map(|entry| entry.path())
        .filter(|path| machine::is_bundle(path))
        .filter(|path| !known.contains(&canonical(path)))
        .collect();
    candidates.sort();

    let discovered: Vec<Entry> = candidates
        .into_iter()
        .filter_map(|path| match Machine::open(&path) {
            Ok(machine) => Some(Entry::Live(machine)),
            Err(err) => {
                log::error!("failed to open bundle {}: {err}", path.display());
                None
            }
        })
        .collect();
    if !discovered.is_empty() {
        log::info!("discovered {} new bundle(s)", discovered.len());
        list.splice(0..0, discovered);
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::machine::MachineConfig;
    use tempfile::tempdir;

    fn registry(root: &Path) -> Registry {
        Registry::new(
            ListStore::new(root.join("prefs.json")),
            root,
            true,
            EventSink::disabled(),
        )
    }

    fn bundle(root: &Path, name: &str) -> Machine {
        let machine = Machine::with_destination(MachineConfig::new(name), root);
        machine.save().unwrap();
        machine
    }

    fn names(registry: &Registry) -> Vec<String> {
        registry
            .entries()
            .iter()
            .map(|entry| entry.name().to_string())
            .collect()
    }

    #[test]
    fn remove_tombstones_and_clears_selection() {
        let dir = tempdir().unwrap();
        let mut registry = registry(dir.path());
        let machine = bundle(dir.path(), "A");
        let id = machine.id();
        let tombstone = machine.tombstone();
        registry.add(machine.into(), None);
        registry.select(Some(id));

        assert_eq!(registry.remove(id), Some(0));
        assert!(tombstone.is_set());
        assert_eq!(registry.selected(), None);
        assert_eq!(registry.remove(id), None);
    }

    #[test]
    fn move_follows_collection_semantics() {
        let dir = tempdir().unwrap();
        let mut registry = registry(dir.path());
        for name in ["A", "B", "C", "D"] {
            registry.add(bundle(dir.path(), name).into(), None);
        }
        registry.move_entries(&[0], 3);
        assert_eq!(names(&registry), ["B", "C", "A", "D"]);
        registry.move_entries(&[1, 3], 0);
        assert_eq!(names(&registry), ["C", "D", "B", "A"]);
        registry.move_entries(&[2], 4);
        assert_eq!(names(&registry), ["C", "D", "A", "B"]);
    }

    #[test]
    fn refresh_is_idempotent() {
        let dir = tempdir().unwrap();
        bundle(dir.path(), "One");
        bundle(dir.path(), "Two");
        fs::create_dir_all(dir.path().join(".hidden.vmbundle")).unwrap();
        let mut registry = registry(dir.path());

        assert!(registry.refresh());
        let first: Vec<_> = registry.entries().iter().map(Entry::signature).collect();
        assert_eq!(names(&registry), ["One", "Two"]);

        let generation = registry.generation();
        assert!(!registry.refresh());
        let second: Vec<_> = registry.entries().iter().map(Entry::signature).collect();
        assert_eq!(first, second);
        assert_eq!(registry.generation(), generation);
    }

    #[test]
    fn refresh_wraps_vanished_bundles() {
        let dir = tempdir().unwrap();
        let machine = bundle(dir.path(), "Gone");
        let id = machine.id();
        let path = machine.path().unwrap().to_path_buf();
        let mut registry = registry(dir.path());
        registry.add(machine.into(), None);

        fs::remove_dir_all(&path).unwrap();
        assert!(registry.refresh());
        let entry = registry.get(id).unwrap();
        assert!(entry.is_placeholder());
        assert_eq!(entry.backing_path(), Some(path.as_path()));
    }

    #[test]
    fn refresh_prepends_new_bundles() {
        let dir = tempdir().unwrap();
        let mut registry = registry(dir.path());
        registry.add(bundle(dir.path(), "Existing").into(), None);
        bundle(dir.path(), "Fresh");
        registry.refresh();
        assert_eq!(names(&registry), ["Fresh", "Existing"]);
    }

    #[test]
    fn refresh_survives_missing_storage() {
        let dir = tempdir().unwrap();
        let mut registry = registry(&dir.path().join("absent"));
        assert!(!registry.refresh());
    }

    #[test]
    fn restore_resolves_live_placeholder_and_legacy() {
        let dir = tempdir().unwrap();
        let live = bundle(dir.path(), "Live");
        bundle(dir.path(), "Legacy");
        let prefs = dir.path().join("prefs.json");
        fs::write(
            &prefs,
            serde_json::json!({
                "VMList": [
                    {"path": live.path().unwrap(), "name": "Live"},
                    {"path": dir.path().join("Missing.vmbundle"), "name": "Missing"},
                    "Legacy.vmbundle",
                    "Legacy.vmbundle",
                    "Broken.vmbundle"
                ]
            })
            .to_string(),
        )
        .unwrap();

        let registry = Registry::restore(
            ListStore::new(&prefs),
            dir.path(),
            true,
            EventSink::disabled(),
        );
        assert_eq!(names(&registry), ["Live", "Missing", "Legacy"]);
        assert!(registry.entries()[1].is_placeholder());
    }

    #[test]
    fn restore_drops_shortcuts_when_not_persisted() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let shortcut = bundle(outside.path(), "Elsewhere");
        let prefs = dir.path().join("prefs.json");
        fs::write(
            &prefs,
            serde_json::json!({
                "VMList": [{"path": shortcut.path().unwrap(), "shortcut": true}]
            })
            .to_string(),
        )
        .unwrap();

        let registry = Registry::restore(
            ListStore::new(&prefs),
            dir.path(),
            false,
            EventSink::disabled(),
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn mutations_are_persisted_in_order() {
        let dir = tempdir().unwrap();
        let mut registry = registry(dir.path());
        registry.add(bundle(dir.path(), "First").into(), None);
        registry.add(bundle(dir.path(), "Zeroth").into(), Some(0));

        let restored = Registry::restore(
            ListStore::new(dir.path().join("prefs.json")),
            dir.path(),
            true,
            EventSink::disabled(),
        );
        assert_eq!(names(&restored), ["Zeroth", "First"]);
    }

    #[test]
    fn replace_keeps_position_and_selection() {
        let dir = tempdir().unwrap();
        let mut registry = registry(dir.path());
        let first = bundle(dir.path(), "A");
        let second = bundle(dir.path(), "B");
        let id = second.id();
        registry.add(first.into(), None);
        registry.add(second.into(), None);
        registry.select(Some(id));

        let reopened = Machine::open(&dir.path().join("B.vmbundle")).unwrap();
        let new_id = reopened.id();
        assert_eq!(registry.replace(id, reopened.into()).unwrap(), 1);
        assert_eq!(registry.selected(), Some(new_id));
    }

    #[test]
    fn duplicate_names_ignore_shortcuts() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let mut registry = registry(dir.path());
        let external = bundle(outside.path(), "Shared");
        let shortcut = Machine::open_shortcut(external.path().unwrap()).unwrap();
        registry.add(shortcut.into(), None);
        assert!(!registry.has_name("Shared"));
        registry.add(bundle(dir.path(), "Shared").into(), None);
        assert!(registry.has_name("Shared"));
    }

    #[test]
    fn pending_downloads_are_tracked_apart_from_entries() {
        let dir = tempdir().unwrap();
        let (sink, events) = EventSink::channel(8);
        let mut registry = Registry::new(
            ListStore::new(dir.path().join("prefs.json")),
            dir.path(),
            true,
            sink,
        );
        let first = PendingMachine::new("a.zip", "https://mirror.test/a.zip");
        let second = PendingMachine::new("b.zip", "https://mirror.test/b.zip");
        let (first_id, second_id) = (first.id(), second.id());
        registry.add_pending(first);
        registry.add_pending(second);

        assert!(registry.is_empty());
        assert_eq!(registry.pending_by_id(second_id).unwrap().name(), "b.zip");
        assert_eq!(registry.remove_pending(first_id), Some(0));
        assert_eq!(registry.remove_pending(first_id), None);
        assert_eq!(registry.pending().len(), 1);
        assert!(!dir.path().join("prefs.json").exists());

        let lens: Vec<usize> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                Event::PendingChanged { len } => Some(len),
                _ => None,
            })
            .collect();
        assert_eq!(lens, vec![1, 2, 1]);
    }
}
