use std::collections::HashMap;

use dltview_types::{Lifecycle, LifecycleId, Record};

/// Lifecycles known to one open session.
///
/// Records reference entries by id only; entries are updated in place and
/// never removed until the session is reset.
#[derive(Default)]
pub struct LifecycleTable {
    by_id: HashMap<LifecycleId, Lifecycle>,
    revision: u64,
}

impl LifecycleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: LifecycleId) -> Option<&Lifecycle> {
        self.by_id.get(&id)
    }

    /// Resolves a record's weak lifecycle reference.
    pub fn of_record(&self, record: &Record) -> Option<&Lifecycle> {
        self.get(record.lifecycle?)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Bumped on every applied update; consumers use it to detect changes.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Lifecycles ordered by ECU, then start time.
    pub fn sorted(&self) -> Vec<&Lifecycle> {
        let mut all: Vec<&Lifecycle> = self.by_id.values().collect();
        all.sort_by(|a, b| {
            (a.ecu.as_str(), a.start_time_us, a.id).cmp(&(b.ecu.as_str(), b.start_time_us, b.id))
        });
        all
    }

    /// Merges an engine update. Returns how many lifecycles were new.
    pub fn apply(&mut self, updates: impl IntoIterator<Item = Lifecycle>) -> usize {
        let mut added = 0;
        for update in updates {
            match self.by_id.get_mut(&update.id) {
                Some(existing) => existing.merge_update(&update),
                None => {
                    added += 1;
                    self.by_id.insert(update.id, update);
                }
            }
        }
        self.renumber();
        self.revision += 1;
        added
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.revision += 1;
    }

    fn renumber(&mut self) {
        let mut per_ecu: HashMap<String, Vec<(u64, LifecycleId)>> = HashMap::new();
        for lc in self.by_id.values() {
            per_ecu
                .entry(lc.ecu.clone())
                .or_default()
                .push((lc.start_time_us, lc.id));
        }
        for mut entries in per_ecu.into_values() {
            entries.sort();
            for (ordinal, (_, id)) in entries.into_iter().enumerate() {
                if let Some(lc) = self.by_id.get_mut(&id) {
                    lc.ordinal = ordinal as u32 + 1;
                }
            }
        }
    }
}
