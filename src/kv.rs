//! Last-write-wins key/value overlay on top of [`RecordLog`]. Each entry is
//! framed as a single record `key ‖ 0x00 ‖ value`; a value of zero length is
//! a tombstone. Analogous to the teacher's `memtable.rs` + `saturndb.rs`,
//! but log-structured all the way down rather than backed by an in-memory
//! map flushed to an SSTable.

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::flash::Flash;
use crate::record_log::{ReadOutcome, RecordLog};

const KEY_VALUE_SEPARATOR: u8 = 0x00;

fn make_entry(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut entry = Vec::with_capacity(key.len() + 1 + value.len());
    entry.extend_from_slice(key);
    entry.push(KEY_VALUE_SEPARATOR);
    entry.extend_from_slice(value);
    entry
}

/// Splits a raw entry at its first separator. `None` if the entry has no
/// separator at all — not an entry this layer wrote.
fn split_entry(entry: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = entry.iter().position(|&b| b == KEY_VALUE_SEPARATOR)?;
    Some((&entry[..pos], &entry[pos + 1..]))
}

pub struct Kv<F: Flash> {
    log: RecordLog<F>,
}

impl<F: Flash> Kv<F> {
    pub fn mount(log: RecordLog<F>) -> Self {
        Self { log }
    }

    /// Full scan for the last live entry matching `key`. `Ok(None)` covers
    /// both "never set" and "tombstoned". Entries that fail their checksum
    /// are skipped, not treated as a match.
    pub fn lookup(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut found = None;
        let mut cursor = 0u32;
        loop {
            let (next, outcome) = self.log.read_record(cursor, Some(usize::MAX))?;
            match outcome {
                ReadOutcome::EndOfLog => break,
                ReadOutcome::Ok(entry) => {
                    if let Some((k, v)) = split_entry(&entry) {
                        if k == key {
                            found = if v.is_empty() { None } else { Some(v.to_vec()) };
                        }
                    }
                }
                ReadOutcome::Checksum(_) => {
                    warn!("skipping checksum-failed kv entry during lookup");
                }
                _ => {}
            }
            cursor = next;
        }
        Ok(found)
    }

    /// Lists every live key with its current value, last-write-wins,
    /// tombstones and checksum-failed entries excluded.
    pub fn list(&mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.collect_latest(None)
    }

    /// Sets `key` to `value`. Proactively compacts when the entry would
    /// leave less than double its own size free, and retries once after a
    /// reactive compaction if the append still doesn't fit.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.contains(&KEY_VALUE_SEPARATOR) {
            return Err(Error::invalid("key must not contain a NUL byte"));
        }
        let entry = make_entry(key, value);
        if (entry.len() as u32).saturating_mul(2) > self.log.free_space() {
            self.do_compact(Some(key))?;
        }
        match self.log.append(&entry) {
            Ok(_) => Ok(()),
            Err(Error::NoSpace) => {
                self.do_compact(Some(key))?;
                self.log.append(&entry)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Writes a tombstone for `key`. A no-op functionally if the key was
    /// never set, but still appends a record.
    pub fn unset(&mut self, key: &[u8]) -> Result<()> {
        self.set(key, &[])
    }

    /// Explicit compaction: reclaims the oldest region, keeping only the
    /// latest live value per key.
    pub fn compact(&mut self) -> Result<()> {
        self.do_compact(None)
    }

    fn do_compact(&mut self, pending_key: Option<&[u8]>) -> Result<()> {
        let survivors = self.collect_latest(pending_key)?;
        let freed = self.log.clear(1)?;
        debug!("kv compact: freed {freed} bytes, rewriting {} entries", survivors.len());
        for (k, v) in &survivors {
            let entry = make_entry(k, v);
            self.log.append(&entry)?;
        }
        Ok(())
    }

    /// Resets the entire store, erasing every region.
    pub fn clear(&mut self) -> Result<()> {
        self.log.clear(0)?;
        Ok(())
    }

    /// Collects the latest live value per key across a full scan. Removes
    /// tombstones, shadowed (non-last) occurrences, and — when
    /// `pending_key` is set — every existing occurrence of that key, since
    /// it is about to be superseded by a fresh write.
    fn collect_latest(&mut self, pending_key: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut cursor = 0u32;
        loop {
            let (next, outcome) = self.log.read_record(cursor, Some(usize::MAX))?;
            match outcome {
                ReadOutcome::EndOfLog => break,
                ReadOutcome::Ok(entry) => {
                    if let Some((k, v)) = split_entry(&entry) {
                        if pending_key == Some(k) {
                            cursor = next;
                            continue;
                        }
                        match entries.iter().position(|(mk, _)| mk.as_slice() == k) {
                            Some(pos) if v.is_empty() => {
                                entries.remove(pos);
                            }
                            Some(pos) => entries[pos].1 = v.to_vec(),
                            None if !v.is_empty() => entries.push((k.to_vec(), v.to_vec())),
                            None => {}
                        }
                    }
                }
                ReadOutcome::Checksum(_) => {
                    warn!("skipping checksum-failed kv entry during compaction scan");
                }
                _ => {}
            }
            cursor = next;
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::RamFlash;
    use crate::region::Region;

    fn new_kv(region_size: u32, num_regions: usize) -> Kv<RamFlash> {
        let total = region_size * num_regions as u32;
        let regions = (0..num_regions)
            .map(|i| Region::new(i as u32 * region_size, region_size))
            .collect();
        let log = RecordLog::mount(regions, RamFlash::new(total as usize)).unwrap();
        Kv::mount(log)
    }

    #[test]
    fn set_then_lookup() {
        let mut kv = new_kv(0xFF, 2);
        kv.set(b"name", b"alice").unwrap();
        assert_eq!(kv.lookup(b"name").unwrap(), Some(b"alice".to_vec()));
        assert_eq!(kv.lookup(b"missing").unwrap(), None);
    }

    #[test]
    fn last_write_wins() {
        let mut kv = new_kv(0xFF, 2);
        kv.set(b"k", b"v1").unwrap();
        kv.set(b"k", b"v2").unwrap();
        assert_eq!(kv.lookup(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn unset_tombstones() {
        let mut kv = new_kv(0xFF, 2);
        kv.set(b"k", b"v1").unwrap();
        kv.unset(b"k").unwrap();
        assert_eq!(kv.lookup(b"k").unwrap(), None);
    }

    #[test]
    fn list_reflects_last_write_wins_and_tombstones() {
        let mut kv = new_kv(0xFF, 2);
        kv.set(b"a", b"1").unwrap();
        kv.set(b"b", b"2").unwrap();
        kv.set(b"a", b"3").unwrap();
        kv.unset(b"b").unwrap();
        let mut entries = kv.list().unwrap();
        entries.sort();
        assert_eq!(entries, vec![(b"a".to_vec(), b"3".to_vec())]);
    }

    #[test]
    fn repeated_sets_trigger_compaction_without_running_out_of_space() {
        let mut kv = new_kv(0x7F, 3);
        for i in 0..200 {
            kv.set(b"counter", format!("{i}").as_bytes()).unwrap();
        }
        assert_eq!(kv.lookup(b"counter").unwrap(), Some(b"199".to_vec()));
    }

    #[test]
    fn explicit_compact_reclaims_shadowed_entries() {
        let mut kv = new_kv(0x7F, 2);
        for i in 0..10 {
            kv.set(b"k", format!("{i}").as_bytes()).unwrap();
        }
        kv.compact().unwrap();
        assert_eq!(kv.lookup(b"k").unwrap(), Some(b"9".to_vec()));
    }

    #[test]
    fn key_with_nul_byte_is_rejected() {
        let mut kv = new_kv(0xFF, 2);
        let err = kv.set(b"bad\0key", b"v").unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn clear_empties_the_store() {
        let mut kv = new_kv(0xFF, 2);
        kv.set(b"k", b"v").unwrap();
        kv.clear().unwrap();
        assert_eq!(kv.lookup(b"k").unwrap(), None);
        assert!(kv.list().unwrap().is_empty());
    }
}
