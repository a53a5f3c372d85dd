//! Structured event log layered on two [`RecordLog`]s: the durable one on
//! real flash, and an optional RAM mirror kept in sync for fast iteration.
//! Analogous to the teacher's `sstable.rs` (a flushed, rebuildable view
//! over logically the same data) crossed with its `memtable.rs` (the fast
//! RAM-resident path), but here both paths are full `RecordLog`s rather
//! than a `BTreeMap`.
//!
//! The wire codec lives in [`codec`], kept separate from the log itself —
//! a caller could swap in a real serialization format without touching
//! `EventLog`.

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::flash::{Flash, RamFlash};
use crate::record_log::{ReadOutcome, RecordLog};
use crate::region::Region;

pub use codec::{Event, EventType};

/// Upper bound on one event's encoded size.
pub const MAX_EVENT_SIZE: usize = 4096;

/// Minimal crate-internal event codec. Not the event serialization format
/// itself — just enough framing to exercise the log end-to-end, the same
/// role nanopb plays for the original over its own wire format.
pub mod codec {
    use crate::common::{decode_var, encode_var};

    /// An event's type tag. `Custom` carries its own raw tag value, so the
    /// encoding is just the tag itself — no separate discriminant byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum EventType {
        LogCleared,
        BootUp,
        Custom(u32),
    }

    impl EventType {
        fn to_tag(self) -> u32 {
            match self {
                EventType::LogCleared => 0,
                EventType::BootUp => 1,
                EventType::Custom(tag) => tag,
            }
        }

        fn from_tag(tag: u32) -> Self {
            match tag {
                0 => EventType::LogCleared,
                1 => EventType::BootUp,
                tag => EventType::Custom(tag),
            }
        }
    }

    /// A single structured event. `boot_number` and `timestamp` are `None`
    /// until stamped, either by the caller or by `EventLog::add`'s hooks;
    /// `0` on the wire means "never stamped". `data` holds arbitrary
    /// string key/value pairs, matching the original's `event_add_kv_data`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Event {
        pub event_type: EventType,
        pub boot_number: Option<u32>,
        pub timestamp: Option<u32>,
        pub data: Vec<(String, String)>,
    }

    impl Event {
        pub fn new(event_type: EventType) -> Self {
            Self {
                event_type,
                boot_number: None,
                timestamp: None,
                data: Vec::new(),
            }
        }

        pub fn with_kv(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
            self.data.push((key.into(), value.into()));
            self
        }

        pub(super) fn cleared_marker() -> Self {
            Self::new(EventType::LogCleared)
        }
    }

    fn push_varint(buf: &mut Vec<u8>, n: usize) {
        let mut tmp = [0u8; 10];
        let len = encode_var(n, &mut tmp);
        buf.extend_from_slice(&tmp[..len]);
    }

    fn push_string(buf: &mut Vec<u8>, s: &str) {
        push_varint(buf, s.len());
        buf.extend_from_slice(s.as_bytes());
    }

    fn take_varint(bytes: &[u8], off: &mut usize) -> Option<usize> {
        let (value, n) = decode_var(&bytes[*off..])?;
        *off += n;
        Some(value)
    }

    fn take_string(bytes: &[u8], off: &mut usize) -> Option<String> {
        let len = take_varint(bytes, off)?;
        if bytes.len() - *off < len {
            return None;
        }
        let s = String::from_utf8(bytes[*off..*off + len].to_vec()).ok()?;
        *off += len;
        Some(s)
    }

    pub fn encode(event: &Event) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + event.data.len() * 8);
        push_varint(&mut buf, event.event_type.to_tag() as usize);
        push_varint(&mut buf, event.boot_number.unwrap_or(0) as usize);
        push_varint(&mut buf, event.timestamp.unwrap_or(0) as usize);
        push_varint(&mut buf, event.data.len());
        for (key, value) in &event.data {
            push_string(&mut buf, key);
            push_string(&mut buf, value);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Option<Event> {
        let mut off = 0;
        let tag = take_varint(bytes, &mut off)?;
        let boot_number = take_varint(bytes, &mut off)?;
        let timestamp = take_varint(bytes, &mut off)?;
        let num_pairs = take_varint(bytes, &mut off)?;
        let mut data = Vec::with_capacity(num_pairs);
        for _ in 0..num_pairs {
            let key = take_string(bytes, &mut off)?;
            let value = take_string(bytes, &mut off)?;
            data.push((key, value));
        }
        Some(Event {
            event_type: EventType::from_tag(tag as u32),
            boot_number: (boot_number != 0).then_some(boot_number as u32),
            timestamp: (timestamp != 0).then_some(timestamp as u32),
            data,
        })
    }
}

/// Structured event log over a durable flash-backed [`RecordLog`], with an
/// optional RAM mirror.
pub struct EventLog<F: Flash> {
    flash_log: RecordLog<F>,
    mirror: Option<RecordLog<RamFlash>>,
    boot_number_hook: Option<Box<dyn FnMut() -> u32>>,
    timestamp_hook: Option<Box<dyn FnMut() -> u32>>,
    /// Whether `add` may reclaim the oldest region (once) when the medium
    /// is full, rather than surfacing `NoSpace` straight away.
    allow_clear_on_add: bool,
}

impl<F: Flash> EventLog<F> {
    /// Mounts the event log. When `use_mirror` is set, a RAM mirror
    /// matching the flash log's region layout is built and kept current.
    /// Writes the `LogCleared` marker if the medium comes up with no
    /// valid events at all (a blank medium, or one previously cleared down
    /// to only corrupt/unreadable entries).
    pub fn mount(flash_log: RecordLog<F>, use_mirror: bool) -> Result<Self> {
        let mirror = if use_mirror {
            let regions: Vec<Region> = (0..flash_log.num_regions())
                .scan(0u32, |offset, i| {
                    let size = flash_log.region(i).size;
                    let region = Region::new(*offset, size);
                    *offset += size;
                    Some(region)
                })
                .collect();
            let total: u32 = regions.iter().map(|r| r.size).sum();
            Some(RecordLog::mount(regions, RamFlash::new(total as usize))?)
        } else {
            None
        };

        let mut log = Self {
            flash_log,
            mirror,
            boot_number_hook: None,
            timestamp_hook: None,
            allow_clear_on_add: true,
        };
        log.resync_mirror()?;
        if log.count() == 0 {
            debug!("event log has no valid events, writing initial clear marker");
            log.write_clear_event()?;
        }
        Ok(log)
    }

    pub fn set_boot_number_hook(&mut self, hook: impl FnMut() -> u32 + 'static) {
        self.boot_number_hook = Some(Box::new(hook));
    }

    pub fn set_timestamp_hook(&mut self, hook: impl FnMut() -> u32 + 'static) {
        self.timestamp_hook = Some(Box::new(hook));
    }

    pub fn set_allow_clear_on_add(&mut self, allow: bool) {
        self.allow_clear_on_add = allow;
    }

    /// Appends `event`, stamping `boot_number`/`timestamp` from the
    /// installed hooks when the caller left them unset. On a full medium,
    /// retries exactly once after reclaiming the oldest region, if
    /// `allow_clear_on_add` is set; otherwise surfaces `NoSpace` directly.
    pub fn add(&mut self, mut event: Event) -> Result<()> {
        self.stamp(&mut event);
        let bytes = codec::encode(&event);
        if bytes.len() > MAX_EVENT_SIZE {
            return Err(Error::invalid("event exceeds max event size"));
        }
        match self.append_to_both(&bytes) {
            Ok(()) => Ok(()),
            Err(Error::NoSpace) if self.allow_clear_on_add => {
                warn!("event log full, reclaiming oldest region");
                self.log_compact()?;
                self.append_to_both(&bytes)
            }
            Err(e) => Err(e),
        }
    }

    fn stamp(&mut self, event: &mut Event) {
        if event.boot_number.is_none() {
            if let Some(hook) = &mut self.boot_number_hook {
                event.boot_number = Some(hook());
            }
        }
        if event.timestamp.is_none() {
            if let Some(hook) = &mut self.timestamp_hook {
                event.timestamp = Some(hook());
            }
        }
    }

    fn append_to_both(&mut self, bytes: &[u8]) -> Result<()> {
        self.flash_log.append(bytes)?;
        if let Some(mirror) = self.mirror.as_mut() {
            if let Err(e) = mirror.append(bytes) {
                warn!("mirror append failed ({e}), resyncing from flash");
                self.resync_mirror()?;
            }
        }
        Ok(())
    }

    /// Clears exactly one flash region, fully clears and rebuilds the
    /// mirror, then writes a fresh `LogCleared` marker.
    fn log_compact(&mut self) -> Result<()> {
        self.flash_log.clear(1)?;
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.clear(0)?;
        }
        self.resync_mirror()?;
        self.write_clear_event()
    }

    fn write_clear_event(&mut self) -> Result<()> {
        let mut event = Event::cleared_marker();
        self.stamp(&mut event);
        let bytes = codec::encode(&event);
        self.append_to_both(&bytes)
    }

    /// Erases every region on both logs and writes a single `LogCleared`
    /// marker.
    pub fn clear(&mut self) -> Result<()> {
        self.flash_log.clear(0)?;
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.clear(0)?;
        }
        self.write_clear_event()
    }

    /// Rebuilds the mirror from the flash log's current contents. Records
    /// that fail their checksum on flash are still copied across as fresh,
    /// correctly-checksummed mirror entries, so a reader using the mirror
    /// still sees the event rather than losing it; a framing error stops
    /// the resync where the flash scan itself would stop.
    fn resync_mirror(&mut self) -> Result<()> {
        if self.mirror.is_none() {
            return Ok(());
        }
        self.mirror.as_mut().unwrap().clear(0)?;
        let mut cursor = 0u32;
        loop {
            let outcome = self.flash_log.read_record(cursor, Some(MAX_EVENT_SIZE));
            match outcome {
                Ok((_, ReadOutcome::EndOfLog)) => break,
                Ok((next, ReadOutcome::Ok(data))) | Ok((next, ReadOutcome::Checksum(data))) => {
                    self.mirror.as_mut().unwrap().append(&data)?;
                    cursor = next;
                }
                Ok((_, ReadOutcome::NoSpace { .. })) | Ok((_, ReadOutcome::Framing { .. })) => break,
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// Visits every decodable event in order, preferring the mirror when
    /// mounted. The bool passed to `callback` is `true` for a clean read,
    /// `false` if the record's checksum had failed (the event is still
    /// delivered).
    pub fn for_each<C: FnMut(&Event, bool)>(&mut self, callback: C) {
        if let Some(mirror) = self.mirror.as_mut() {
            scan(mirror, callback);
        } else {
            scan(&mut self.flash_log, callback);
        }
    }

    /// Counts only checksum-clean events, matching the original's
    /// `count_events_callback` (a checksum-failed event is decodable but
    /// doesn't count as "valid").
    pub fn count(&mut self) -> usize {
        let mut n = 0usize;
        self.for_each(|_, ok| {
            if ok {
                n += 1;
            }
        });
        n
    }
}

fn scan<FF: Flash, C: FnMut(&Event, bool)>(log: &mut RecordLog<FF>, mut callback: C) {
    let mut cursor = 0u32;
    loop {
        match log.read_record(cursor, Some(MAX_EVENT_SIZE)) {
            Ok((_, ReadOutcome::EndOfLog)) => break,
            Ok((next, ReadOutcome::Ok(data))) => {
                if let Some(event) = codec::decode(&data) {
                    callback(&event, true);
                }
                cursor = next;
            }
            Ok((next, ReadOutcome::Checksum(data))) => {
                if let Some(event) = codec::decode(&data) {
                    callback(&event, false);
                }
                cursor = next;
            }
            Ok((_, ReadOutcome::NoSpace { .. })) | Ok((_, ReadOutcome::Framing { .. })) => break,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::RamFlash;

    fn new_flash_log(region_size: u32, num_regions: usize) -> RecordLog<RamFlash> {
        let total = region_size * num_regions as u32;
        let regions = (0..num_regions)
            .map(|i| Region::new(i as u32 * region_size, region_size))
            .collect();
        RecordLog::mount(regions, RamFlash::new(total as usize)).unwrap()
    }

    fn events(log: &mut EventLog<RamFlash>) -> Vec<(EventType, bool)> {
        let mut seen = Vec::new();
        log.for_each(|e, ok| seen.push((e.event_type, ok)));
        seen
    }

    // E1
    #[test]
    fn blank_medium_gets_a_single_cleared_marker() {
        let flash_log = new_flash_log(0xFF, 2);
        let mut log = EventLog::mount(flash_log, true).unwrap();
        assert_eq!(events(&mut log), vec![(EventType::LogCleared, true)]);
    }

    // E2
    #[test]
    fn n_boot_up_events_read_back_in_order() {
        let flash_log = new_flash_log(0xFF, 2);
        let mut log = EventLog::mount(flash_log, true).unwrap();
        for _ in 0..5 {
            log.add(Event::new(EventType::BootUp)).unwrap();
        }
        let seen = events(&mut log);
        assert_eq!(seen.len(), 6); // marker + 5
        assert_eq!(seen[0].0, EventType::LogCleared);
        assert!(seen[1..].iter().all(|&(t, ok)| t == EventType::BootUp && ok));
    }

    // E3
    #[test]
    fn two_small_regions_overflow_stops_without_clear_on_add() {
        let flash_log = new_flash_log(0x1F, 2);
        let mut log = EventLog::mount(flash_log, true).unwrap();
        log.set_allow_clear_on_add(false);
        let mut added = 0;
        loop {
            let event = Event::new(EventType::BootUp).with_kv("n", "1234");
            match log.add(event) {
                Ok(()) => added += 1,
                Err(Error::NoSpace) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(added > 0);
        let event = Event::new(EventType::BootUp).with_kv("n", "1234");
        match log.add(event) {
            Err(Error::NoSpace) => {}
            other => panic!("expected NoSpace, got {other:?}"),
        }
    }

    // E4
    #[test]
    fn clear_leaves_a_single_cleared_marker() {
        let flash_log = new_flash_log(0xFF, 2);
        let mut log = EventLog::mount(flash_log, true).unwrap();
        for _ in 0..3 {
            log.add(Event::new(EventType::BootUp)).unwrap();
        }
        log.clear().unwrap();
        assert_eq!(events(&mut log), vec![(EventType::LogCleared, true)]);
    }

    #[test]
    fn reclaim_on_add_keeps_accepting_events() {
        let flash_log = new_flash_log(0x3F, 3);
        let mut log = EventLog::mount(flash_log, true).unwrap();
        for i in 0..200u32 {
            let event = Event::new(EventType::BootUp).with_kv("i", i.to_string());
            log.add(event).unwrap();
        }
        let seen = events(&mut log);
        assert!(seen.len() < 201, "reclamation should have dropped some events");
        assert_eq!(seen.last().unwrap().0, EventType::BootUp);
    }

    #[test]
    fn works_without_a_mirror() {
        let flash_log = new_flash_log(0xFF, 2);
        let mut log = EventLog::mount(flash_log, false).unwrap();
        log.add(Event::new(EventType::BootUp).with_kv("reason", "power-on"))
            .unwrap();
        let seen = events(&mut log);
        assert_eq!(
            seen,
            vec![(EventType::LogCleared, true), (EventType::BootUp, true)]
        );
    }

    #[test]
    fn boot_number_and_timestamp_hooks_stamp_unset_fields() {
        let flash_log = new_flash_log(0xFF, 2);
        let mut log = EventLog::mount(flash_log, true).unwrap();
        log.set_boot_number_hook(|| 7);
        log.set_timestamp_hook(|| 1000);
        log.add(Event::new(EventType::BootUp)).unwrap();
        let mut stamped = None;
        log.for_each(|e, _| {
            if e.event_type == EventType::BootUp {
                stamped = Some((e.boot_number, e.timestamp));
            }
        });
        assert_eq!(stamped, Some((Some(7), Some(1000))));
    }

    #[test]
    fn custom_event_type_round_trips() {
        let flash_log = new_flash_log(0xFF, 2);
        let mut log = EventLog::mount(flash_log, true).unwrap();
        log.add(Event::new(EventType::Custom(42)).with_kv("k", "v"))
            .unwrap();
        let mut found = None;
        log.for_each(|e, _| {
            if let EventType::Custom(tag) = e.event_type {
                found = Some((tag, e.data.clone()));
            }
        });
        assert_eq!(found, Some((42, vec![("k".to_string(), "v".to_string())])));
    }
}
