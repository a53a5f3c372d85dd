//! The log-structured record layer: framed records densely packed across a
//! circular ring of erase-block regions. This is the hard part — mount,
//! append, sequential read, free-space accounting, and reclamation — and
//! everything else in the crate (`kv`, `eventlog`) is built as a consumer
//! of `RecordLog`.

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::flash::Flash;
use crate::region::{
    checksum_ok, decode_record_length, decode_region_header, encode_record_header,
    encode_region_header, is_sentinel_length, Region, RECORD_HEADER_SIZE, REGION_HEADER_SIZE,
};

/// Outcome of a single `read_record` call, beyond the advancing cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// No more records from this cursor onward.
    EndOfLog,
    /// Framing-only scan (no buffer requested): a record is present with
    /// this many payload bytes, but it was not read.
    Framing { len: usize },
    /// The caller's buffer was smaller than the payload; `needed` is the
    /// actual payload length so the caller can retry with a bigger buffer.
    NoSpace { needed: usize },
    /// Payload read and checksum verified.
    Ok(Vec<u8>),
    /// Payload read, but the header+payload checksum did not sum to zero.
    /// The (possibly corrupt) bytes are still delivered.
    Checksum(Vec<u8>),
}

/// Log-structured record store over `N` circular erase-block regions.
pub struct RecordLog<F: Flash> {
    flash: F,
    regions: Vec<Region>,
    head_region: usize,
    used_regions: usize,
    next_sequence: u32,
}

impl<F: Flash> RecordLog<F> {
    /// Mounts the record layer over `regions`. Each region's header is read
    /// and either accepted or re-created; `regions` is copied in, the
    /// caller retains no alias to it.
    pub fn mount(regions: Vec<Region>, flash: F) -> Result<Self> {
        if regions.is_empty() {
            return Err(Error::invalid("mount requires at least one region"));
        }
        let mut log = Self {
            flash,
            regions,
            head_region: 0,
            used_regions: 1,
            next_sequence: 0,
        };
        log.mount_regions();
        Ok(log)
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn used_regions(&self) -> usize {
        self.used_regions
    }

    pub fn head_region(&self) -> usize {
        self.head_region
    }

    pub fn region(&self, i: usize) -> Region {
        self.regions[self.region_at(i)]
    }

    fn region_at(&self, i: usize) -> usize {
        (self.head_region + i) % self.regions.len()
    }

    fn mount_regions(&mut self) {
        for i in 0..self.regions.len() {
            if let Err(e) = self.region_init(i) {
                warn!("region {i} init failure, ignoring region: {e}");
                let offset = self.regions[i].offset;
                self.regions[i] = Region::poisoned(offset);
            }
        }
        self.select_head_region();
        self.select_used_regions();
        debug!(
            "mount: num_regions={} used_regions={} head_region={} next_sequence={}",
            self.regions.len(),
            self.used_regions,
            self.head_region,
            self.next_sequence
        );
    }

    fn region_init(&mut self, idx: usize) -> Result<()> {
        let region = self.regions[idx];
        let mut header = [0u8; REGION_HEADER_SIZE];
        let read = self.flash.read(region.offset, &mut header);
        let sequence = match read {
            Ok(n) if n == REGION_HEADER_SIZE => decode_region_header(&header),
            _ => None,
        };
        let sequence = match sequence {
            Some(s) => s,
            None => {
                debug!("region {idx} has no valid header, re-creating");
                let seq = self.next_sequence;
                self.next_sequence += 1;
                return self.region_create(idx, seq);
            }
        };
        if sequence >= self.next_sequence {
            self.next_sequence = sequence + 1;
        }
        self.regions[idx].sequence = sequence;
        self.regions[idx].used_size = self.region_used_size(idx);
        Ok(())
    }

    /// Selects the head region as the one with the smallest sequence
    /// number, ignoring regions poisoned during mount. Ties favor the
    /// lower index.
    fn select_head_region(&mut self) {
        let mut min_sequence = u32::MAX;
        let mut min_idx = 0;
        for (i, region) in self.regions.iter().enumerate() {
            if region.is_poisoned() {
                continue;
            }
            if region.sequence < min_sequence {
                min_sequence = region.sequence;
                min_idx = i;
            }
        }
        self.head_region = min_idx;
    }

    fn select_used_regions(&mut self) {
        let mut used = 0usize;
        for i in 0..self.regions.len() {
            let region = self.region(i);
            if region.used_size > REGION_HEADER_SIZE as u32 {
                used += 1;
            } else {
                break;
            }
        }
        self.used_regions = used.max(1);
    }

    /// Erases and writes a fresh region header, discarding any content.
    fn region_create(&mut self, idx: usize, sequence: u32) -> Result<()> {
        let region = self.regions[idx];
        self.flash.erase(region.offset, region.size)?;
        if (region.size as usize) < REGION_HEADER_SIZE {
            warn!("region {idx} too small for a header, marking unusable");
            self.regions[idx] = Region::poisoned(region.offset);
            return Err(Error::NoSpace);
        }
        let header = encode_region_header(sequence);
        let n = self.flash.write(region.offset, &header)?;
        if n != header.len() {
            return Err(short_write("region header"));
        }
        self.regions[idx].used_size = REGION_HEADER_SIZE as u32;
        self.regions[idx].sequence = sequence;
        Ok(())
    }

    /// Recovers `used_size` by scanning records from the region start,
    /// summing framed lengths until a sentinel or out-of-bounds length.
    /// Does not verify checksums — a corrupt payload still contributes its
    /// framed length.
    fn region_used_size(&mut self, idx: usize) -> u32 {
        let mut offset = REGION_HEADER_SIZE as u32;
        loop {
            match self.region_read_record(idx, offset, None) {
                Ok((0, _)) => break,
                Ok((delta, _)) => offset += delta,
                Err(_) => break,
            }
        }
        offset
    }

    /// Reads the record starting at `offset_in_region` (already past the
    /// region header). Returns the framed record length (0 at end of
    /// region) and the outcome. `max_len`: `None` means framing-only (no
    /// payload read, no buffer-size check); `Some(cap)` bounds the payload
    /// buffer.
    fn region_read_record(
        &mut self,
        idx: usize,
        offset_in_region: u32,
        max_len: Option<usize>,
    ) -> Result<(u32, ReadOutcome)> {
        let region = self.regions[idx];
        let max_offset = region.size.saturating_sub(RECORD_HEADER_SIZE as u32);
        if offset_in_region > max_offset {
            return Err(Error::invalid("record offset beyond region bounds"));
        }

        let mut header = [0u8; RECORD_HEADER_SIZE];
        let n = self
            .flash
            .read(region.offset + offset_in_region, &mut header)?;
        if n != RECORD_HEADER_SIZE {
            return Err(short_read("record header"));
        }

        let length = decode_record_length(&header);
        if is_sentinel_length(length) {
            return Ok((0, ReadOutcome::EndOfLog));
        }

        if length as u32 > region.size - offset_in_region {
            return Err(Error::invalid(format!(
                "bad record length {length} at region offset {offset_in_region}"
            )));
        }

        let data_len = length as usize - RECORD_HEADER_SIZE;
        let delta = length as u32;

        match max_len {
            None => Ok((delta, ReadOutcome::Framing { len: data_len })),
            Some(cap) if data_len > cap => Ok((delta, ReadOutcome::NoSpace { needed: data_len })),
            Some(_) => {
                let mut payload = vec![0u8; data_len];
                let got = self.flash.read(
                    region.offset + offset_in_region + RECORD_HEADER_SIZE as u32,
                    &mut payload,
                )?;
                if got != data_len {
                    return Err(short_read("record payload"));
                }
                if checksum_ok(&header, &payload) {
                    Ok((delta, ReadOutcome::Ok(payload)))
                } else {
                    warn!("checksum mismatch at region {idx} offset {offset_in_region}");
                    Ok((delta, ReadOutcome::Checksum(payload)))
                }
            }
        }
    }

    /// Reads the record at logical `cursor`, returning the cursor to pass
    /// for the next call and the outcome. `max_len` bounds the payload
    /// buffer; pass `None` for a framing-only scan.
    pub fn read_record(&mut self, cursor: u32, max_len: Option<usize>) -> Result<(u32, ReadOutcome)> {
        let mut offset = cursor;
        let mut found = None;
        let mut last_idx = 0;

        for i in 0..self.used_regions {
            offset += REGION_HEADER_SIZE as u32;
            let idx = self.region_at(i);
            last_idx = idx;
            let region = self.regions[idx];
            if offset < region.used_size {
                found = Some(idx);
                break;
            }
            offset -= region.used_size;
        }

        let idx = match found {
            Some(idx) => idx,
            None => {
                // Reproduces the original's "one past end" check: it
                // reuses the final region visited by the loop above, even
                // though the loop ran past `used_regions`.
                let region = self.regions[last_idx];
                if offset == 0 || offset == region.used_size {
                    return Ok((0, ReadOutcome::EndOfLog));
                }
                return Err(Error::invalid("cursor past end of log"));
            }
        };

        let (delta, outcome) = self.region_read_record(idx, offset, max_len)?;
        let next_cursor = match outcome {
            ReadOutcome::EndOfLog => 0,
            _ => cursor + delta,
        };
        Ok((next_cursor, outcome))
    }

    /// Counts records that read back without a checksum or framing error.
    /// A convenience built on [`read_record`](Self::read_record); stops
    /// (without erroring) at the first unreadable record.
    pub fn num_valid_records(&mut self) -> usize {
        let mut cursor = 0u32;
        let mut count = 0usize;
        loop {
            match self.read_record(cursor, Some(usize::MAX)) {
                Ok((_, ReadOutcome::EndOfLog)) => break,
                Ok((next, ReadOutcome::Ok(_))) => {
                    count += 1;
                    cursor = next;
                }
                Ok((next, _)) => cursor = next,
                Err(_) => break,
            }
        }
        count
    }

    /// Appends `payload` to the tail region, bringing a fresh region into
    /// use if the current tail has no room. Returns the total bytes
    /// written (header + payload).
    pub fn append(&mut self, payload: &[u8]) -> Result<usize> {
        let record_size = (RECORD_HEADER_SIZE + payload.len()) as u32;
        let mut tail_idx = self.region_at(self.used_regions - 1);

        if record_size > self.regions[tail_idx].free_bytes() {
            if self.used_regions < self.regions.len() {
                self.used_regions += 1;
                tail_idx = self.region_at(self.used_regions - 1);
            } else {
                warn!("log full: {} used regions, tail has {} free", self.used_regions, self.regions[tail_idx].free_bytes());
                return Err(Error::NoSpace);
            }
        }

        self.region_append(tail_idx, payload)
    }

    fn region_append(&mut self, idx: usize, payload: &[u8]) -> Result<usize> {
        let region = self.regions[idx];
        let record_size = (RECORD_HEADER_SIZE + payload.len()) as u32;
        if record_size > region.free_bytes() {
            warn!("region {idx} full, record needs {record_size} bytes, {} free", region.free_bytes());
            return Err(Error::NoSpace);
        }

        let header = encode_record_header(payload);
        let off = region.offset + region.used_size;
        let n = self.flash.write(off, &header)?;
        if n != header.len() {
            return Err(short_write("record header"));
        }
        let n2 = self
            .flash
            .write(off + RECORD_HEADER_SIZE as u32, payload)?;
        if n2 != payload.len() {
            return Err(short_write("record payload"));
        }

        self.regions[idx].used_size += record_size;
        Ok(record_size as usize)
    }

    /// Sum of free bytes across the tail region and any not-yet-used
    /// region beyond it, minus one record header's worth of overhead.
    /// Clamped to zero.
    pub fn free_space(&self) -> u32 {
        let mut free = 0u32;
        for i in (self.used_regions - 1)..self.regions.len() {
            let idx = self.region_at(i);
            free += self.regions[idx].free_bytes();
        }
        free.saturating_sub(RECORD_HEADER_SIZE as u32)
    }

    /// Clears the oldest `k` regions (all of them if `k == 0` or
    /// `k > num_regions`), erasing and re-creating each with a fresh,
    /// higher sequence number. Returns the total bytes freed.
    pub fn clear(&mut self, k: usize) -> Result<u32> {
        let num_to_clear = if k == 0 || k > self.regions.len() {
            self.regions.len()
        } else {
            k
        };

        let mut freed = 0u32;
        for i in 0..num_to_clear {
            let idx = self.region_at(i);
            let region = self.regions[idx];
            freed += region.size;
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            self.region_create(idx, sequence)?;
            debug!("region {idx} cleared, new sequence {sequence}");
        }

        self.head_region = (self.head_region + num_to_clear) % self.regions.len();
        self.used_regions = self.used_regions.saturating_sub(num_to_clear).max(1);
        Ok(freed)
    }
}

fn short_read(what: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("short read of {what}"),
    ))
}

fn short_write(what: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::WriteZero,
        format!("short write of {what}"),
    ))
}
