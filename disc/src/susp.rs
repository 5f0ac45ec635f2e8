//! System-Use Sharing Protocol layer (C5): walks the System Use Area
//! trailing a directory record, collecting entries by signature and
//! following CE continuation areas out to other extents.

use std::collections::HashMap;
use std::io::{Read, Seek};

use crate::error::{Error, Result};
use crate::io_util::{self, SharedSource};
use crate::iso9660::{DirectoryRecord, SUSP_MAGIC};

/// Every System Use Entry found in a directory record's System Use Area
/// (and any continuation areas reachable from it), grouped by their
/// 2-byte signature. Entries are retained as raw bytes; Rock Ridge parses
/// the fields it cares about on demand.
#[derive(Debug, Default)]
pub(crate) struct SystemUseArea {
    by_signature: HashMap<[u8; 2], Vec<Vec<u8>>>,
}
impl SystemUseArea {
    /// Scans `record`'s System Use Area per §4.3: skips the SUSP start
    /// magic and the 2-alignment pad byte, then walks tag-length-value
    /// entries, pushing a new logical buffer onto the scan queue whenever
    /// a CE entry points at a continuation area. `max_continuations`
    /// bounds how many CE entries may be followed, guarding against a
    /// malformed image with a cyclic or very long continuation chain.
    pub fn scan<S: Read + Seek>(
        source: &SharedSource<S>,
        record: &DirectoryRecord,
        block_size: u32,
        max_continuations: u32,
    ) -> Result<Self> {
        let mut by_signature: HashMap<[u8; 2], Vec<Vec<u8>>> = HashMap::new();

        let mut initial_offset = 0usize;
        if record.system_use.len() >= SUSP_MAGIC.len() && record.system_use[..SUSP_MAGIC.len()] == SUSP_MAGIC {
            initial_offset += SUSP_MAGIC.len() + 1;
        }
        if record.name_len % 2 == 0 {
            initial_offset += 1;
        }

        let first_block = if initial_offset < record.system_use.len() {
            record.system_use[initial_offset..].to_vec()
        } else {
            Vec::new()
        };

        let mut blocks: Vec<Vec<u8>> = vec![first_block];
        let mut continuations_followed = 0u32;
        let mut block_index = 0usize;

        while block_index < blocks.len() {
            let mut offset = 0usize;
            loop {
                let block = &blocks[block_index];
                if offset >= block.len() || block[offset] == 0 {
                    break;
                }
                if offset + 4 > block.len() {
                    return Err(Error::MalformedDescriptor {
                        reason: "System Use Entry header runs past the end of its buffer".to_string(),
                    });
                }
                let signature = [block[offset], block[offset + 1]];
                let length = block[offset + 2] as usize;
                if length < 4 || offset + length > block.len() {
                    return Err(Error::MalformedDescriptor {
                        reason: "System Use Entry length is out of range".to_string(),
                    });
                }
                let raw = block[offset..offset + length].to_vec();

                if &signature == b"CE" {
                    if continuations_followed >= max_continuations {
                        return Err(Error::MalformedDescriptor {
                            reason: format!("more than {} SUSP continuation areas", max_continuations),
                        });
                    }
                    continuations_followed += 1;
                    if raw.len() < 28 {
                        return Err(Error::MalformedDescriptor {
                            reason: "CE entry shorter than expected".to_string(),
                        });
                    }
                    let extent = u32::from_le_bytes(raw[4..8].try_into().unwrap());
                    let ce_offset = u32::from_le_bytes(raw[12..16].try_into().unwrap());
                    let size = u32::from_le_bytes(raw[20..24].try_into().unwrap());
                    let base = u64::from(extent) * u64::from(block_size) + u64::from(ce_offset);
                    let continuation = io_util::read_to_vec_at(source, base, size as usize)?;
                    blocks.push(continuation);
                }

                by_signature.entry(signature).or_default().push(raw);
                offset += length;
            }
            block_index += 1;
        }

        Ok(Self { by_signature })
    }

    pub fn has(&self, signature: &[u8; 2]) -> bool {
        self.by_signature.contains_key(signature)
    }

    pub fn entries(&self, signature: &[u8; 2]) -> impl Iterator<Item = &Vec<u8>> {
        self.by_signature.get(signature).into_iter().flatten()
    }

    pub fn first(&self, signature: &[u8; 2]) -> Option<&Vec<u8>> {
        self.by_signature.get(signature).and_then(|v| v.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso9660::DirectoryRecordFlags;
    use crate::timestamp::Timestamp;
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    fn record_with_system_use(system_use: Vec<u8>, name_len: usize) -> DirectoryRecord {
        DirectoryRecord {
            ext_attr_length: 0,
            extent: 0,
            size: 0,
            timestamp: Timestamp::from_iso9660_short(&[0, 1, 1, 0, 0, 0, 0]),
            flags: DirectoryRecordFlags::empty(),
            interleave: 0,
            name_len,
            name: "FILE.TXT".to_string(),
            system_use,
        }
    }

    fn px_entry(mode: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 36];
        buf[0] = b'P';
        buf[1] = b'X';
        buf[2] = 36;
        buf[3] = 1;
        buf[4..8].copy_from_slice(&mode.to_le_bytes());
        buf
    }

    #[test]
    fn scan_collects_entries_by_signature() {
        let system_use = px_entry(0o100644);
        let record = record_with_system_use(system_use, 8); // odd name_len -> no extra pad byte
        let source: SharedSource<Cursor<Vec<u8>>> = Rc::new(RefCell::new(Cursor::new(Vec::new())));
        let area = SystemUseArea::scan(&source, &record, 2048, 16).unwrap();
        assert!(area.has(b"PX"));
        assert!(!area.has(b"NM"));
        let raw = area.first(b"PX").unwrap();
        assert_eq!(u32::from_le_bytes(raw[4..8].try_into().unwrap()), 0o100644);
    }

    #[test]
    fn scan_follows_continuation_area() {
        let mut image = vec![0u8; 4096];
        let tail_entry = px_entry(0o100755);
        image[2048..2048 + tail_entry.len()].copy_from_slice(&tail_entry);

        let mut ce = vec![0u8; 28];
        ce[0] = b'C';
        ce[1] = b'E';
        ce[2] = 28;
        ce[3] = 1;
        ce[4..8].copy_from_slice(&1u32.to_le_bytes()); // extent 1 -> byte 2048
        ce[12..16].copy_from_slice(&0u32.to_le_bytes()); // offset 0
        ce[20..24].copy_from_slice(&(tail_entry.len() as u32).to_le_bytes());

        let record = record_with_system_use(ce, 8);
        let source: SharedSource<Cursor<Vec<u8>>> = Rc::new(RefCell::new(Cursor::new(image)));
        let area = SystemUseArea::scan(&source, &record, 2048, 16).unwrap();
        assert!(area.has(b"CE"));
        assert!(area.has(b"PX"));
    }

    #[test]
    fn continuation_cap_is_enforced() {
        let mut ce = vec![0u8; 28];
        ce[0] = b'C';
        ce[1] = b'E';
        ce[2] = 28;
        ce[3] = 1;
        ce[4..8].copy_from_slice(&0u32.to_le_bytes());
        ce[12..16].copy_from_slice(&0u32.to_le_bytes());
        ce[20..24].copy_from_slice(&0u32.to_le_bytes());

        let record = record_with_system_use(ce, 8);
        let source: SharedSource<Cursor<Vec<u8>>> = Rc::new(RefCell::new(Cursor::new(vec![0u8; 2048])));
        let result = SystemUseArea::scan(&source, &record, 2048, 0);
        assert!(result.is_err());
    }
}
