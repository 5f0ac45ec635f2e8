//! Rock Ridge (C6): layers POSIX metadata, long names, symlinks and
//! directory relocation onto an ISO 9660 reader via System Use Entries.
//!
//! References the entries by their two-byte signatures directly (`PX`,
//! `NM`, `SL`, `TF`, `CL`, `RE`) rather than modelling every entry as its
//! own Rust type; only the handful of fields each one contributes are ever
//! decoded.

use std::cell::RefCell;
use std::io::{Read, Seek};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::io_util::RangeView;
use crate::iso9660::{self, DirectoryRecord, Iso9660Reader};
use crate::susp::SystemUseArea;
use crate::timestamp::Timestamp;
use crate::{ByteStream, DiscReader, Entry, EntryBackend, Format, OpenOptions};

const ROCKRIDGE_MAGICS: [&[u8]; 3] = [b"RRIP_1991A", b"IEEE_P1282", b"IEEE_1282"];

fn starts_with_susp_magic(system_use: &[u8]) -> bool {
    system_use.len() >= iso9660::SUSP_MAGIC.len() && system_use[..iso9660::SUSP_MAGIC.len()] == iso9660::SUSP_MAGIC
}

/// The fields this crate cares about from a PX entry.
#[derive(Clone, Copy, Debug)]
struct PosixInfo {
    mode: u32,
    uid: u32,
    gid: u32,
    nlinks: u32,
}

fn parse_px(raw: &[u8]) -> Result<PosixInfo> {
    if raw.len() < 36 {
        return Err(Error::MalformedDescriptor { reason: "PX entry shorter than 36 bytes".to_string() });
    }
    Ok(PosixInfo {
        mode: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
        nlinks: u32::from_le_bytes(raw[12..16].try_into().unwrap()),
        // Per-field mapping corrected relative to the field order found in the
        // wild: PX's uid slot feeds `uid`, its gid slot feeds `gid`.
        uid: u32::from_le_bytes(raw[20..24].try_into().unwrap()),
        gid: u32::from_le_bytes(raw[28..32].try_into().unwrap()),
    })
}

fn resolve_name(raw_record: &DirectoryRecord, area: &SystemUseArea) -> String {
    if !area.has(b"NM") {
        return raw_record.name.clone();
    }
    let mut name = String::new();
    for nm_raw in area.entries(b"NM") {
        if nm_raw.len() < 5 {
            continue;
        }
        name.push_str(&String::from_utf8_lossy(&nm_raw[5..]));
    }
    name
}

/// The seven timestamp slots a TF entry may carry, in the fixed order the
/// protocol declares them; only the ones whose bit is set in the entry's
/// flag byte are actually present in its value buffer.
#[derive(Clone, Copy, Debug, Default)]
struct RockRidgeTimestamps {
    creation: Option<Timestamp>,
    modify: Option<Timestamp>,
    access: Option<Timestamp>,
    attributes: Option<Timestamp>,
}

fn parse_tf(raw: &[u8]) -> Result<RockRidgeTimestamps> {
    if raw.len() < 5 {
        return Err(Error::MalformedDescriptor { reason: "TF entry shorter than 5 bytes".to_string() });
    }
    let flags = raw[4];
    let long_form = flags & 0x80 != 0;
    let chunk_size = if long_form { 17 } else { 7 };

    let mut slots: [Option<Timestamp>; 7] = [None; 7];
    let mut offset = 5usize;
    for (bit, slot) in slots.iter_mut().enumerate() {
        if flags & (1 << bit) == 0 {
            continue;
        }
        if offset + chunk_size > raw.len() {
            return Err(Error::MalformedDescriptor { reason: "TF entry value buffer shorter than its flags imply".to_string() });
        }
        let ts = if long_form {
            Timestamp::from_rockridge_long(&raw[offset..offset + chunk_size])?
        } else {
            Timestamp::from_iso9660_short(raw[offset..offset + 7].try_into().unwrap())
        };
        *slot = Some(ts);
        offset += chunk_size;
    }

    Ok(RockRidgeTimestamps {
        creation: slots[0],
        modify: slots[1],
        access: slots[2],
        attributes: slots[3],
    })
}

fn resolve_symlink(area: &SystemUseArea) -> Result<String> {
    let mut target = String::new();
    for sl_raw in area.entries(b"SL") {
        if sl_raw.len() < 5 {
            continue;
        }
        let components = &sl_raw[5..];
        let mut offset = 0usize;
        while offset < components.len() {
            if offset + 2 > components.len() {
                return Err(Error::MalformedDescriptor { reason: "SL component header runs past its entry".to_string() });
            }
            let flags = components[offset];
            let len = components[offset + 1] as usize;
            if offset + 2 + len > components.len() {
                return Err(Error::MalformedDescriptor { reason: "SL component content runs past its entry".to_string() });
            }
            let content = &components[offset + 2..offset + 2 + len];
            offset += 2 + len;

            let is_continue = flags & 0x01 != 0;
            let is_current = flags & 0x02 != 0;
            let is_parent = flags & 0x04 != 0;
            let is_root = flags & 0x08 != 0;

            if is_parent {
                target.push_str("../");
                continue;
            }
            if is_root {
                target = format!("/{}", target);
                continue;
            }
            if is_current {
                target.push_str("./");
                continue;
            }
            target.push_str(&String::from_utf8_lossy(content));
            if offset < components.len() && !is_continue {
                target.push('/');
            }
        }
    }
    Ok(target)
}

struct ResolvedRecord {
    display_name: String,
    record: DirectoryRecord,
    area: SystemUseArea,
}

/// A Rock Ridge reader layered over an already-probed [`Iso9660Reader`].
pub(crate) struct RockRidgeReader<S> {
    iso: Rc<Iso9660Reader<S>>,
    options: OpenOptions,
}
impl<S: Read + Seek + 'static> RockRidgeReader<S> {
    /// Detects Rock Ridge per §4.4: the root directory's own "." record
    /// must start its System Use Area with the SUSP start magic, and carry
    /// an Extensions Reference entry naming a recognised Rock Ridge
    /// identifier.
    pub fn probe(iso: Rc<Iso9660Reader<S>>, options: OpenOptions) -> Result<Self> {
        let root_entries = iso.iterdir_raw(iso.root_record())?;
        let dot_record = root_entries.into_iter().next().ok_or(Error::NotRockRidge)?;

        if !starts_with_susp_magic(&dot_record.system_use) {
            return Err(Error::NotRockRidge);
        }

        let area = SystemUseArea::scan(iso.source(), &dot_record, iso.block_size(), options.max_susp_continuations())?;
        let er_raw = area.first(b"ER").ok_or(Error::NotRockRidge)?;
        if er_raw.len() < 8 {
            return Err(Error::NotRockRidge);
        }
        let len_id = er_raw[4] as usize;
        if er_raw.len() < 8 + len_id {
            return Err(Error::NotRockRidge);
        }
        let identifier = &er_raw[8..8 + len_id];
        if !ROCKRIDGE_MAGICS.contains(&identifier) {
            let seen: display_bytes::DisplayBytesSlice = identifier.into();
            tracing::debug!(identifier = %seen, "SUSP-compliant disc found, but its ER identifier is not a known Rock Ridge extension");
            return Err(Error::NotRockRidge);
        }

        Ok(Self { iso, options })
    }

    /// Scans `raw`'s System Use Area, determines its displayed name, and
    /// follows a CL relocation entry if present. The displayed name is
    /// computed before relocation, matching where NM is actually recorded.
    fn resolve(&self, raw: DirectoryRecord) -> Result<ResolvedRecord> {
        let area = SystemUseArea::scan(self.iso.source(), &raw, self.iso.block_size(), self.options.max_susp_continuations())?;
        let display_name = resolve_name(&raw, &area);

        if let Some(cl_raw) = area.first(b"CL") {
            if cl_raw.len() < 8 {
                return Err(Error::MalformedDescriptor { reason: "CL entry shorter than 8 bytes".to_string() });
            }
            let location = u32::from_le_bytes(cl_raw[4..8].try_into().unwrap());
            let relocated = self.iso.read_directory_record_at_extent(location)?;
            let relocated_area = SystemUseArea::scan(self.iso.source(), &relocated, self.iso.block_size(), self.options.max_susp_continuations())?;
            return Ok(ResolvedRecord { display_name, record: relocated, area: relocated_area });
        }

        Ok(ResolvedRecord { display_name, record: raw, area })
    }

    /// Lists `record`'s children, applying Rock Ridge naming and dropping
    /// `.`/`..` and RE relocation placeholders.
    fn children(&self, record: &DirectoryRecord) -> Result<Vec<ResolvedRecord>> {
        let raw_children = self.iso.iterdir_raw(record)?;
        let mut out = Vec::with_capacity(raw_children.len());
        for raw in raw_children {
            if raw.name == "." || raw.name == ".." {
                continue;
            }
            let resolved = self.resolve(raw)?;
            if resolved.area.has(b"RE") {
                continue;
            }
            out.push(resolved);
        }
        Ok(out)
    }

    fn resolve_path(&self, normalized: &str) -> Result<ResolvedRecord> {
        let mut current = self.resolve(self.iso.root_record().clone())?;
        if normalized == "/" {
            return Ok(current);
        }
        for component in normalized.trim_start_matches('/').split('/') {
            let children = self.children(&current.record)?;
            current = children.into_iter().find(|c| c.display_name == component)
                .ok_or_else(|| Error::PathNotFound(normalized.to_string()))?;
        }
        Ok(current)
    }

    fn wrap_entry(self: &Rc<Self>, resolved: ResolvedRecord, path: String, parent_path: Option<String>) -> Entry<S> {
        Entry::new(
            Rc::clone(self) as Rc<dyn DiscReader<S>>,
            Box::new(RockRidgeEntryHandle {
                reader: Rc::clone(self),
                name: resolved.display_name,
                record: resolved.record,
                area: resolved.area,
                path,
                parent_path,
                posix: RefCell::new(None),
                timestamps: RefCell::new(None),
                symlink: RefCell::new(None),
            }),
        )
    }
}
impl<S: Read + Seek + 'static> DiscReader<S> for RockRidgeReader<S> {
    fn format(&self) -> Format {
        Format::RockRidge
    }

    fn get(self: Rc<Self>, path: &str) -> Result<Entry<S>> {
        let normalized = iso9660::normalize_path(path);
        let resolved = self.resolve_path(&normalized)?;
        let parent_path = iso9660::parent_of(&normalized);
        Ok(self.wrap_entry(resolved, normalized, parent_path))
    }

    /// Rock Ridge has no path table of its own; `use_path_table` is N/A
    /// here and resolution always traverses directory records.
    fn get_with_options(self: Rc<Self>, path: &str, _use_path_table: bool) -> Result<Entry<S>> {
        DiscReader::get(self, path)
    }

    fn name(&self) -> &str { self.iso.name() }
    fn publisher(&self) -> &str { self.iso.publisher() }
    fn application(&self) -> &str { self.iso.application() }
}

struct RockRidgeEntryHandle<S> {
    reader: Rc<RockRidgeReader<S>>,
    name: String,
    record: DirectoryRecord,
    area: SystemUseArea,
    path: String,
    parent_path: Option<String>,
    posix: RefCell<Option<Option<PosixInfo>>>,
    timestamps: RefCell<Option<RockRidgeTimestamps>>,
    symlink: RefCell<Option<String>>,
}
impl<S: Read + Seek + 'static> RockRidgeEntryHandle<S> {
    fn posix(&self) -> Result<Option<PosixInfo>> {
        if let Some(cached) = *self.posix.borrow() {
            return Ok(cached);
        }
        let info = match self.area.first(b"PX") {
            Some(raw) => Some(parse_px(raw)?),
            None => None,
        };
        *self.posix.borrow_mut() = Some(info);
        Ok(info)
    }

    fn timestamps(&self) -> Result<RockRidgeTimestamps> {
        if let Some(cached) = *self.timestamps.borrow() {
            return Ok(cached);
        }
        let ts = match self.area.first(b"TF") {
            Some(raw) => parse_tf(raw)?,
            None => RockRidgeTimestamps::default(),
        };
        *self.timestamps.borrow_mut() = Some(ts);
        Ok(ts)
    }

    fn symlink_target(&self) -> Result<String> {
        if let Some(cached) = self.symlink.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let target = resolve_symlink(&self.area)?;
        *self.symlink.borrow_mut() = Some(target.clone());
        Ok(target)
    }

    fn posix_or_warn(&self) -> Option<PosixInfo> {
        self.posix().unwrap_or_else(|e| {
            tracing::warn!(path = %self.path, error = %e, "malformed PX entry; falling back to default POSIX attributes");
            None
        })
    }

    fn timestamps_or_warn(&self) -> RockRidgeTimestamps {
        self.timestamps().unwrap_or_else(|e| {
            tracing::warn!(path = %self.path, error = %e, "malformed TF entry; falling back to ISO 9660 base timestamp");
            RockRidgeTimestamps::default()
        })
    }
}
impl<S: Read + Seek + 'static> EntryBackend<S> for RockRidgeEntryHandle<S> {
    fn name(&self) -> &str { &self.name }
    fn is_dir(&self) -> bool { self.record.is_dir() }

    fn atime(&self) -> Timestamp {
        self.timestamps_or_warn().access.unwrap_or(self.record.timestamp)
    }
    fn mtime(&self) -> Timestamp {
        self.timestamps_or_warn().modify.unwrap_or(self.record.timestamp)
    }
    fn ctime(&self) -> Timestamp {
        self.timestamps_or_warn().attributes.unwrap_or(self.record.timestamp)
    }
    fn btime(&self) -> Option<Timestamp> {
        self.timestamps_or_warn().creation
    }

    fn mode(&self) -> u32 {
        self.posix_or_warn().map(|px| px.mode).unwrap_or(0o644)
    }
    fn uid(&self) -> u32 {
        self.posix_or_warn().map(|px| px.uid).unwrap_or(0)
    }
    fn gid(&self) -> u32 {
        self.posix_or_warn().map(|px| px.gid).unwrap_or(0)
    }
    fn nlinks(&self) -> u32 {
        self.posix_or_warn().map(|px| px.nlinks).unwrap_or(1)
    }
    // Rock Ridge reserves no inode/serial-number field in any widely
    // deployed implementation, so this is always zero.
    fn inode(&self) -> u64 { 0 }
    fn size(&self) -> u64 { u64::from(self.record.size) }
    fn is_symlink(&self) -> bool { self.area.has(b"SL") }

    fn iterdir(&self) -> Result<Vec<Entry<S>>> {
        let children = self.reader.children(&self.record)?;
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            let child_path = if self.path == "/" { format!("/{}", child.display_name) } else { format!("{}/{}", self.path, child.display_name) };
            out.push(self.reader.wrap_entry(child, child_path, Some(self.path.clone())));
        }
        Ok(out)
    }

    fn open(&self) -> Result<ByteStream> {
        if self.is_dir() {
            return Err(Error::NotAFile);
        }
        if self.record.interleave != 0 {
            return Err(Error::InterleavedNotSupported);
        }
        let offset = u64::from(self.record.extent) * u64::from(self.reader.iso.block_size());
        let view = RangeView::new(Rc::clone(self.reader.iso.source()), offset, u64::from(self.record.size));
        Ok(ByteStream::new(view))
    }

    fn readlink(&self) -> Result<String> {
        if !self.is_symlink() {
            return Err(Error::NotASymlink);
        }
        self.symlink_target()
    }

    fn parent_path(&self) -> Option<&str> { self.parent_path.as_deref() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso9660::DirectoryRecordFlags;
    use std::cell::RefCell as StdRefCell;
    use std::io::Cursor;

    fn px_entry(mode: u32, uid: u32, gid: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 36];
        buf[0] = b'P';
        buf[1] = b'X';
        buf[2] = 36;
        buf[3] = 1;
        buf[4..8].copy_from_slice(&mode.to_le_bytes());
        buf[20..24].copy_from_slice(&uid.to_le_bytes());
        buf[28..32].copy_from_slice(&gid.to_le_bytes());
        buf
    }

    fn nm_entry(name: &str) -> Vec<u8> {
        let mut buf = vec![0u8; 5 + name.len()];
        buf[0] = b'N';
        buf[1] = b'M';
        buf[2] = buf.len() as u8;
        buf[3] = 1;
        buf[5..].copy_from_slice(name.as_bytes());
        buf
    }

    fn fake_record(system_use: Vec<u8>) -> DirectoryRecord {
        DirectoryRecord {
            ext_attr_length: 0,
            extent: 5,
            size: 0,
            timestamp: Timestamp::from_iso9660_short(&[0, 1, 1, 0, 0, 0, 0]),
            flags: DirectoryRecordFlags::empty(),
            interleave: 0,
            name_len: 7, // odd, so SystemUseArea::scan does not expect a pad byte
            name: "FILE.TXT".to_string(),
            system_use,
        }
    }

    #[test]
    fn parse_px_maps_uid_gid_without_swap() {
        let raw = px_entry(0o100755, 1000, 2000);
        let info = parse_px(&raw).unwrap();
        assert_eq!(info.mode, 0o100755);
        assert_eq!(info.uid, 1000);
        assert_eq!(info.gid, 2000);
    }

    #[test]
    fn resolve_name_concatenates_multiple_nm_entries() {
        let mut system_use = nm_entry("a_very_long_file");
        system_use.extend_from_slice(&nm_entry("name.txt"));
        let record = fake_record(system_use);
        let source: crate::io_util::SharedSource<Cursor<Vec<u8>>> = Rc::new(StdRefCell::new(Cursor::new(Vec::new())));
        let area = SystemUseArea::scan(&source, &record, 2048, 16).unwrap();
        assert_eq!(resolve_name(&record, &area), "a_very_long_filename.txt");
    }

    #[test]
    fn resolve_symlink_inserts_separators_within_an_entry_but_not_across() {
        let mut components = Vec::new();
        components.push(0u8); // flags: not continue
        components.push(3);
        components.extend_from_slice(b"usr");
        components.push(0u8);
        components.push(5);
        components.extend_from_slice(b"local");

        let mut sl_entry_one = vec![b'S', b'L', (5 + components.len()) as u8, 1, 0];
        sl_entry_one.extend_from_slice(&components);

        let mut sl_entry_two = vec![b'S', b'L', 5 + 5, 1, 0];
        sl_entry_two.push(0u8);
        sl_entry_two.push(3);
        sl_entry_two.extend_from_slice(b"bin");

        let mut system_use = sl_entry_one;
        system_use.extend_from_slice(&sl_entry_two);
        let record = fake_record(system_use);
        let source: crate::io_util::SharedSource<Cursor<Vec<u8>>> = Rc::new(StdRefCell::new(Cursor::new(Vec::new())));
        let area = SystemUseArea::scan(&source, &record, 2048, 16).unwrap();
        // No trailing separator is added between the two SL entries themselves.
        assert_eq!(resolve_symlink(&area).unwrap(), "usr/localbin");
    }

    #[test]
    fn parse_tf_decodes_short_form_in_flag_order() {
        let mut raw = vec![b'T', b'F', 0, 1, 0b0000_0110]; // MODIFY + ACCESS
        raw.extend_from_slice(&[124, 3, 8, 17, 44, 8, 4]); // modify
        raw.extend_from_slice(&[124, 3, 9, 10, 0, 0, 0]); // access
        raw[2] = raw.len() as u8;
        let ts = parse_tf(&raw).unwrap();
        assert!(ts.creation.is_none());
        assert_eq!(ts.modify.unwrap().day, 8);
        assert_eq!(ts.access.unwrap().day, 9);
    }
}
