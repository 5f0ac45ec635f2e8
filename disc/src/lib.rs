//! Read-only access to the filesystems commonly found on optical-disc
//! images: ISO 9660, its Joliet supplement, the Rock Ridge extension
//! layered via the System Use Sharing Protocol, and UDF per ECMA-167.
//!
//! Opening a disc probes for each of these independently and then selects
//! one according to a caller preference plus a fixed fallback order
//! (`UDF > ROCKRIDGE > JOLIET > ISO9660`); every subsequent operation is
//! forwarded to the selected reader through one shared [`Entry`] surface.

mod error;
mod io_util;
mod iso9660;
mod rockridge;
mod susp;
mod timestamp;
mod udf;

pub use error::{Error, Result};
pub use timestamp::Timestamp;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Seek};
use std::rc::Rc;

use io_util::SharedSource;


/// One of the four filesystem formats this crate can read.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Format {
    Iso9660,
    Joliet,
    RockRidge,
    Udf,
}
impl Format {
    const DEFAULT_PREFERENCE_ORDER: [Format; 4] = [Format::Udf, Format::RockRidge, Format::Joliet, Format::Iso9660];
}
impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Iso9660 => "ISO9660",
            Self::Joliet => "Joliet",
            Self::RockRidge => "Rockridge",
            Self::Udf => "UDF",
        };
        write!(f, "{}", name)
    }
}

/// Tunable safety caps, per §5/§9: worst-case read amplification on
/// malformed images is bounded rather than unconditionally trusted.
#[derive(Clone, Copy, Debug)]
pub struct OpenOptions {
    max_susp_continuations: u32,
    max_allocation_descriptors: u32,
}
impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            max_susp_continuations: 16,
            max_allocation_descriptors: 1024,
        }
    }
}
impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_susp_continuations(mut self, max: u32) -> Self {
        self.max_susp_continuations = max;
        self
    }

    pub fn with_max_allocation_descriptors(mut self, max: u32) -> Self {
        self.max_allocation_descriptors = max;
        self
    }

    pub(crate) fn max_susp_continuations(&self) -> u32 {
        self.max_susp_continuations
    }

    pub(crate) fn max_allocation_descriptors(&self) -> u32 {
        self.max_allocation_descriptors
    }
}

/// A readable, seekable stream over a range of on-disc bytes. Returned by
/// [`Entry::open`]; the concrete backing storage (a contiguous range, or a
/// concatenation of several UDF extents) is an implementation detail.
pub struct ByteStream(Box<dyn ReadSeek>);
impl ByteStream {
    pub(crate) fn new<T: ReadSeek + 'static>(inner: T) -> Self {
        Self(Box::new(inner))
    }
}
impl Read for ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}
impl Seek for ByteStream {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.0.seek(pos)
    }
}

pub(crate) trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Per-format capability set a concrete reader must provide to the façade.
pub(crate) trait DiscReader<S: Read + Seek> {
    fn format(&self) -> Format;
    fn get(self: Rc<Self>, path: &str) -> Result<Entry<S>>;
    /// Resolves `path` either by the default directory-record traversal or,
    /// when `use_path_table` is set, via the path table (§4.2) where the
    /// underlying format has one. Formats without a path table (Rock Ridge,
    /// UDF) ignore the flag and always traverse.
    fn get_with_options(self: Rc<Self>, path: &str, use_path_table: bool) -> Result<Entry<S>>;
    fn name(&self) -> &str;
    fn publisher(&self) -> &str;
    fn application(&self) -> &str;
}

/// Per-entry capability set every concrete entry (ISO 9660, Rock Ridge,
/// UDF) must provide. Joliet entries reuse the ISO 9660 implementation
/// parameterized by encoding, so there is no separate Joliet variant here.
pub(crate) trait EntryBackend<S: Read + Seek> {
    fn name(&self) -> &str;
    fn is_dir(&self) -> bool;
    fn atime(&self) -> Timestamp;
    fn mtime(&self) -> Timestamp;
    fn ctime(&self) -> Timestamp;
    fn btime(&self) -> Option<Timestamp> { None }
    fn mode(&self) -> u32;
    fn uid(&self) -> u32;
    fn gid(&self) -> u32;
    fn nlinks(&self) -> u32;
    fn inode(&self) -> u64;
    fn size(&self) -> u64;
    fn is_symlink(&self) -> bool;
    fn iterdir(&self) -> Result<Vec<Entry<S>>>;
    fn open(&self) -> Result<ByteStream>;
    fn readlink(&self) -> Result<String>;
    fn parent_path(&self) -> Option<&str>;
}

/// The unified filesystem-entry view handed out by every reader: a
/// directory, a regular file, or a symlink, regardless of which on-disc
/// format it came from.
///
/// `Entry` does not own the disc's byte source, and it does not keep a
/// literal parent pointer alive; [`Entry::parent`] instead re-resolves the
/// parent path against the owning reader, which is the cheapest way to
/// express a non-owning back-reference without an arena.
pub struct Entry<S: Read + Seek> {
    disc_reader: Rc<dyn DiscReader<S>>,
    backend: Box<dyn EntryBackend<S>>,
}
impl<S: Read + Seek> Entry<S> {
    pub(crate) fn new(disc_reader: Rc<dyn DiscReader<S>>, backend: Box<dyn EntryBackend<S>>) -> Self {
        Self { disc_reader, backend }
    }

    pub fn name(&self) -> &str { self.backend.name() }
    pub fn is_dir(&self) -> bool { self.backend.is_dir() }
    pub fn atime(&self) -> Timestamp { self.backend.atime() }
    pub fn mtime(&self) -> Timestamp { self.backend.mtime() }
    pub fn ctime(&self) -> Timestamp { self.backend.ctime() }
    pub fn btime(&self) -> Option<Timestamp> { self.backend.btime() }
    pub fn mode(&self) -> u32 { self.backend.mode() }
    pub fn uid(&self) -> u32 { self.backend.uid() }
    pub fn gid(&self) -> u32 { self.backend.gid() }
    pub fn nlinks(&self) -> u32 { self.backend.nlinks() }
    pub fn inode(&self) -> u64 { self.backend.inode() }
    pub fn size(&self) -> u64 { self.backend.size() }
    pub fn is_symlink(&self) -> bool { self.backend.is_symlink() }

    pub fn iterdir(&self) -> Result<impl Iterator<Item = Result<Entry<S>>>> {
        Ok(self.backend.iterdir()?.into_iter().map(Ok))
    }

    pub fn listdir(&self) -> Result<BTreeMap<String, Entry<S>>> {
        let mut map = BTreeMap::new();
        for entry in self.backend.iterdir()? {
            map.insert(entry.name().to_string(), entry);
        }
        Ok(map)
    }

    pub fn open(&self) -> Result<ByteStream> {
        self.backend.open()
    }

    pub fn readlink(&self) -> Result<String> {
        if !self.is_symlink() {
            return Err(Error::NotASymlink);
        }
        self.backend.readlink()
    }

    /// Re-resolves this entry's parent directory through the owning
    /// reader. Returns `None` for the root.
    pub fn parent(&self) -> Result<Option<Entry<S>>> {
        match self.backend.parent_path() {
            None => Ok(None),
            Some(path) => Ok(Some(Rc::clone(&self.disc_reader).get(path)?)),
        }
    }
}

/// A handle carrying the byte source, every format successfully probed
/// at open time, and the currently selected one.
pub struct Disc<S: Read + Seek> {
    readers: BTreeMap<FormatKey, Rc<dyn DiscReader<S>>>,
    selected: Format,
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct FormatKey(u8);
impl From<Format> for FormatKey {
    fn from(value: Format) -> Self {
        FormatKey(match value {
            Format::Iso9660 => 0,
            Format::Joliet => 1,
            Format::RockRidge => 2,
            Format::Udf => 3,
        })
    }
}

impl<S: Read + Seek + 'static> Disc<S> {
    pub fn selected_format(&self) -> Format {
        self.selected
    }

    fn selected_reader(&self) -> &Rc<dyn DiscReader<S>> {
        self.readers.get(&FormatKey::from(self.selected))
            .expect("invariant: selected format is always present in the reader map")
    }

    pub fn get(&self, path: &str) -> Result<Entry<S>> {
        Rc::clone(self.selected_reader()).get(path)
    }

    /// As [`Disc::get`], but with `use_path_table` selecting the path-table
    /// lookup mode of §4.2 instead of directory-record traversal. Formats
    /// without a path table ignore the flag.
    pub fn get_with_options(&self, path: &str, use_path_table: bool) -> Result<Entry<S>> {
        Rc::clone(self.selected_reader()).get_with_options(path, use_path_table)
    }

    pub fn name(&self) -> &str { self.selected_reader().name() }
    pub fn publisher(&self) -> &str { self.selected_reader().publisher() }
    pub fn application(&self) -> &str { self.selected_reader().application() }
}

/// Opens a disc image, probing for every supported format and selecting
/// one per §4.1's preference/fallback policy. Fails with
/// [`Error::NoCompatibleFilesystem`] if nothing is recognised.
pub fn open<S: Read + Seek + 'static>(source: S, preference: Option<Format>) -> Result<Disc<S>> {
    open_with_options(source, preference, OpenOptions::default())
}

pub fn open_with_options<S: Read + Seek + 'static>(
    source: S,
    preference: Option<Format>,
    options: OpenOptions,
) -> Result<Disc<S>> {
    let source: SharedSource<S> = Rc::new(RefCell::new(source));
    let mut readers: BTreeMap<FormatKey, Rc<dyn DiscReader<S>>> = BTreeMap::new();

    let iso_probe = iso9660::Iso9660Reader::probe(Rc::clone(&source));
    if let Ok(iso_reader) = iso_probe {
        let iso_reader = Rc::new(iso_reader);

        if let Some(joliet_volume) = iso_reader.joliet_volume() {
            let joliet_reader = Rc::new(iso9660::Iso9660Reader::from_joliet(Rc::clone(&source), joliet_volume));
            readers.insert(FormatKey::from(Format::Joliet), joliet_reader);
        }

        match rockridge::RockRidgeReader::probe(Rc::clone(&iso_reader), options) {
            Ok(rr_reader) => {
                readers.insert(FormatKey::from(Format::RockRidge), Rc::new(rr_reader));
            }
            Err(Error::NotRockRidge) => {
                tracing::debug!("Rock Ridge extensions not present on this disc");
            }
            Err(e) => return Err(e),
        }

        readers.insert(FormatKey::from(Format::Iso9660), iso_reader);
    } else if let Err(e) = iso_probe {
        tracing::debug!(error = %e, "ISO 9660 probing failed");
    }

    match udf::UdfReader::probe(Rc::clone(&source), options) {
        Ok(udf_reader) => {
            readers.insert(FormatKey::from(Format::Udf), Rc::new(udf_reader));
        }
        Err(Error::NotUdf) => {
            tracing::debug!("UDF volume descriptors not present on this disc");
        }
        Err(e) => return Err(e),
    }

    if readers.is_empty() {
        return Err(Error::NoCompatibleFilesystem);
    }

    let selected = select_format(&readers, preference)?;

    Ok(Disc { readers, selected })
}

fn select_format<S: Read + Seek>(
    readers: &BTreeMap<FormatKey, Rc<dyn DiscReader<S>>>,
    preference: Option<Format>,
) -> Result<Format> {
    let has = |format: Format| readers.contains_key(&FormatKey::from(format));

    if let Some(preferred) = preference {
        if has(preferred) {
            if preferred == Format::Joliet && has(Format::RockRidge) {
                tracing::warn!("Treating disc as Joliet even though Rockridge is available.");
            } else if preferred != Format::Udf && has(Format::Udf) {
                tracing::warn!("Treating disc as {} even though UDF is available.", preferred);
            }
            return Ok(preferred);
        }
    }

    for &candidate in Format::DEFAULT_PREFERENCE_ORDER.iter() {
        if has(candidate) {
            if let Some(preferred) = preference {
                tracing::warn!("{} format is not available for this disc. Falling back to {}.", preferred, candidate);
            }
            return Ok(candidate);
        }
    }

    Err(Error::SelectionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use tracing_test::{logs_contain, traced_test};

    struct FakeReader(Format);
    impl<S: Read + Seek> DiscReader<S> for FakeReader {
        fn format(&self) -> Format { self.0 }
        fn get(self: Rc<Self>, _path: &str) -> Result<Entry<S>> { unimplemented!("not exercised by this test") }
        fn get_with_options(self: Rc<Self>, _path: &str, _use_path_table: bool) -> Result<Entry<S>> { unimplemented!("not exercised by this test") }
        fn name(&self) -> &str { "" }
        fn publisher(&self) -> &str { "" }
        fn application(&self) -> &str { "" }
    }

    #[traced_test]
    #[test]
    fn select_format_warns_when_falling_back_from_an_unavailable_preference() {
        let mut readers: BTreeMap<FormatKey, Rc<dyn DiscReader<Cursor<Vec<u8>>>>> = BTreeMap::new();
        readers.insert(FormatKey::from(Format::Udf), Rc::new(FakeReader(Format::Udf)));

        let selected = select_format(&readers, Some(Format::Iso9660)).unwrap();

        assert_eq!(selected, Format::Udf);
        assert!(logs_contain("Falling back to UDF"));
    }

    #[test]
    fn format_display_matches_diagnostic_casing() {
        assert_eq!(Format::Iso9660.to_string(), "ISO9660");
        assert_eq!(Format::Joliet.to_string(), "Joliet");
        assert_eq!(Format::RockRidge.to_string(), "Rockridge");
        assert_eq!(Format::Udf.to_string(), "UDF");
    }
}
