use std::cell::RefCell;
use std::io::{self, Read, Seek, SeekFrom};
use std::rc::Rc;


/// A handle to the disc's underlying byte source, shared between the
/// [`crate::Disc`] and every [`crate::Entry`] it hands out. Readers never
/// take ownership of the source; they only ever borrow it through this
/// handle, matching the "entry does not own the byte source" invariant.
pub(crate) type SharedSource<S> = Rc<RefCell<S>>;

pub(crate) fn read_exact_at<S: Read + Seek>(
    source: &SharedSource<S>,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<()> {
    let mut source = source.borrow_mut();
    source.seek(SeekFrom::Start(offset))?;
    source.read_exact(buf)
}

pub(crate) fn read_to_vec_at<S: Read + Seek>(
    source: &SharedSource<S>,
    offset: u64,
    length: usize,
) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; length];
    read_exact_at(source, offset, &mut buf)?;
    Ok(buf)
}

/// A view over `[base_offset, base_offset + length)` of a shared byte
/// source that behaves as an independent, zero-based stream.
///
/// This is the Rust analogue of a range-restricted stream wrapper: every
/// on-disc stretch of bytes handed to a caller (file contents, a SUSP
/// continuation area, a UDF extent) is exposed this way rather than as a
/// raw offset the caller must remember to bound itself.
#[derive(Debug)]
pub struct RangeView<S> {
    source: SharedSource<S>,
    base_offset: u64,
    length: u64,
    position: u64,
}
impl<S: Read + Seek> RangeView<S> {
    pub(crate) fn new(source: SharedSource<S>, base_offset: u64, length: u64) -> Self {
        Self { source, base_offset, length, position: 0 }
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}
impl<S: Read + Seek> Read for RangeView<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.length.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(0);
        }
        let to_read = (buf.len() as u64).min(remaining) as usize;

        let mut source = self.source.borrow_mut();
        source.seek(SeekFrom::Start(self.base_offset + self.position))?;
        let bytes_read = source.read(&mut buf[..to_read])?;
        self.position += bytes_read as u64;
        Ok(bytes_read)
    }
}
impl<S: Read + Seek> Seek for RangeView<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_position: i64 = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => self.position as i64 + delta,
            SeekFrom::End(delta) => self.length as i64 + delta,
        };
        if new_position < 0 {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        self.position = new_position as u64;
        Ok(self.position)
    }
}

/// Concatenates several [`RangeView`]-like extents into one stream, in
/// order, as if they were contiguous. Used for UDF files whose content is
/// split across multiple allocation descriptors.
pub struct ConcatView<S> {
    source: SharedSource<S>,
    extents: Vec<(u64, u64)>,
    total_length: u64,
    position: u64,
}
impl<S: Read + Seek> ConcatView<S> {
    pub(crate) fn new(source: SharedSource<S>, extents: Vec<(u64, u64)>) -> Self {
        let total_length = extents.iter().map(|(_, len)| *len).sum();
        Self { source, extents, total_length, position: 0 }
    }

    pub fn len(&self) -> u64 {
        self.total_length
    }

    pub fn is_empty(&self) -> bool {
        self.total_length == 0
    }
}
impl<S: Read + Seek> Read for ConcatView<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.total_length || buf.is_empty() {
            return Ok(0);
        }

        // find the extent containing the current position
        let mut consumed = 0u64;
        for (extent_offset, extent_length) in &self.extents {
            let extent_end = consumed + extent_length;
            if self.position < extent_end {
                let offset_into_extent = self.position - consumed;
                let remaining_in_extent = extent_end - self.position;
                let to_read = (buf.len() as u64).min(remaining_in_extent) as usize;

                let mut source = self.source.borrow_mut();
                source.seek(SeekFrom::Start(extent_offset + offset_into_extent))?;
                let bytes_read = source.read(&mut buf[..to_read])?;
                drop(source);

                self.position += bytes_read as u64;
                return Ok(bytes_read);
            }
            consumed = extent_end;
        }
        Ok(0)
    }
}
impl<S: Read + Seek> Seek for ConcatView<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_position: i64 = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => self.position as i64 + delta,
            SeekFrom::End(delta) => self.total_length as i64 + delta,
        };
        if new_position < 0 {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        self.position = new_position as u64;
        Ok(self.position)
    }
}

/// A numeric field stored both little-endian and big-endian back to back,
/// as ISO 9660 does for several Primary Volume Descriptor and directory
/// record fields. Readers that need only one side may ignore the other;
/// `matching` asserts on agreement when a spec-faithful implementation
/// cares about catching corruption.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub(crate) struct EndianPair<T> {
    pub little_endian: T,
    pub big_endian: T,
}
impl EndianPair<u16> {
    pub fn read(buf: &[u8]) -> Self {
        Self {
            little_endian: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            big_endian: u16::from_be_bytes(buf[2..4].try_into().unwrap()),
        }
    }
}
impl EndianPair<u32> {
    pub fn read(buf: &[u8]) -> Self {
        Self {
            little_endian: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            big_endian: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}

/// Right-strips trailing ASCII spaces from a fixed-width identifier field.
/// ISO 9660 space-pads `volume_id`/`publisher_id`/`preparer_id`/`application_id`;
/// exposing the stripped form matches observed images more closely than the
/// standard's literal "whole field is significant" reading.
pub(crate) fn rstrip_spaces(buf: &[u8]) -> String {
    let trimmed = buf.iter().rposition(|&b| b != b' ').map(|i| &buf[..=i]).unwrap_or(&[]);
    String::from_utf8_lossy(trimmed).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn range_view_reads_bounded_slice() {
        let data = (0u8..=255).collect::<Vec<u8>>();
        let source: SharedSource<Cursor<Vec<u8>>> = Rc::new(RefCell::new(Cursor::new(data)));
        let mut view = RangeView::new(Rc::clone(&source), 10, 5);
        let mut buf = Vec::new();
        view.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, vec![10, 11, 12, 13, 14]);
    }

    #[test]
    fn concat_view_joins_extents_in_order() {
        let data = (0u8..=255).collect::<Vec<u8>>();
        let source: SharedSource<Cursor<Vec<u8>>> = Rc::new(RefCell::new(Cursor::new(data)));
        let mut view = ConcatView::new(Rc::clone(&source), vec![(100, 4), (10, 3)]);
        let mut buf = Vec::new();
        view.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, vec![100, 101, 102, 103, 10, 11, 12]);
    }

    #[test]
    fn rstrip_spaces_trims_trailing_padding() {
        assert_eq!(rstrip_spaces(b"CDROM                          "), "CDROM");
        assert_eq!(rstrip_spaces(b"                                "), "");
    }
}
