use std::fmt;

use crate::Format;


/// Error conditions surfaced by this crate's readers and its façade.
///
/// Probing failures (`NotUdf`, `NotRockRidge`) are caught internally by
/// [`crate::open`] and used only to decide which formats get registered;
/// everything else propagates to the caller once a format has been selected.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),

    NotUdf,
    NotRockRidge,
    NoPrimaryVolume,
    NoCompatibleFilesystem,
    InvalidVolumeDescriptorId,

    PathNotFound(String),
    NotADirectory,
    NotAFile,
    NotASymlink,

    UnsupportedExtendedAttributes,
    UnsupportedAllocationType,
    InterleavedNotSupported,
    UnsupportedMultiplePartitions,
    SparableRemapUnsupported,
    VirtualPartitionUnsupported,
    MetadataPartitionUnsupported,
    UnknownPartitionType { partition_map_type: u8 },

    MalformedDescriptor { reason: String },
    UnexpectedIcb { tag_identifier: u16 },
    BadEncoding,

    SelectionFailed,
    FormatNotAvailable { preferred: Format },
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e)
                => write!(f, "I/O error: {}", e),
            Self::NotUdf
                => write!(f, "not a UDF volume"),
            Self::NotRockRidge
                => write!(f, "Rock Ridge extensions not present"),
            Self::NoPrimaryVolume
                => write!(f, "no Primary Volume Descriptor found"),
            Self::NoCompatibleFilesystem
                => write!(f, "no compatible filesystem found on disc"),
            Self::InvalidVolumeDescriptorId
                => write!(f, "volume descriptor identifier is not \"CD001\""),
            Self::PathNotFound(path)
                => write!(f, "path not found: {}", path),
            Self::NotADirectory
                => write!(f, "entry is not a directory"),
            Self::NotAFile
                => write!(f, "entry is not a file"),
            Self::NotASymlink
                => write!(f, "entry is not a symbolic link"),
            Self::UnsupportedExtendedAttributes
                => write!(f, "directory records with extended attributes are not supported"),
            Self::UnsupportedAllocationType
                => write!(f, "extended allocation descriptors are not supported"),
            Self::InterleavedNotSupported
                => write!(f, "interleaved file extents are not supported"),
            Self::UnsupportedMultiplePartitions
                => write!(f, "multi-partition UDF volumes are not supported"),
            Self::SparableRemapUnsupported
                => write!(f, "reads through a UDF Sparable Partition remap table are not supported"),
            Self::VirtualPartitionUnsupported
                => write!(f, "UDF Virtual Partition reads are not supported"),
            Self::MetadataPartitionUnsupported
                => write!(f, "UDF Metadata Partition reads are not supported"),
            Self::UnknownPartitionType { partition_map_type }
                => write!(f, "unknown UDF partition map type {}", partition_map_type),
            Self::MalformedDescriptor { reason }
                => write!(f, "malformed descriptor: {}", reason),
            Self::UnexpectedIcb { tag_identifier }
                => write!(f, "unexpected ICB tag identifier {:#06x}", tag_identifier),
            Self::BadEncoding
                => write!(f, "could not decode string with the expected encoding"),
            Self::SelectionFailed
                => write!(f, "could not select a format for this disc"),
            Self::FormatNotAvailable { preferred }
                => write!(f, "{:?} format is not available for this disc", preferred),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}
impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self { Self::Io(value) }
}

pub type Result<T> = std::result::Result<T, Error>;
