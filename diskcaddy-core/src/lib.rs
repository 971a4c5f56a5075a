mod client;
pub mod crc32;
pub mod zip;

pub use client::{DeviceClient, DeviceError, DiskList, DiskRef, Hello};
pub use zip::{
    DosDateTime, ZipEntry, ZipError, build_archive, build_archive_at, capture_local_offset,
    read_entries,
};
