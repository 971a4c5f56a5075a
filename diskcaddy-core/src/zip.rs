use std::io::Read;
use std::sync::OnceLock;

use flate2::read::DeflateDecoder;
use thiserror::Error;
use time::{OffsetDateTime, UtcOffset};

use crate::crc32::checksum;

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;

const LOCAL_HEADER_LEN: usize = 30;
const CENTRAL_HEADER_LEN: usize = 46;
const END_OF_CENTRAL_DIRECTORY_LEN: usize = 22;
const MAX_COMMENT_LEN: usize = u16::MAX as usize;

const ZIP_VERSION: u16 = 20;
const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

// Upper bound for trusting the declared uncompressed size as a capacity hint.
const MAX_PREALLOC: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ZipError {
    #[error("end of central directory record not found")]
    MissingEndOfCentralDirectory,
    #[error("archive lists {0} entries but none could be read")]
    NoReadableEntries(usize),
    #[error("failed to inflate {name}: {source}")]
    Inflate {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("archive cannot hold more than {} entries", u16::MAX)]
    TooManyEntries,
    #[error("entry {0} does not fit 32-bit ZIP fields")]
    EntryTooLarge(String),
    #[error("archive exceeds 32-bit ZIP offsets")]
    ArchiveTooLarge,
}

impl ZipError {
    /// True for errors caused by a malformed input archive rather than by
    /// limits hit while building one.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            ZipError::MissingEndOfCentralDirectory
                | ZipError::NoReadableEntries(_)
                | ZipError::Inflate { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipEntry {
    pub name: String,
    pub data: Vec<u8>,
}

impl ZipEntry {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

#[derive(Debug)]
struct CentralRecord {
    name: String,
    method: u16,
    compressed_size: usize,
    uncompressed_size: usize,
    local_offset: usize,
}

/// Parses every stored or deflated entry of `bytes`, in central directory order.
pub fn read_entries(bytes: &[u8]) -> Result<Vec<ZipEntry>, ZipError> {
    let eocd = find_end_of_central_directory(bytes)
        .ok_or(ZipError::MissingEndOfCentralDirectory)?;
    let count = read_u16(bytes, eocd + 10).ok_or(ZipError::MissingEndOfCentralDirectory)?;
    let cd_offset = read_u32(bytes, eocd + 16).ok_or(ZipError::MissingEndOfCentralDirectory)?;

    let records = read_central_directory(bytes, cd_offset as usize, usize::from(count));
    let listed = records.len();
    let mut entries = Vec::with_capacity(listed);
    for record in records {
        let Some(payload) = local_payload(bytes, &record) else {
            continue;
        };
        let data = match record.method {
            METHOD_STORED => payload.to_vec(),
            METHOD_DEFLATE => inflate(payload, record.uncompressed_size).map_err(|source| {
                ZipError::Inflate {
                    name: record.name.clone(),
                    source,
                }
            })?,
            _ => continue,
        };
        entries.push(ZipEntry {
            name: record.name,
            data,
        });
    }

    if listed > 0 && entries.is_empty() {
        return Err(ZipError::NoReadableEntries(listed));
    }
    Ok(entries)
}

fn find_end_of_central_directory(bytes: &[u8]) -> Option<usize> {
    let last = bytes.len().checked_sub(END_OF_CENTRAL_DIRECTORY_LEN)?;
    let first = last.saturating_sub(MAX_COMMENT_LEN);
    (first..=last)
        .rev()
        .find(|&pos| read_u32(bytes, pos) == Some(END_OF_CENTRAL_DIRECTORY_SIGNATURE))
}

fn read_central_directory(bytes: &[u8], offset: usize, count: usize) -> Vec<CentralRecord> {
    let mut records = Vec::with_capacity(count.min(1024));
    let mut ptr = offset;
    for _ in 0..count {
        // A truncated or foreign record ends the walk; earlier records stay usable.
        let Some(record) = read_central_record(bytes, ptr) else {
            break;
        };
        let (record, next) = record;
        records.push(record);
        ptr = next;
    }
    records
}

fn read_central_record(bytes: &[u8], ptr: usize) -> Option<(CentralRecord, usize)> {
    if read_u32(bytes, ptr)? != CENTRAL_HEADER_SIGNATURE {
        return None;
    }
    let method = read_u16(bytes, ptr + 10)?;
    let compressed_size = read_u32(bytes, ptr + 20)? as usize;
    let uncompressed_size = read_u32(bytes, ptr + 24)? as usize;
    let name_len = usize::from(read_u16(bytes, ptr + 28)?);
    let extra_len = usize::from(read_u16(bytes, ptr + 30)?);
    let comment_len = usize::from(read_u16(bytes, ptr + 32)?);
    let local_offset = read_u32(bytes, ptr + 42)? as usize;
    let name_start = ptr + CENTRAL_HEADER_LEN;
    let name = bytes.get(name_start..name_start + name_len)?;

    let record = CentralRecord {
        name: String::from_utf8_lossy(name).into_owned(),
        method,
        compressed_size,
        uncompressed_size,
        local_offset,
    };
    Some((record, name_start + name_len + extra_len + comment_len))
}

fn local_payload<'a>(bytes: &'a [u8], record: &CentralRecord) -> Option<&'a [u8]> {
    let lp = record.local_offset;
    if read_u32(bytes, lp)? != LOCAL_HEADER_SIGNATURE {
        return None;
    }
    let name_len = usize::from(read_u16(bytes, lp + 26)?);
    let extra_len = usize::from(read_u16(bytes, lp + 28)?);
    let start = lp + LOCAL_HEADER_LEN + name_len + extra_len;
    let end = start.checked_add(record.compressed_size)?;
    bytes.get(start..end)
}

fn inflate(payload: &[u8], size_hint: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(size_hint.min(MAX_PREALLOC));
    DeflateDecoder::new(payload).read_to_end(&mut out)?;
    Ok(out)
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let raw = bytes.get(at..at.checked_add(2)?)?;
    Some(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// MS-DOS packed modification time and date, shared by all entries of one archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosDateTime {
    pub time: u16,
    pub date: u16,
}

static LOCAL_OFFSET: OnceLock<UtcOffset> = OnceLock::new();

/// Reads the local UTC offset once and keeps it for archive timestamps.
///
/// On Unix the offset can only be determined while the process is
/// single-threaded, so call this before starting an async runtime. Falls back
/// to UTC when the offset is unknown.
pub fn capture_local_offset() -> UtcOffset {
    *LOCAL_OFFSET.get_or_init(|| UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC))
}

fn local_offset() -> UtcOffset {
    LOCAL_OFFSET
        .get()
        .copied()
        .or_else(|| UtcOffset::current_local_offset().ok())
        .unwrap_or(UtcOffset::UTC)
}

impl DosDateTime {
    /// Current local wall-clock time, using the captured offset when there is one.
    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc().to_offset(local_offset()))
    }

    pub fn from_datetime(value: OffsetDateTime) -> Self {
        // DOS dates cover 1980..=2107.
        let year = value.year().clamp(1980, 2107);
        let time = (u16::from(value.hour()) << 11)
            | (u16::from(value.minute()) << 5)
            | u16::from(value.second() / 2);
        let date = (((year - 1980) as u16) << 9)
            | (u16::from(u8::from(value.month())) << 5)
            | u16::from(value.day());
        Self { time, date }
    }
}

struct RawItem<'a> {
    name: &'a str,
    method: u16,
    crc: u32,
    uncompressed_len: usize,
    payload: &'a [u8],
}

/// Builds a stored-only archive stamped with the current wall-clock time.
pub fn build_archive<'a, I>(items: I) -> Result<Vec<u8>, ZipError>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    build_archive_at(items, DosDateTime::now())
}

pub fn build_archive_at<'a, I>(items: I, stamp: DosDateTime) -> Result<Vec<u8>, ZipError>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    write_archive(
        items.into_iter().map(|(name, data)| RawItem {
            name,
            method: METHOD_STORED,
            crc: checksum(data),
            uncompressed_len: data.len(),
            payload: data,
        }),
        stamp,
    )
}

fn write_archive<'a, I>(items: I, stamp: DosDateTime) -> Result<Vec<u8>, ZipError>
where
    I: Iterator<Item = RawItem<'a>>,
{
    let mut out = Vec::new();
    let mut central = Vec::new();
    let mut count: u16 = 0;

    for item in items {
        count = count.checked_add(1).ok_or(ZipError::TooManyEntries)?;
        let too_large = || ZipError::EntryTooLarge(item.name.to_string());
        let name = item.name.as_bytes();
        let name_len = u16::try_from(name.len()).map_err(|_| too_large())?;
        let compressed = u32::try_from(item.payload.len()).map_err(|_| too_large())?;
        let uncompressed = u32::try_from(item.uncompressed_len).map_err(|_| too_large())?;
        let offset = u32::try_from(out.len()).map_err(|_| ZipError::ArchiveTooLarge)?;

        put_u32(&mut out, LOCAL_HEADER_SIGNATURE);
        put_u16(&mut out, ZIP_VERSION);
        put_u16(&mut out, 0);
        put_u16(&mut out, item.method);
        put_u16(&mut out, stamp.time);
        put_u16(&mut out, stamp.date);
        put_u32(&mut out, item.crc);
        put_u32(&mut out, compressed);
        put_u32(&mut out, uncompressed);
        put_u16(&mut out, name_len);
        put_u16(&mut out, 0);
        out.extend_from_slice(name);
        out.extend_from_slice(item.payload);

        put_u32(&mut central, CENTRAL_HEADER_SIGNATURE);
        put_u16(&mut central, ZIP_VERSION);
        put_u16(&mut central, ZIP_VERSION);
        put_u16(&mut central, 0);
        put_u16(&mut central, item.method);
        put_u16(&mut central, stamp.time);
        put_u16(&mut central, stamp.date);
        put_u32(&mut central, item.crc);
        put_u32(&mut central, compressed);
        put_u32(&mut central, uncompressed);
        put_u16(&mut central, name_len);
        put_u16(&mut central, 0); // extra
        put_u16(&mut central, 0); // comment
        put_u16(&mut central, 0); // disk number
        put_u16(&mut central, 0); // internal attributes
        put_u32(&mut central, 0); // external attributes
        put_u32(&mut central, offset);
        central.extend_from_slice(name);
    }

    let cd_offset = u32::try_from(out.len()).map_err(|_| ZipError::ArchiveTooLarge)?;
    let cd_size = u32::try_from(central.len()).map_err(|_| ZipError::ArchiveTooLarge)?;
    out.extend_from_slice(&central);

    put_u32(&mut out, END_OF_CENTRAL_DIRECTORY_SIGNATURE);
    put_u16(&mut out, 0);
    put_u16(&mut out, 0);
    put_u16(&mut out, count);
    put_u16(&mut out, count);
    put_u32(&mut out, cd_size);
    put_u32(&mut out, cd_offset);
    put_u16(&mut out, 0);
    Ok(out)
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}
