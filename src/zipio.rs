use crate::iox::{split_nested, FileInfo};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use zip::read::{ZipArchive, ZipFile};
use zip::write::{FileOptions, ZipWriter};

const UNICODE_PATH_TAG: u16 = 0x7075;

/// One ZIP entry as a readable source. The entry is resolved by raw stored
/// name (byte-for-byte, before any UTF-8 detection) and decompressed into
/// memory at open.
pub struct ZipInput {
    display: String,
    archive_path: String,
    entry_name: Vec<u8>,
    data: Option<Cursor<Vec<u8>>>,
    info: Option<FileInfo>,
}

impl ZipInput {
    pub fn new(path: &str) -> Result<Self> {
        let (archive, entry) = split_nested(path)?;
        Ok(Self {
            display: path.to_string(),
            archive_path: archive.to_string(),
            entry_name: entry.as_bytes().to_vec(),
            data: None,
            info: None,
        })
    }

    /// Overrides the lookup name with the exact raw header bytes; needed
    /// when the stored name is not valid UTF-8.
    pub fn with_raw_name(mut self, raw: Vec<u8>) -> Self {
        self.entry_name = raw;
        self
    }

    pub fn path(&self) -> &str {
        &self.display
    }

    pub fn open(&mut self) -> Result<()> {
        let file = File::open(&self.archive_path)
            .with_context(|| format!("open archive <{}>", self.archive_path))?;
        let mut archive = ZipArchive::new(file)
            .with_context(|| format!("read archive <{}>", self.archive_path))?;
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.name_raw() != self.entry_name.as_slice() {
                continue;
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .with_context(|| format!("read entry of <{}>", self.display))?;
            self.info = Some(entry_info(&entry));
            self.data = Some(Cursor::new(data));
            return Ok(());
        }
        bail!("zip entry not found: <{}>", self.display)
    }

    pub fn info(&mut self) -> Result<FileInfo> {
        self.info
            .clone()
            .ok_or_else(|| anyhow!("zip <{}> not open yet", self.display))
    }

    pub fn close(&mut self) -> Result<()> {
        self.data = None;
        Ok(())
    }
}

impl Read for ZipInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.data {
            Some(data) => data.read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("<{}> is not open", self.display),
            )),
        }
    }
}

/// A single archive written by many concurrent producers. Each producer
/// commits exactly one entry under the mutex and then drops its reference;
/// the last drop finalizes the central directory and closes the file.
pub struct SharedZipWriter {
    writer: Mutex<Option<ZipWriter<File>>>,
    refs: AtomicI32,
}

impl SharedZipWriter {
    pub fn new(file: File, refs: i32) -> Self {
        Self {
            writer: Mutex::new(Some(ZipWriter::new(file))),
            refs: AtomicI32::new(refs),
        }
    }

    /// Runs `f` with exclusive access to the underlying writer.
    pub fn with<T>(&self, f: impl FnOnce(&mut ZipWriter<File>) -> Result<T>) -> Result<T> {
        let mut guard = self.writer.lock().unwrap();
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow!("zip writer already finalized"))?;
        f(writer)
    }

    pub fn unref(&self) -> Result<()> {
        if self.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Ok(());
        }
        let writer = self.writer.lock().unwrap().take();
        if let Some(mut writer) = writer {
            writer.finish().context("finalize zip archive")?;
        }
        Ok(())
    }
}

/// One ZIP entry as a writable sink. Writes buffer in memory; close commits
/// the entry under the shared writer's lock and releases the reference.
pub struct ZipOutput {
    display: String,
    entry_name: String,
    writer: Option<Arc<SharedZipWriter>>,
    data: Option<Vec<u8>>,
    info: Option<FileInfo>,
}

impl ZipOutput {
    pub fn new(path: &str) -> Result<Self> {
        let (_, entry) = split_nested(path)?;
        Ok(Self {
            display: path.to_string(),
            entry_name: entry.to_string(),
            writer: None,
            data: None,
            info: None,
        })
    }

    pub fn set_writer(&mut self, writer: Arc<SharedZipWriter>) {
        self.writer = Some(writer);
    }

    pub fn path(&self) -> &str {
        &self.display
    }

    pub fn open(&mut self, info: Option<FileInfo>) -> Result<()> {
        self.data = Some(Vec::new());
        self.info = info;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let commit = match self.data.take() {
            Some(data) => writer.with(|w| {
                w.start_file(self.entry_name.clone(), entry_options(self.info.as_ref()))
                    .with_context(|| format!("create archive entry <{}>", self.display))?;
                w.write_all(&data)
                    .with_context(|| format!("write archive entry <{}>", self.display))?;
                Ok(())
            }),
            None => Ok(()),
        };
        let released = writer.unref();
        commit?;
        released
    }
}

impl Write for ZipOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.data {
            Some(data) => {
                data.extend_from_slice(buf);
                Ok(buf.len())
            }
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("<{}> is not open", self.display),
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Entry options carrying the captured mode/mtime, or current time and
/// default permissions when no info was supplied.
pub fn entry_options(info: Option<&FileInfo>) -> FileOptions {
    match info {
        Some(info) => {
            let mut opts = FileOptions::default().last_modified_time(zip_datetime(info.mtime));
            if let Some(mode) = info.mode {
                opts = opts.unix_permissions(mode);
            }
            opts
        }
        None => FileOptions::default().last_modified_time(zip_datetime(SystemTime::now())),
    }
}

/// Metadata slice of a ZIP entry header.
pub fn entry_info(entry: &ZipFile) -> FileInfo {
    FileInfo {
        mode: entry.unix_mode(),
        mtime: dos_to_system_time(entry.last_modified()),
        len: entry.size(),
    }
}

fn zip_datetime(t: SystemTime) -> zip::DateTime {
    let dt: DateTime<Local> = t.into();
    zip::DateTime::from_date_and_time(
        dt.year().clamp(1980, 2107) as u16,
        dt.month() as u8,
        dt.day() as u8,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second().min(59) as u8,
    )
    .unwrap_or_default()
}

fn dos_to_system_time(dt: zip::DateTime) -> SystemTime {
    Local
        .with_ymd_and_hms(
            i32::from(dt.year()),
            u32::from(dt.month()),
            u32::from(dt.day()),
            u32::from(dt.hour()),
            u32::from(dt.minute()),
            u32::from(dt.second()),
        )
        .single()
        .map(SystemTime::from)
        .unwrap_or_else(SystemTime::now)
}

/// Display name for an entry: the raw name when it is already valid UTF-8,
/// otherwise the validated Info-ZIP Unicode Path, otherwise a lossy
/// rendering. Lookup inside the archive always uses the raw name.
pub fn entry_display_name(raw_name: &[u8], extra: &[u8]) -> String {
    if let Ok(name) = std::str::from_utf8(raw_name) {
        return name.to_string();
    }
    detect_utf8_name(raw_name, extra)
        .unwrap_or_else(|| String::from_utf8_lossy(raw_name).into_owned())
}

/// Info-ZIP Unicode Path extra field (0x7075, APPNOTE 4.6.9): version 1,
/// CRC32 of the raw name, then the UTF-8 name. A stale CRC means some tool
/// renamed the entry without updating the field, so the record is ignored.
pub fn detect_utf8_name(raw_name: &[u8], extra: &[u8]) -> Option<String> {
    let mut pos = 0usize;
    while pos + 4 <= extra.len() {
        let tag = u16::from_le_bytes([extra[pos], extra[pos + 1]]);
        let size = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        pos += 4;
        if pos + size > extra.len() {
            break;
        }
        if tag == UNICODE_PATH_TAG && size >= 5 {
            let data = &extra[pos..pos + size];
            let stored = u32::from_le_bytes(data[1..5].try_into().unwrap());
            if data[0] == 1 && stored == name_crc32(raw_name) {
                return String::from_utf8(data[5..].to_vec()).ok();
            }
        }
        pos += size;
    }
    None
}

fn name_crc32(name: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(name);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn upath_extra(raw_name: &[u8], utf8_name: &str, poison_crc: bool) -> Vec<u8> {
        let mut crc = name_crc32(raw_name);
        if poison_crc {
            crc ^= 0xdead_beef;
        }
        let mut data = vec![1u8]; // version
        data.extend_from_slice(&crc.to_le_bytes());
        data.extend_from_slice(utf8_name.as_bytes());

        let mut extra = UNICODE_PATH_TAG.to_le_bytes().to_vec();
        extra.extend_from_slice(&(data.len() as u16).to_le_bytes());
        extra.extend_from_slice(&data);
        extra
    }

    #[test]
    fn upath_with_matching_crc_is_used() {
        let raw = [0x83, 0x65, 0x83, 0x58, 0x83, 0x67]; // legacy-encoded name
        let extra = upath_extra(&raw, "テスト.png", false);
        assert_eq!(
            detect_utf8_name(&raw, &extra).as_deref(),
            Some("テスト.png")
        );
        assert_eq!(entry_display_name(&raw, &extra), "テスト.png");
    }

    #[test]
    fn stale_upath_crc_is_ignored() {
        let raw = [0x83, 0x65, 0x83, 0x58];
        let extra = upath_extra(&raw, "renamed.png", true);
        assert_eq!(detect_utf8_name(&raw, &extra), None);
    }

    #[test]
    fn upath_is_found_after_other_extra_records() {
        let raw = [0xff, 0xfe, 0x2e, 0x70];
        let mut extra = vec![0x55, 0x54, 0x05, 0x00, 1, 2, 3, 4, 5]; // UT record first
        extra.extend_from_slice(&upath_extra(&raw, "found.png", false));
        assert_eq!(detect_utf8_name(&raw, &extra).as_deref(), Some("found.png"));
    }

    #[test]
    fn valid_utf8_raw_name_wins_over_extra_field() {
        let extra = upath_extra(b"plain.png", "other.png", false);
        assert_eq!(entry_display_name(b"plain.png", &extra), "plain.png");
    }

    #[test]
    fn truncated_extra_field_is_tolerated() {
        let raw = [0xff, 0xfe];
        let extra = [0x75, 0x70, 0xff, 0x7f, 1, 2]; // declared size exceeds data
        assert_eq!(detect_utf8_name(&raw, &extra), None);
    }

    #[test]
    fn concurrent_producers_fill_one_well_formed_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.zip");
        let file = File::create(&path).unwrap();

        const PRODUCERS: usize = 8;
        let writer = Arc::new(SharedZipWriter::new(file, PRODUCERS as i32));
        let mut handles = Vec::new();
        for i in 0..PRODUCERS {
            let writer = Arc::clone(&writer);
            handles.push(thread::spawn(move || {
                let body = vec![i as u8; 1024 + i];
                writer
                    .with(|w| {
                        w.start_file(format!("entry-{i:02}.bin"), entry_options(None))?;
                        w.write_all(&body)?;
                        Ok(())
                    })
                    .unwrap();
                writer.unref().unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut archive = ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), PRODUCERS);
        for i in 0..PRODUCERS {
            let mut entry = archive.by_name(&format!("entry-{i:02}.bin")).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            assert_eq!(data.len(), 1024 + i);
            assert!(data.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn unref_past_zero_does_not_double_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solo.zip");
        let writer = SharedZipWriter::new(File::create(&path).unwrap(), 1);
        writer
            .with(|w| {
                w.start_file("only.bin", entry_options(None))?;
                w.write_all(b"x")?;
                Ok(())
            })
            .unwrap();
        writer.unref().unwrap();
        // The writer is gone; another access fails instead of corrupting.
        assert!(writer.with(|_| Ok(())).is_err());
        writer.unref().unwrap();
    }

    #[test]
    fn zip_roundtrip_preserves_entry_bytes_and_raw_name_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rt.zip");
        let writer = SharedZipWriter::new(File::create(&path).unwrap(), 1);
        writer
            .with(|w| {
                w.start_file("inner/pic.bin", entry_options(None))?;
                w.write_all(b"entry-bytes")?;
                Ok(())
            })
            .unwrap();
        writer.unref().unwrap();

        let nested = format!("{}|inner/pic.bin", path.display());
        let mut input = ZipInput::new(&nested).unwrap();
        input.open().unwrap();
        assert_eq!(input.info().unwrap().len, 11);
        let mut data = Vec::new();
        input.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"entry-bytes");
        input.close().unwrap();

        let missing = format!("{}|inner/other.bin", path.display());
        let mut input = ZipInput::new(&missing).unwrap();
        assert!(input.open().is_err());
    }
}
