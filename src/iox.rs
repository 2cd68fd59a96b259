use crate::zipio::{ZipInput, ZipOutput};
use anyhow::{bail, Context, Result};
use filetime::FileTime;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::SystemTime;

/// Joins an archive path and an entry name in nested-path notation:
/// `archive.zip|dir/entry.png`.
pub const NEST_SEPARATOR: char = '|';

/// Splits a nested path at its last separator. Paths without one are
/// invalid by construction.
pub fn split_nested(path: &str) -> Result<(&str, &str)> {
    match path.rfind(NEST_SEPARATOR) {
        Some(idx) => Ok((&path[..idx], &path[idx + 1..])),
        None => bail!("invalid nested zip path <{path}>"),
    }
}

/// The slice of file metadata this tool propagates.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub mode: Option<u32>,
    pub mtime: SystemTime,
    pub len: u64,
}

impl FileInfo {
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(meta.permissions().mode())
        };
        #[cfg(not(unix))]
        let mode = None;
        Self {
            mode,
            mtime: meta.modified().unwrap_or_else(|_| SystemTime::now()),
            len: meta.len(),
        }
    }
}

/// Readable byte source with a path identity. `open` must run before any
/// read; `close` is idempotent.
pub enum Input {
    File(FileInput),
    Zip(ZipInput),
}

impl Input {
    pub fn path(&self) -> &str {
        match self {
            Input::File(f) => f.path(),
            Input::Zip(z) => z.path(),
        }
    }

    pub fn open(&mut self) -> Result<()> {
        match self {
            Input::File(f) => f.open(),
            Input::Zip(z) => z.open(),
        }
    }

    pub fn info(&mut self) -> Result<FileInfo> {
        match self {
            Input::File(f) => f.info(),
            Input::Zip(z) => z.info(),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            Input::File(f) => f.close(),
            Input::Zip(z) => z.close(),
        }
    }
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Input::File(f) => f.read(buf),
            Input::Zip(z) => z.read(buf),
        }
    }
}

/// Writable byte sink with a path identity. `open` takes the info to apply
/// when the sink closes; `close` always flushes and is idempotent.
pub enum Output {
    File(FileOutput),
    Zip(ZipOutput),
}

impl Output {
    pub fn path(&self) -> &str {
        match self {
            Output::File(f) => f.path(),
            Output::Zip(z) => z.path(),
        }
    }

    pub fn open(&mut self, info: Option<FileInfo>) -> Result<()> {
        match self {
            Output::File(f) => f.open(info),
            Output::Zip(z) => z.open(info),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            Output::File(f) => f.close(),
            Output::Zip(z) => z.close(),
        }
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Output::File(f) => f.write(buf),
            Output::Zip(z) => z.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::File(f) => f.flush(),
            Output::Zip(z) => z.flush(),
        }
    }
}

pub struct FileInput {
    path: PathBuf,
    display: String,
    file: Option<File>,
    info: Option<FileInfo>,
}

impl FileInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            display: path.display().to_string(),
            path,
            file: None,
            info: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.display
    }

    pub fn open(&mut self) -> Result<()> {
        let file = File::open(&self.path).with_context(|| format!("open <{}>", self.display))?;
        self.file = Some(file);
        Ok(())
    }

    /// Stats on first call and memoizes.
    pub fn info(&mut self) -> Result<FileInfo> {
        if self.info.is_none() {
            let meta =
                fs::metadata(&self.path).with_context(|| format!("stat <{}>", self.display))?;
            self.info = Some(FileInfo::from_metadata(&meta));
        }
        Ok(self.info.clone().unwrap())
    }

    pub fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.file {
            Some(file) => file.read(buf),
            None => Err(not_open(&self.display)),
        }
    }
}

pub struct FileOutput {
    path: PathBuf,
    display: String,
    file: Option<File>,
    info: Option<FileInfo>,
}

impl FileOutput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            display: path.display().to_string(),
            path,
            file: None,
            info: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.display
    }

    /// Creates or truncates the file and records the info applied on close.
    pub fn open(&mut self, info: Option<FileInfo>) -> Result<()> {
        let file =
            File::create(&self.path).with_context(|| format!("create <{}>", self.display))?;
        self.file = Some(file);
        self.info = info;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            drop(file);
        }
        let Some(info) = self.info.take() else {
            return Ok(());
        };
        #[cfg(unix)]
        if let Some(mode) = info.mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(mode))
                .with_context(|| format!("chmod <{}>", self.display))?;
        }
        filetime::set_file_times(
            &self.path,
            FileTime::now(),
            FileTime::from_system_time(info.mtime),
        )
        .with_context(|| format!("set mtime on <{}>", self.display))?;
        Ok(())
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.file {
            Some(file) => file.write(buf),
            None => Err(not_open(&self.display)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

fn not_open(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("<{path}> is not open"))
}
