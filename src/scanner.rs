use crate::cancel::CancelToken;
use crate::codec::{Codec, WebPCodec};
use crate::config::Config;
use crate::eventbus::{Bus, Event};
use crate::iox::{FileInput, FileOutput, Input, Output, NEST_SEPARATOR};
use crate::transfer::Job;
use crate::zipio::{self, SharedZipWriter, ZipInput, ZipOutput};
use anyhow::Error;
use crossbeam_channel::Sender;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;
use zip::ZipArchive;

/// A (source, destination) directory or archive pair whose mode/mtime is
/// restored once all jobs have finished.
#[derive(Debug)]
pub struct MetaPair {
    pub src: PathBuf,
    pub dst: PathBuf,
}

/// Collected while enumerating; published once via `scanner.done`.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub meta_pairs: Vec<MetaPair>,
    pub job_count: usize,
    pub err_count: usize,
}

pub struct PathScanner {
    config: Arc<Config>,
    bus: Bus,
    jobs: Sender<Job>,
    result: ScanResult,
}

impl PathScanner {
    /// `config.src` and `config.dest` are expected to be cleaned paths.
    pub fn new(bus: Bus, config: Arc<Config>, jobs: Sender<Job>) -> Self {
        Self {
            config,
            bus,
            jobs,
            result: ScanResult::default(),
        }
    }

    /// Enumerates sources and queues jobs. Consumes the scanner, and with it
    /// the only queue sender: after `scanner.done` is published the queue
    /// closes and the workers drain out. Errors are reported and counted,
    /// never fatal to the scan as a whole.
    pub fn scan(mut self, cancel: &CancelToken) {
        self.scan_root(cancel);
        let result = std::mem::take(&mut self.result);
        self.bus.publish(Event::ScannerDone(Arc::new(result)));
    }

    fn scan_root(&mut self, cancel: &CancelToken) {
        let conf = Arc::clone(&self.config);

        let stat = match fs::metadata(&conf.src) {
            Ok(stat) => stat,
            Err(e) => {
                self.handle_error(
                    Error::new(e).context(format!("get <{}> stat failed", conf.src.display())),
                );
                return;
            }
        };

        if stat.is_dir() {
            self.walk_dir(cancel);
            return;
        }

        if let Some(dir) = conf.dest.parent() {
            if !dir.as_os_str().is_empty() {
                if let Err(e) = fs::create_dir_all(dir) {
                    self.handle_error(Error::new(e).context(format!(
                        "can not make output directory <{}>",
                        dir.display()
                    )));
                    return;
                }
            }
        }

        if conf.archive_match.matches(&conf.src.to_string_lossy(), true) {
            self.walk_zip(&conf.src, &conf.dest);
        } else {
            let job = Job {
                input: Input::File(FileInput::new(&conf.src)),
                output: Output::File(FileOutput::new(&conf.dest)),
                codec: self.webp_codec(),
                copy_meta: conf.copy_file_meta,
            };
            self.send_job(job);
        }
    }

    fn walk_dir(&mut self, cancel: &CancelToken) {
        let conf = Arc::clone(&self.config);
        let mut walker = WalkDir::new(&conf.src);
        if !conf.recursive {
            walker = walker.max_depth(1);
        }

        let mut it = walker.into_iter();
        while let Some(entry) = it.next() {
            if cancel.is_cancelled() {
                return;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let at = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    self.handle_error(
                        Error::new(e).context(format!("walk on file node <{at}> failed")),
                    );
                    continue;
                }
            };
            let path = entry.path().to_path_buf();

            if path == conf.src {
                if let Err(e) = fs::create_dir_all(&conf.dest) {
                    self.handle_error(Error::new(e).context(format!(
                        "can not make dest directory <{}>",
                        conf.dest.display()
                    )));
                    return;
                }
                continue;
            }
            if path == conf.dest || path == conf.log_path {
                if entry.file_type().is_dir() {
                    it.skip_current_dir();
                }
                continue;
            }

            let rel = path.strip_prefix(&conf.src).unwrap_or(&path);
            let mut out_path = conf.dest.join(rel);

            if entry.file_type().is_dir() {
                if !conf.recursive {
                    continue;
                }
                match fs::create_dir_all(&out_path) {
                    Ok(()) => {
                        if conf.copy_file_meta {
                            self.result.meta_pairs.push(MetaPair {
                                src: path.clone(),
                                dst: out_path,
                            });
                        }
                    }
                    Err(e) => {
                        self.handle_error(Error::new(e).context(format!(
                            "can not make dest directory <{}>",
                            out_path.display()
                        )));
                        it.skip_current_dir();
                    }
                }
                continue;
            }

            let path_str = path.to_string_lossy();
            if conf.archive_match.matches(&path_str, true) {
                if conf.recursive {
                    self.walk_zip(&path, &out_path);
                }
                continue;
            }

            let job = if conf.convert_match.matches(&path_str, true) {
                out_path.set_extension("webp");
                Job {
                    input: Input::File(FileInput::new(&path)),
                    output: Output::File(FileOutput::new(&out_path)),
                    codec: self.webp_codec(),
                    copy_meta: conf.copy_file_meta,
                }
            } else if conf
                .copy_match
                .as_ref()
                .map_or(false, |m| m.matches(&path_str, true))
            {
                Job {
                    input: Input::File(FileInput::new(&path)),
                    output: Output::File(FileOutput::new(&out_path)),
                    codec: Codec::Copy,
                    copy_meta: true,
                }
            } else {
                continue;
            };
            self.send_job(job);
        }
    }

    /// Archive entries are classified by raw name with POSIX separator
    /// semantics; output names go through Unicode Path detection. The output
    /// archive is only created when at least one job came out of the walk.
    fn walk_zip(&mut self, path: &Path, out_path: &Path) {
        let conf = Arc::clone(&self.config);

        let archive = File::open(path)
            .map_err(Error::new)
            .and_then(|f| ZipArchive::new(f).map_err(Error::new));
        let mut archive = match archive {
            Ok(archive) => archive,
            Err(e) => {
                self.handle_error(
                    e.context(format!("can not open archive <{}>", path.display())),
                );
                return;
            }
        };

        struct DirHeader {
            name: String,
            info: Option<crate::iox::FileInfo>,
        }
        let mut jobs = Vec::new();
        let mut dirs = Vec::new();

        for i in 0..archive.len() {
            let entry = match archive.by_index(i) {
                Ok(entry) => entry,
                Err(e) => {
                    self.handle_error(Error::new(e).context(format!(
                        "can not read entry {i} of <{}>",
                        path.display()
                    )));
                    continue;
                }
            };
            let raw = entry.name_raw().to_vec();
            let raw_str = String::from_utf8_lossy(&raw).into_owned();
            let display = zipio::entry_display_name(&raw, entry.extra_data());

            if entry.is_dir() {
                dirs.push(DirHeader {
                    name: display,
                    info: conf.copy_file_meta.then(|| zipio::entry_info(&entry)),
                });
                continue;
            }

            let (codec, out_name, copy_meta) = if conf.convert_match.matches(&raw_str, false) {
                (
                    self.webp_codec(),
                    replace_ext_posix(&display, "webp"),
                    conf.copy_file_meta,
                )
            } else if conf
                .copy_match
                .as_ref()
                .map_or(false, |m| m.matches(&raw_str, false))
            {
                (Codec::Copy, display, true)
            } else {
                continue;
            };

            let nested_in = format!("{}{}{}", path.display(), NEST_SEPARATOR, raw_str);
            let nested_out = format!("{}{}{}", out_path.display(), NEST_SEPARATOR, out_name);
            let endpoints = ZipInput::new(&nested_in)
                .map(|z| z.with_raw_name(raw))
                .and_then(|input| ZipOutput::new(&nested_out).map(|output| (input, output)));
            match endpoints {
                Ok((input, output)) => jobs.push(Job {
                    input: Input::Zip(input),
                    output: Output::Zip(output),
                    codec,
                    copy_meta,
                }),
                Err(e) => self.handle_error(e),
            }
        }

        if jobs.is_empty() {
            return;
        }

        let file = match File::create(out_path) {
            Ok(file) => file,
            Err(e) => {
                self.handle_error(Error::new(e).context(format!(
                    "can not create archive <{}>",
                    out_path.display()
                )));
                return;
            }
        };
        let writer = Arc::new(SharedZipWriter::new(file, jobs.len() as i32));

        // Original directory entries go in first, synchronously, before any
        // worker can touch the writer.
        for dir in dirs {
            let added = writer.with(|w| {
                w.add_directory(dir.name.clone(), zipio::entry_options(dir.info.as_ref()))
                    .map_err(Error::new)
            });
            if let Err(e) = added {
                self.handle_error(e.context(format!(
                    "can not create archive entry <{}{}{}>",
                    out_path.display(),
                    NEST_SEPARATOR,
                    dir.name
                )));
            }
        }

        for mut job in jobs {
            if let Output::Zip(z) = &mut job.output {
                z.set_writer(Arc::clone(&writer));
            }
            self.send_job(job);
        }

        if conf.copy_file_meta {
            self.result.meta_pairs.push(MetaPair {
                src: path.to_path_buf(),
                dst: out_path.to_path_buf(),
            });
        }
    }

    fn webp_codec(&self) -> Codec {
        Codec::WebP(WebPCodec {
            opts: self.config.opts.clone(),
            copy_meta: self.config.copy_image_meta,
            check_image: self.config.check_image,
        })
    }

    fn handle_error(&mut self, err: Error) {
        self.result.err_count += 1;
        self.bus.publish(Event::ScannerError(Arc::new(err)));
    }

    fn send_job(&mut self, job: Job) {
        self.result.job_count += 1;
        self.bus.publish(Event::ScannerNewJob {
            kind: job.codec.kind(),
        });
        // Bounded queue: blocks here when the workers fall behind. A closed
        // queue (cancelled run) just drops the job.
        let _ = self.jobs.send(job);
    }
}

/// Replace the extension of a `/`-separated entry name, treating a dot in
/// the final segment (its first byte included) as the extension start.
fn replace_ext_posix(name: &str, ext: &str) -> String {
    let seg_start = name.rfind('/').map_or(0, |i| i + 1);
    match name[seg_start..].rfind('.') {
        Some(i) => format!("{}.{ext}", &name[..seg_start + i]),
        None => format!("{name}.{ext}"),
    }
}
