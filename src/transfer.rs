use crate::cancel::CancelToken;
use crate::codec::{Codec, JobKind};
use crate::eventbus::{Bus, Event, Topic};
use crate::imagex::Registry;
use crate::iox::{Input, Output};
use crate::scanner::ScanResult;
use anyhow::Result;
use crossbeam_channel::{select, Receiver, Sender};
use filetime::FileTime;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

/// One unit of work, owned by a single worker from dequeue to completion.
pub struct Job {
    pub input: Input,
    pub output: Output,
    pub codec: Codec,
    pub copy_meta: bool,
}

/// What a finished job looked like, published as `transfer.job-done`.
pub struct JobReport {
    pub in_path: String,
    pub out_path: String,
    pub kind: JobKind,
    pub err: Option<anyhow::Error>,
    pub warnings: Vec<anyhow::Error>,
}

impl Job {
    /// Owns the whole lifecycle: open input, capture info when metadata is
    /// propagated, open output, run the codec, close both ends. Close always
    /// runs; a close error becomes the job error when nothing failed before.
    fn run(mut self, registry: &Registry) -> JobReport {
        let in_path = self.input.path().to_string();
        let out_path = self.output.path().to_string();
        let kind = self.codec.kind();

        let mut warnings = Vec::new();
        let mut err = self.execute(registry, &mut warnings).err();
        if let Err(e) = self.input.close() {
            err.get_or_insert(e);
        }
        if let Err(e) = self.output.close() {
            err.get_or_insert(e);
        }

        JobReport {
            in_path,
            out_path,
            kind,
            err,
            warnings,
        }
    }

    fn execute(&mut self, registry: &Registry, warnings: &mut Vec<anyhow::Error>) -> Result<()> {
        self.input.open()?;
        let info = if self.copy_meta {
            match self.input.info() {
                Ok(info) => Some(info),
                Err(e) => {
                    warnings.push(e);
                    None
                }
            }
        } else {
            None
        };
        self.output.open(info)?;
        self.codec
            .convert(&mut self.input, &mut self.output, registry, warnings)
    }
}

/// Bounded worker pool draining the job queue.
pub struct Transfer {
    max_go: usize,
    jobs: Receiver<Job>,
    bus: Bus,
    registry: Arc<Registry>,
    sub_tx: Sender<Event>,
    sub_rx: Receiver<Event>,
}

impl Transfer {
    /// Subscribes to `scanner.done` right away so the event cannot slip by
    /// before `start` runs.
    pub fn new(bus: Bus, registry: Arc<Registry>, jobs: Receiver<Job>, max_go: usize) -> Self {
        let (sub_tx, sub_rx) = Bus::mailbox(1);
        bus.subscribe(Topic::ScannerDone, sub_tx.clone());
        Self {
            max_go: max_go.max(1),
            jobs,
            bus,
            registry,
            sub_tx,
            sub_rx,
        }
    }

    /// Runs until the scanner finishes (or the run is cancelled) and every
    /// worker has drained out, then applies the deferred directory and
    /// archive metadata and publishes `transfer.done`.
    pub fn start(self, cancel: CancelToken) {
        let mut workers = Vec::with_capacity(self.max_go);
        for _ in 0..self.max_go {
            let jobs = self.jobs.clone();
            let bus = self.bus.clone();
            let registry = Arc::clone(&self.registry);
            let cancel = cancel.clone();
            workers.push(thread::spawn(move || worker(jobs, bus, registry, cancel)));
        }

        let mut scan: Option<Arc<ScanResult>> = None;
        select! {
            recv(self.sub_rx) -> msg => {
                if let Ok(Event::ScannerDone(result)) = msg {
                    scan = Some(result);
                }
            }
            recv(cancel.done()) -> _ => {}
        }

        for worker in workers {
            let _ = worker.join();
        }

        if let Some(scan) = scan {
            for pair in &scan.meta_pairs {
                propagate_meta(&pair.src, &pair.dst);
            }
        }

        self.bus.publish(Event::TransferDone);
        self.bus.unsubscribe(Topic::ScannerDone, &self.sub_tx);
    }
}

/// Dequeue and run jobs until the queue closes behind the scanner or the
/// run is cancelled. Failed jobs are reported, never retried.
fn worker(jobs: Receiver<Job>, bus: Bus, registry: Arc<Registry>, cancel: CancelToken) {
    loop {
        select! {
            recv(jobs) -> job => {
                let Ok(job) = job else { break };
                let report = job.run(&registry);
                bus.publish(Event::TransferJobDone(Arc::new(report)));
            }
            recv(cancel.done()) -> _ => break,
        }
    }
}

/// Best effort: failures while restoring directory/archive metadata are
/// swallowed, matching per-file propagation semantics at end of run.
fn propagate_meta(src: &Path, dst: &Path) {
    let Ok(meta) = fs::metadata(src) else {
        return;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(dst, fs::Permissions::from_mode(meta.permissions().mode()));
    }
    if let Ok(mtime) = meta.modified() {
        let _ = filetime::set_file_times(dst, FileTime::now(), FileTime::from_system_time(mtime));
    }
}
