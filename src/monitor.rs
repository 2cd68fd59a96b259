use crate::cancel::CancelToken;
use crate::codec::JobKind;
use crate::eventbus::{Bus, Event, Topic};
use crate::scanner::ScanResult;
use anyhow::{Context, Result};
use chrono::Local;
use crossbeam_channel::{select, tick, Receiver, Sender};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TOPICS: [Topic; 5] = [
    Topic::ScannerNewJob,
    Topic::ScannerError,
    Topic::ScannerDone,
    Topic::TransferJobDone,
    Topic::TransferDone,
];

/// This run's log file. Lines: `[LEVEL] <timestamp> <msg>`.
pub struct RunLog {
    out: BufWriter<File>,
}

impl RunLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("can not create log file <{}>", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    pub fn error(&mut self, msg: impl AsRef<str>) {
        self.write_line("ERROR", msg.as_ref());
    }

    pub fn warn(&mut self, msg: impl AsRef<str>) {
        self.write_line("WARN ", msg.as_ref());
    }

    pub fn info(&mut self, msg: impl AsRef<str>) {
        self.write_line("INFO ", msg.as_ref());
    }

    fn write_line(&mut self, level: &str, msg: &str) {
        let ts = Local::now().format("%Y/%m/%d %H:%M:%S%.6f");
        let _ = writeln!(self.out, "[{level}] {ts} {msg}");
        let _ = self.out.flush();
    }
}

#[derive(Default)]
struct Counter {
    done: usize,
    total: usize,
}

/// Observes the five pipeline topics, renders a one-line console status
/// every second and flushes counters to the log every thirty.
pub struct Monitor {
    bus: Bus,
    log: RunLog,
    sub_tx: Sender<Event>,
    sub_rx: Receiver<Event>,
    convert: Counter,
    copy: Counter,
    errors: usize,
    warnings: usize,
    jobs_queued: usize,
    jobs_finished: usize,
    scanner_errs: usize,
    started: Instant,
}

impl Monitor {
    /// Subscribes immediately so no event published between construction
    /// and `start` is lost.
    pub fn new(bus: Bus, log: RunLog) -> Self {
        let (sub_tx, sub_rx) = Bus::mailbox(512);
        for topic in TOPICS {
            bus.subscribe(topic, sub_tx.clone());
        }
        Self {
            bus,
            log,
            sub_tx,
            sub_rx,
            convert: Counter::default(),
            copy: Counter::default(),
            errors: 0,
            warnings: 0,
            jobs_queued: 0,
            jobs_finished: 0,
            scanner_errs: 0,
            started: Instant::now(),
        }
    }

    /// Runs until the pipeline settles: `transfer.done` seen, the scan
    /// result delivered, and every queued job and scanner error accounted
    /// for. The authoritative totals ride in the `scanner.done` payload, so
    /// late per-event deliveries cannot end the loop early. Cancellation
    /// breaks immediately with whatever was observed.
    pub fn start(mut self, cancel: &CancelToken) {
        let t1s = tick(Duration::from_secs(1));
        let t30s = tick(Duration::from_secs(30));
        let sub_rx = self.sub_rx.clone();
        let cancelled = cancel.done().clone();
        let mut transfer_done = false;
        let mut scan: Option<Arc<ScanResult>> = None;

        self.started = Instant::now();
        hide_cursor();
        loop {
            select! {
                recv(sub_rx) -> msg => {
                    let Ok(event) = msg else { break };
                    match event {
                        Event::TransferDone => transfer_done = true,
                        Event::ScannerDone(result) => scan = Some(result),
                        other => self.process_event(other),
                    }
                    if let Some(scan) = &scan {
                        if transfer_done
                            && self.jobs_queued == scan.job_count
                            && self.jobs_finished == scan.job_count
                            && self.scanner_errs == scan.err_count
                        {
                            break;
                        }
                    }
                }
                recv(t1s) -> _ => self.update_console(),
                recv(t30s) -> _ => self.log_counters(),
                recv(cancelled) -> _ => break,
            }
        }
        self.update_console();
        println!();
        show_cursor();
        for topic in TOPICS {
            self.bus.unsubscribe(topic, &self.sub_tx);
        }
        self.log_counters();
    }

    fn process_event(&mut self, event: Event) {
        match event {
            Event::ScannerNewJob { kind } => {
                match kind {
                    JobKind::Convert => self.convert.total += 1,
                    JobKind::Copy => self.copy.total += 1,
                }
                self.jobs_queued += 1;
            }
            Event::TransferJobDone(report) => {
                self.jobs_finished += 1;
                if let Some(err) = &report.err {
                    self.errors += 1;
                    self.log.error(format!(
                        "[Transfer] <{}> -> <{}>: {:#}",
                        report.in_path, report.out_path, err
                    ));
                } else {
                    match report.kind {
                        JobKind::Convert => self.convert.done += 1,
                        JobKind::Copy => self.copy.done += 1,
                    }
                }
                self.warnings += report.warnings.len();
                for warn in &report.warnings {
                    self.log.warn(format!(
                        "[Transfer] <{}> -> <{}>: {:#}",
                        report.in_path, report.out_path, warn
                    ));
                }
            }
            Event::ScannerError(err) => {
                self.scanner_errs += 1;
                self.errors += 1;
                self.log.error(format!("[Scanner] {err:#}"));
            }
            _ => {}
        }
        self.update_console();
    }

    fn update_console(&self) {
        print!("\r{}", self.status_line());
        let _ = io::stdout().flush();
    }

    fn status_line(&self) -> String {
        format!(
            "\x1b[36mconv\x1b[0m: {}/{} | \x1b[32mcopy\x1b[0m: {}/{} | \x1b[31merror\x1b[0m: {} | \x1b[33mwarn\x1b[0m: {} | elapsed: {}",
            self.convert.done,
            self.convert.total,
            self.copy.done,
            self.copy.total,
            self.errors,
            self.warnings,
            format_duration(self.started.elapsed()),
        )
    }

    fn log_counters(&mut self) {
        let line = format!(
            "conv: {}/{} | copy: {}/{} | error: {} | warn: {} | elapsed: {}",
            self.convert.done,
            self.convert.total,
            self.copy.done,
            self.copy.total,
            self.errors,
            self.warnings,
            format_duration(self.started.elapsed()),
        );
        self.log.info(line);
    }
}

fn hide_cursor() {
    print!("\x1b[?25l");
    let _ = io::stdout().flush();
}

fn show_cursor() {
    print!("\x1b[?25h");
    let _ = io::stdout().flush();
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::JobReport;
    use anyhow::anyhow;
    use std::fs;

    fn test_monitor(dir: &Path) -> Monitor {
        let log = RunLog::create(&dir.join("run.log")).unwrap();
        Monitor::new(Bus::new(), log)
    }

    fn report(kind: JobKind, err: Option<anyhow::Error>, warnings: Vec<anyhow::Error>) -> Event {
        Event::TransferJobDone(Arc::new(JobReport {
            in_path: "in".into(),
            out_path: "out".into(),
            kind,
            err,
            warnings,
        }))
    }

    #[test]
    fn counters_track_job_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = test_monitor(dir.path());

        monitor.process_event(Event::ScannerNewJob {
            kind: JobKind::Convert,
        });
        monitor.process_event(Event::ScannerNewJob {
            kind: JobKind::Convert,
        });
        monitor.process_event(Event::ScannerNewJob { kind: JobKind::Copy });
        assert_eq!(monitor.convert.total, 2);
        assert_eq!(monitor.copy.total, 1);
        assert_eq!(monitor.jobs_queued, 3);

        monitor.process_event(report(JobKind::Convert, None, Vec::new()));
        monitor.process_event(report(
            JobKind::Convert,
            Some(anyhow!("boom")),
            vec![anyhow!("close warning")],
        ));
        monitor.process_event(report(JobKind::Copy, None, Vec::new()));

        assert_eq!(monitor.convert.done, 1);
        assert_eq!(monitor.copy.done, 1);
        assert_eq!(monitor.jobs_finished, 3);
        assert_eq!(monitor.errors, 1);
        assert_eq!(monitor.warnings, 1);
    }

    #[test]
    fn scanner_errors_are_counted_separately() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = test_monitor(dir.path());
        monitor.process_event(Event::ScannerError(Arc::new(anyhow!("walk failed"))));
        monitor.process_event(Event::ScannerError(Arc::new(anyhow!("stat failed"))));
        assert_eq!(monitor.scanner_errs, 2);
        assert_eq!(monitor.errors, 2);
    }

    #[test]
    fn log_lines_carry_level_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let mut log = RunLog::create(&path).unwrap();
        log.error("first failure");
        log.warn("second issue");
        log.info("conv: 1/1");

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("[ERROR] "));
        assert!(lines[0].ends_with("first failure"));
        assert!(lines[1].starts_with("[WARN ] "));
        assert!(lines[2].starts_with("[INFO ] "));
    }

    #[test]
    fn terminates_once_counts_settle() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new();
        let log = RunLog::create(&dir.path().join("run.log")).unwrap();
        let monitor = Monitor::new(bus.clone(), log);

        let cancel = CancelToken::new();
        let handle = std::thread::spawn(move || monitor.start(&cancel));

        bus.publish(Event::ScannerNewJob {
            kind: JobKind::Convert,
        });
        bus.publish(report(JobKind::Convert, None, Vec::new()));
        bus.publish(Event::ScannerDone(Arc::new(ScanResult {
            meta_pairs: Vec::new(),
            job_count: 1,
            err_count: 0,
        })));
        bus.publish(Event::TransferDone);

        handle.join().unwrap();
    }

    #[test]
    fn cancellation_breaks_the_loop_without_settling() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new();
        let log = RunLog::create(&dir.path().join("run.log")).unwrap();
        let monitor = Monitor::new(bus.clone(), log);

        let cancel = CancelToken::new();
        let thread_cancel = cancel.clone();
        let handle = std::thread::spawn(move || monitor.start(&thread_cancel));

        // Totals never settle: one job queued, none finished.
        bus.publish(Event::ScannerNewJob {
            kind: JobKind::Convert,
        });
        cancel.cancel();
        handle.join().unwrap();
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_secs(59)), "00:59");
        assert_eq!(format_duration(Duration::from_secs(61)), "01:01");
        assert_eq!(format_duration(Duration::from_secs(3750)), "01:02:30");
    }
}
