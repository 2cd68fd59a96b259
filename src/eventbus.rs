use crate::codec::JobKind;
use crate::scanner::ScanResult;
use crate::transfer::JobReport;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ScannerNewJob,
    ScannerError,
    ScannerDone,
    TransferJobDone,
    TransferDone,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ScannerNewJob => "scanner.new-job",
            Topic::ScannerError => "scanner.error",
            Topic::ScannerDone => "scanner.done",
            Topic::TransferJobDone => "transfer.job-done",
            Topic::TransferDone => "transfer.done",
        }
    }
}

/// Bus payloads. The variant implies the topic, so subscribers never have to
/// downcast anything.
#[derive(Clone)]
pub enum Event {
    ScannerNewJob { kind: JobKind },
    ScannerError(Arc<anyhow::Error>),
    ScannerDone(Arc<ScanResult>),
    TransferJobDone(Arc<JobReport>),
    TransferDone,
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::ScannerNewJob { .. } => Topic::ScannerNewJob,
            Event::ScannerError(_) => Topic::ScannerError,
            Event::ScannerDone(_) => Topic::ScannerDone,
            Event::TransferJobDone(_) => Topic::TransferJobDone,
            Event::TransferDone => Topic::TransferDone,
        }
    }
}

type SubscriberTable = HashMap<Topic, Vec<Sender<Event>>>;

/// Many-to-many publish/subscribe keyed by topic.
///
/// `publish` hands the event to a dispatcher thread and returns immediately;
/// the dispatcher snapshots the topic's subscriber list under the read lock
/// and delivers off-lock. Mailboxes are bounded: a full one blocks the
/// dispatcher until the subscriber drains, never drops. Delivery is FIFO per
/// topic. The dispatcher exits once every `Bus` clone is gone.
#[derive(Clone)]
pub struct Bus {
    topics: Arc<RwLock<SubscriberTable>>,
    dispatch: Sender<Event>,
}

impl Bus {
    pub fn new() -> Self {
        let topics: Arc<RwLock<SubscriberTable>> = Arc::new(RwLock::new(HashMap::new()));
        let (dispatch, inbox) = unbounded::<Event>();

        let table = Arc::clone(&topics);
        thread::spawn(move || {
            for event in inbox.iter() {
                let subs = {
                    let table = table.read().unwrap();
                    table.get(&event.topic()).cloned().unwrap_or_default()
                };
                for sub in subs {
                    // A dropped mailbox is simply skipped.
                    let _ = sub.send(event.clone());
                }
            }
        });

        Self { topics, dispatch }
    }

    /// A bounded mailbox suitable for `subscribe`. One mailbox may be
    /// registered under several topics.
    pub fn mailbox(cap: usize) -> (Sender<Event>, Receiver<Event>) {
        bounded(cap)
    }

    pub fn subscribe(&self, topic: Topic, sub: Sender<Event>) {
        self.topics.write().unwrap().entry(topic).or_default().push(sub);
    }

    pub fn unsubscribe(&self, topic: Topic, sub: &Sender<Event>) {
        if let Some(subs) = self.topics.write().unwrap().get_mut(&topic) {
            if let Some(idx) = subs.iter().position(|s| s.same_channel(sub)) {
                subs.remove(idx);
            }
        }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.dispatch.send(event);
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
