// ===============================
// src/recorder.rs
// ===============================
//
// Light JSONL journal:
// - every Event is appended as one line
// - BufWriter, flushed every 1s and every 1000 events
// - parent directory created on open
// - on write failure the file is reopened and the write retried once
//
// ENV: `RECORD_FILE=/path/to/events.jsonl` enables it (see config.rs).
//
use std::path::Path;
use std::sync::Arc;

use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::{Deal, Event};
use crate::order::{OrderObserver, OrderState};

const FLUSH_EVERY_N_EVENTS: u32 = 1000;

async fn open_writer(path: &str) -> std::io::Result<BufWriter<tokio::fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<tokio::fs::File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, journal disabled");
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(w) => writer = w,
                        Err(e2) => {
                            error!(?e2, "recorder: reopen failed, drop event");
                            continue;
                        }
                    }
                    if let Err(e2) = write_line(&mut writer, &line).await {
                        error!(?e2, "recorder: write failed again after reopen, drop event");
                        continue;
                    }
                }
                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }
            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

/// Cheap handle to a running recorder task.
#[derive(Clone)]
pub struct Journal {
    tx: mpsc::Sender<Event>,
}

impl Journal {
    pub fn spawn(path: impl Into<String>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(10_000);
        let handle = tokio::spawn(run(rx, path.into()));
        (Self { tx }, handle)
    }

    /// Handle over a caller-owned channel.
    pub fn from_sender(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Never blocks; a full or closed journal drops the event.
    pub fn record(&self, ev: Event) {
        if let Err(e) = self.tx.try_send(ev) {
            warn!(error = %e, "recorder: event dropped");
        }
    }
}

/// Journals every deal of the orders it observes.
pub struct RecordingObserver {
    journal: Journal,
}

impl RecordingObserver {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self { journal })
    }
}

impl OrderObserver for RecordingObserver {
    fn on_deal(&self, _order: &OrderState, deal: &Deal) {
        self.journal.record(Event::Deal(deal.clone()));
    }
}
