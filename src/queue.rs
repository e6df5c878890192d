//! # Batching Queue
//!
//! Cells destined for the same logical sink are buffered and flushed
//! together, mixing traffic and bounding per-cell write overhead. One
//! queue instance exists per traffic class (relay, proxy request, proxy
//! response); each is an actor owning its sink map, with a cheap-to-clone
//! [`Queue`] handle in front.
//!
//! ## Contract
//!
//! - `enqueue` appends to a per-sink FIFO and never blocks on the sink.
//! - A sink flushes when it reaches `batch_size` items, or on the next
//!   timeout tick. Each wake flushes exactly one ready sink, selected
//!   round-robin, so no sink starves another.
//! - Items on one sink reach the writer in enqueue order. Nothing is
//!   guaranteed across sinks.
//! - Write failures are routed to a paired error-handler task which
//!   reports back toward the item's source as an ERROR directive on a
//!   *different* queue, so an error path can never deadlock on the queue
//!   that produced it.
//!
//! Sink keys are u64: circuit IDs for relay traffic, connection IDs for
//! proxy traffic. The ID ranges are disjoint, so one map serves both.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cell::{self, Directive};

/// Command channel capacity for a queue actor. Back-pressure is applied
/// to enqueuers when full.
const QUEUE_CHANNEL_SIZE: usize = 256;

/// Capacity of the failed-item channel toward the error handler.
const ERROR_CHANNEL_SIZE: usize = 64;

/// Byte-oriented destination a queue can flush to: a peer connection or
/// an exit-side destination socket.
#[async_trait]
pub trait CellWriter: Send + Sync {
    /// Write the whole buffer, bounded by the writer's deadline.
    async fn write_bytes(&self, buf: &[u8]) -> std::io::Result<()>;

    /// Shut down the underlying transport.
    async fn close(&self) -> std::io::Result<()>;

    /// Replace the deadline applied to subsequent writes.
    fn set_write_timeout(&self, timeout: Duration);
}

/// Shared handle to a queue destination.
pub type WriterRef = Arc<dyn CellWriter>;

/// One buffered payload with its destination and error routing.
pub struct Item {
    pub payload: Vec<u8>,
    pub dst: WriterRef,
    /// Connection the origin is reachable on; errors flushing this item
    /// are reported there. `None` suppresses error reporting.
    pub src: Option<WriterRef>,
    /// Circuit ID to stamp on an ERROR directive reported to `src`: the
    /// ID the origin knows this circuit by.
    pub reply_id: u64,
}

/// A payload the queue failed to deliver, handed to the error handler.
pub struct FailedItem {
    pub item: Item,
    pub error: String,
}

enum QueueCommand {
    Enqueue {
        key: u64,
        item: Item,
    },
    Close {
        key: u64,
        final_item: Option<Item>,
        drop_writer: bool,
        dst: Option<WriterRef>,
    },
    Quit,
}

/// Handle to a batching queue actor. Cheap to clone.
#[derive(Clone)]
pub struct Queue {
    cmd_tx: mpsc::Sender<QueueCommand>,
    label: &'static str,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("label", &self.label).finish()
    }
}

impl Queue {
    /// Spawn the queue actor. The returned receiver carries items the
    /// actor failed to write; pair it with [`spawn_error_handler`].
    pub fn spawn(
        label: &'static str,
        batch_size: usize,
        timeout: Duration,
    ) -> (Self, mpsc::Receiver<FailedItem>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_CHANNEL_SIZE);
        let (err_tx, err_rx) = mpsc::channel(ERROR_CHANNEL_SIZE);
        let actor = QueueActor {
            label,
            batch_size: batch_size.max(1),
            write_timeout: timeout,
            sinks: HashMap::new(),
            rotation: VecDeque::new(),
            err_tx,
        };
        tokio::spawn(actor.run(cmd_rx, timeout));
        (Self { cmd_tx, label }, err_rx)
    }

    /// Append a payload to `key`'s FIFO.
    pub async fn enqueue(
        &self,
        key: u64,
        payload: Vec<u8>,
        dst: WriterRef,
        src: Option<WriterRef>,
        reply_id: u64,
    ) {
        let item = Item {
            payload,
            dst,
            src,
            reply_id,
        };
        if self
            .cmd_tx
            .send(QueueCommand::Enqueue { key, item })
            .await
            .is_err()
        {
            warn!(queue = self.label, key, "enqueue on stopped queue");
        }
    }

    /// Append an optional final payload, then retire the sink. With
    /// `drop_writer`, the destination writer is closed after the flush.
    pub async fn close_sink(
        &self,
        key: u64,
        final_payload: Option<Vec<u8>>,
        drop_writer: bool,
        dst: Option<WriterRef>,
        err_src: Option<WriterRef>,
    ) {
        let final_item = match (final_payload, dst.clone()) {
            (Some(payload), Some(dst)) => Some(Item {
                payload,
                dst,
                src: err_src,
                reply_id: key,
            }),
            _ => None,
        };
        if self
            .cmd_tx
            .send(QueueCommand::Close {
                key,
                final_item,
                drop_writer,
                dst,
            })
            .await
            .is_err()
        {
            warn!(queue = self.label, key, "close on stopped queue");
        }
    }

    /// Stop the actor. Buffered items are dropped.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(QueueCommand::Quit).await;
    }
}

#[derive(Default)]
struct Sink {
    items: VecDeque<Item>,
    closing: bool,
    drop_writer: bool,
    /// Writer to close on retirement; the last destination seen.
    writer: Option<WriterRef>,
    in_rotation: bool,
}

struct QueueActor {
    label: &'static str,
    batch_size: usize,
    /// Deadline applied to every writer before a flush; flushes are
    /// bounded by the same interval that caps batching latency.
    write_timeout: Duration,
    sinks: HashMap<u64, Sink>,
    rotation: VecDeque<u64>,
    err_tx: mpsc::Sender<FailedItem>,
}

impl QueueActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<QueueCommand>, timeout: Duration) {
        let mut ticker = tokio::time::interval(timeout);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(QueueCommand::Enqueue { key, item }) => {
                        let sink = self.sinks.entry(key).or_default();
                        sink.writer = Some(item.dst.clone());
                        sink.items.push_back(item);
                        if !sink.in_rotation {
                            sink.in_rotation = true;
                            self.rotation.push_back(key);
                        }
                        if sink.items.len() >= self.batch_size {
                            self.flush_sink(key).await;
                        }
                    }
                    Some(QueueCommand::Close { key, final_item, drop_writer, dst }) => {
                        let sink = self.sinks.entry(key).or_default();
                        if let Some(item) = final_item {
                            sink.writer = Some(item.dst.clone());
                            sink.items.push_back(item);
                        } else if sink.writer.is_none() {
                            sink.writer = dst;
                        }
                        sink.closing = true;
                        sink.drop_writer |= drop_writer;
                        // Teardown flushes promptly rather than waiting a tick.
                        self.flush_sink(key).await;
                    }
                    Some(QueueCommand::Quit) | None => {
                        debug!(queue = self.label, "queue actor stopping");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    self.flush_next_ready().await;
                }
            }
        }
    }

    /// Flush one ready sink, round-robin over sinks with buffered items.
    async fn flush_next_ready(&mut self) {
        let mut scanned = self.rotation.len();
        while scanned > 0 {
            scanned -= 1;
            let Some(key) = self.rotation.pop_front() else {
                return;
            };
            let ready = match self.sinks.get(&key) {
                Some(sink) => !sink.items.is_empty() || sink.closing,
                None => continue,
            };
            self.rotation.push_back(key);
            if ready {
                self.flush_sink(key).await;
                return;
            }
        }
    }

    /// Write out everything buffered for `key`, in order. On a write
    /// failure the failed item and the rest of the batch are routed to
    /// the error handler.
    async fn flush_sink(&mut self, key: u64) {
        let Some(sink) = self.sinks.get_mut(&key) else {
            return;
        };
        let mut items = std::mem::take(&mut sink.items);
        let flushed = items.len();

        while let Some(item) = items.pop_front() {
            item.dst.set_write_timeout(self.write_timeout);
            if let Err(e) = item.dst.write_bytes(&item.payload).await {
                warn!(queue = self.label, key, error = %e, "sink flush failed");
                let reason = e.to_string();
                for failed in std::iter::once(item).chain(items.drain(..)) {
                    if self
                        .err_tx
                        .send(FailedItem {
                            item: failed,
                            error: reason.clone(),
                        })
                        .await
                        .is_err()
                    {
                        trace!(queue = self.label, "error handler gone; dropping failed item");
                    }
                }
                break;
            }
        }
        trace!(queue = self.label, key, flushed, "sink flushed");

        let Some(sink) = self.sinks.get_mut(&key) else {
            return;
        };
        // Items enqueued while the flush awaited stay buffered unless the
        // sink is retiring.
        if sink.closing && sink.items.is_empty() {
            let sink = self.sinks.remove(&key).expect("sink present");
            if sink.drop_writer {
                if let Some(writer) = sink.writer {
                    let _ = writer.close().await;
                }
            }
        }
    }
}

/// Drain failed items from `err_rx`, reporting each back toward its
/// origin as an ERROR directive enqueued on `report_queue`.
///
/// Runs as its own task so a failing sink can never deadlock the queue
/// that was flushing it.
pub fn spawn_error_handler(
    mut err_rx: mpsc::Receiver<FailedItem>,
    report_queue: Queue,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(failed) = err_rx.recv().await {
            let FailedItem { item, error } = failed;
            let Some(src) = item.src else {
                debug!(error = %error, "dropping failed item with no origin");
                continue;
            };
            let directive = Directive::Error {
                reason: format!("relay write failed: {error}"),
            };
            match cell::encode_dir(item.reply_id, &directive) {
                Ok(report) => {
                    report_queue
                        .enqueue(item.reply_id, report, src, None, item.reply_id)
                        .await;
                }
                Err(e) => warn!(error = %e, "could not encode error directive"),
            }
        }
    })
}
