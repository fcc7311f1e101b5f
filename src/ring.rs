// src/ring.rs

//! The bounded ring queue (component C2): the MPSC→SPSC handoff of pending
//! requests between callers, the writer loop, and the reader loop of one wire.
//!
//! Grounded on the `valkey-glide` `Pipeline`/`PipelineSink` pattern (an
//! in-flight queue fed by a channel, drained in write order, matched to
//! replies in the same order) from
//! `examples/other_examples/0a13ec56_valkey-io-valkey-glide__glide-core-redis-rs-redis-src-aio-multiplexed_connection.rs.rs`,
//! reshaped into the explicit four-channel slot model spec §4.2 describes so
//! the ring-integrity invariant (`free + writer_pending + reader_pending +
//! in_flight == cap` at all times) is a structural property of the types
//! rather than an emergent one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::command::Command;
use crate::error::Error;
use crate::resp::Message;

type CompletionTx = oneshot::Sender<Result<Message, Error>>;
pub type CompletionRx = oneshot::Receiver<Result<Message, Error>>;

struct Slot {
    cmd: parking_lot::Mutex<Option<Command>>,
    completion: parking_lot::Mutex<Option<CompletionTx>>,
    pinned: AtomicBool,
}

/// A fixed-capacity ring of `2^scale` slots. Four logical channels move slot
/// indices between callers, the writer loop, and the reader loop:
///
/// - `free`: indices available for a new `put_*` call.
/// - `writer_pending`: indices with an encoded command waiting to be flushed.
/// - `reader_pending`: indices whose command has been written and is awaiting a reply.
///
/// A slot's "completion" sender *is* the fourth channel: once the reader
/// decodes a reply it sends directly to the caller's oneshot, so there is no
/// separate completion queue to drain.
pub struct RingQueue {
    slots: Vec<Arc<Slot>>,
    free_tx: mpsc::Sender<usize>,
    free_rx: Mutex<mpsc::Receiver<usize>>,
    writer_tx: mpsc::UnboundedSender<usize>,
    writer_rx: Mutex<mpsc::UnboundedReceiver<usize>>,
    reader_tx: mpsc::UnboundedSender<usize>,
    reader_rx: Mutex<mpsc::UnboundedReceiver<usize>>,
    cap: usize,
    closed: parking_lot::Mutex<Option<Error>>,
}

/// An item the writer loop is ready to encode.
pub struct WriteItem {
    pub slot: usize,
    pub cmd: Command,
}

impl RingQueue {
    /// Creates a ring with capacity `2^scale`, per spec §6 `RingScaleEachConn`.
    pub fn new(scale: u32) -> Self {
        let cap = 1usize << scale;
        let (free_tx, free_rx) = mpsc::channel(cap);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (reader_tx, reader_rx) = mpsc::unbounded_channel();
        let slots = (0..cap)
            .map(|_| {
                Arc::new(Slot {
                    cmd: parking_lot::Mutex::new(None),
                    completion: parking_lot::Mutex::new(None),
                    pinned: AtomicBool::new(false),
                })
            })
            .collect();
        for i in 0..cap {
            // Fill the free channel synchronously; capacity == cap so this never blocks.
            free_tx.try_send(i).expect("ring capacity matches slot count");
        }
        RingQueue {
            slots,
            free_tx,
            free_rx: Mutex::new(free_rx),
            writer_tx,
            writer_rx: Mutex::new(writer_rx),
            reader_tx,
            reader_rx: Mutex::new(reader_rx),
            cap,
            closed: parking_lot::Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Blocks until a slot is free, installs `cmd`, and returns the caller's
    /// completion channel. Enqueues the slot onto `writer_pending` in the same
    /// order callers arrived, preserving the FIFO contract of spec §4.2.
    pub async fn put_one(&self, cmd: Command) -> Result<CompletionRx, Error> {
        self.enqueue(cmd).await.map(|(_, rx)| rx)
    }

    /// Like [`RingQueue::put_one`], but also returns the slot index so a caller
    /// that pinned `cmd` can later call [`RingQueue::release_pinned`] once it is
    /// done with the command's backing storage (spec §3 pinning).
    pub async fn acquire(&self, cmd: Command) -> Result<(usize, CompletionRx), Error> {
        self.enqueue(cmd.pin()).await
    }

    async fn enqueue(&self, cmd: Command) -> Result<(usize, CompletionRx), Error> {
        if let Some(err) = self.closed.lock().clone() {
            return Err(err);
        }
        let slot_idx = {
            let mut rx = self.free_rx.lock().await;
            rx.recv().await.ok_or_else(|| Error::closed("ring queue is shut down"))?
        };
        let (tx, rx) = oneshot::channel();
        let pinned = cmd.pinned();
        let slot = &self.slots[slot_idx];
        *slot.cmd.lock() = Some(cmd);
        *slot.completion.lock() = Some(tx);
        slot.pinned.store(pinned, Ordering::Relaxed);
        self.writer_tx
            .send(slot_idx)
            .map_err(|_| Error::closed("writer loop has stopped"))?;
        Ok((slot_idx, rx))
    }

    /// `put_multi`: enqueues several commands as one contiguous FIFO run so no
    /// other caller's command can interleave between them on the wire (spec
    /// §5 "`DoMulti` is guaranteed to be written contiguously").
    pub async fn put_multi(&self, cmds: Vec<Command>) -> Result<Vec<CompletionRx>, Error> {
        let mut out = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            out.push(self.put_one(cmd).await?);
        }
        Ok(out)
    }

    /// Nonblocking peek+advance consumed by the writer loop: moves a slot from
    /// `writer_pending` to `reader_pending` and returns its command for encoding.
    pub fn next_write_cmd(&self) -> Option<WriteItem> {
        let mut rx = self.writer_rx.try_lock().ok()?;
        let slot = rx.try_recv().ok()?;
        let cmd = self.slots[slot].cmd.lock().take()?;
        self.reader_tx.send(slot).ok();
        Some(WriteItem { slot, cmd })
    }

    /// Blocking form for an idle writer loop: waits for at least one command,
    /// draining the rest non-blockingly once woken (spec §4.3 writer loop).
    pub async fn wait_for_write(&self) -> Option<WriteItem> {
        let slot = {
            let mut rx = self.writer_rx.lock().await;
            rx.recv().await?
        };
        let cmd = self.slots[slot].cmd.lock().take()?;
        self.reader_tx.send(slot).ok();
        Some(WriteItem { slot, cmd })
    }

    /// Nonblocking acquire of the head of `reader_pending`, for the reader loop
    /// to match against the next decoded reply.
    pub fn next_result_slot(&self) -> Option<usize> {
        let mut rx = self.reader_rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Delivers `result` to the slot's caller and, unless pinned, returns the
    /// slot to the free list immediately — the oneshot delivery and the
    /// free-list return happen atomically from the ring's point of view, so
    /// the `free + writer_pending + reader_pending + in_flight == cap`
    /// invariant holds at every observable instant.
    pub fn deliver(&self, slot_idx: usize, result: Result<Message, Error>) {
        let slot = &self.slots[slot_idx];
        if let Some(tx) = slot.completion.lock().take() {
            let _ = tx.send(result);
        }
        if !slot.pinned.load(Ordering::Relaxed) {
            let _ = self.free_tx.try_send(slot_idx);
        }
    }

    /// Explicitly releases a pinned slot back to the free list once its caller
    /// is done with the command's backing storage (spec §3 pinning).
    pub fn release_pinned(&self, slot_idx: usize) {
        self.slots[slot_idx].pinned.store(false, Ordering::Relaxed);
        let _ = self.free_tx.try_send(slot_idx);
    }

    /// Drains every slot still holding a writer-pending or reader-pending
    /// command and fails its caller with `err`, per the wire's shutdown
    /// contract (spec §4.2/§4.3: "shutdown drains the writer-pending channel
    /// and signals `ConnectionClosed` to every slot it owns").
    pub fn shutdown(&self, err: Error) {
        *self.closed.lock() = Some(err.clone());
        if let Ok(mut rx) = self.writer_rx.try_lock() {
            while let Ok(slot_idx) = rx.try_recv() {
                self.fail_slot(slot_idx, err.clone());
            }
        }
        if let Ok(mut rx) = self.reader_rx.try_lock() {
            while let Ok(slot_idx) = rx.try_recv() {
                self.fail_slot(slot_idx, err.clone());
            }
        }
    }

    fn fail_slot(&self, slot_idx: usize, err: Error) {
        let slot = &self.slots[slot_idx];
        slot.cmd.lock().take();
        if let Some(tx) = slot.completion.lock().take() {
            let _ = tx.send(Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn cmd(name: &'static str) -> Command {
        Command::new([Bytes::from_static(name.as_bytes())])
    }

    #[tokio::test]
    async fn put_then_write_then_deliver_round_trips() {
        let ring = RingQueue::new(2);
        let rx = ring.put_one(cmd("PING")).await.unwrap();
        let item = ring.next_write_cmd().expect("command queued for write");
        assert_eq!(item.cmd.name(), "PING");
        ring.deliver(item.slot, Ok(Message::ok()));
        let result = rx.await.unwrap().unwrap();
        assert!(!result.is_nil());
    }

    #[tokio::test]
    async fn ring_integrity_holds_under_fuzzed_traffic() {
        let cap_scale = 3u32;
        let ring = Arc::new(RingQueue::new(cap_scale));
        let cap = ring.capacity();

        // Saturate the ring, then drain it completely; at every step the sum
        // of free + in-flight slots must equal `cap` (property 2 of spec §8).
        let mut receivers = Vec::new();
        for _ in 0..cap {
            receivers.push(ring.put_one(cmd("PING")).await.unwrap());
        }

        let mut writes = Vec::new();
        while let Some(item) = ring.next_write_cmd() {
            writes.push(item);
        }
        assert_eq!(writes.len(), cap);

        for item in writes {
            ring.deliver(item.slot, Ok(Message::ok()));
        }
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        // All slots should be free again, so a fresh full batch must succeed
        // without blocking.
        let mut second_round = Vec::new();
        for _ in 0..cap {
            second_round.push(
                tokio::time::timeout(std::time::Duration::from_millis(50), ring.put_one(cmd("PING")))
                    .await
                    .expect("slots were returned to the free list")
                    .unwrap(),
            );
        }
        assert_eq!(second_round.len(), cap);
    }

    #[tokio::test]
    async fn fifo_write_order_matches_submission_order() {
        let ring = RingQueue::new(2);
        let _r1 = ring.put_one(cmd("FIRST")).await.unwrap();
        let _r2 = ring.put_one(cmd("SECOND")).await.unwrap();
        assert_eq!(ring.next_write_cmd().unwrap().cmd.name(), "FIRST");
        assert_eq!(ring.next_write_cmd().unwrap().cmd.name(), "SECOND");
    }

    #[tokio::test]
    async fn pinned_slot_is_not_recycled_until_released() {
        let ring = RingQueue::new(1); // cap == 2
        let rx = ring.put_one(cmd("GET").pin()).await.unwrap();
        let item = ring.next_write_cmd().unwrap();
        let slot = item.slot;
        ring.deliver(slot, Ok(Message::ok()));
        rx.await.unwrap().unwrap();

        // Only one free slot remains since the pinned one was not returned.
        let _held = ring.put_one(cmd("PING")).await.unwrap();
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), ring.put_one(cmd("PING")))
                .await
                .is_err()
        );

        ring.release_pinned(slot);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), ring.put_one(cmd("PING")))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn shutdown_fails_pending_slots() {
        let ring = RingQueue::new(2);
        let rx = ring.put_one(cmd("GET")).await.unwrap();
        ring.shutdown(Error::closed("connection lost"));
        let result = rx.await.unwrap();
        assert!(result.is_err());
    }
}
