//! In-process rendezvous table.

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{
    Args, Array, CancellationManager, CancellationToken, Delivery, DoneCallback, Error,
    ParsedKey, Rendezvous, Result,
};

/// Number of independently locked shards of the key table.
const SHARD_COUNT: usize = 16;

struct PendingSend {
    args: Args,
    value: Array,
    is_dead: bool,
}

struct PendingRecv {
    id: u64,
    args: Args,
    done: DoneCallback,
    cancel: Option<(Arc<CancellationManager>, CancellationToken)>,
}

impl PendingRecv {
    fn complete(self, result: Result<Delivery>) {
        if let Some((manager, token)) = &self.cancel {
            manager.deregister_callback(*token);
        }
        (self.done)(result);
    }
}

/// One key's queue holds only sends or only receives, in arrival order.
enum Item {
    Send(PendingSend),
    Recv(PendingRecv),
}

type Shard = HashMap<ParsedKey, VecDeque<Item>>;

/// A rendezvous limited to producers and consumers in the local process.
///
/// Locking is per shard, not per key: keys are spread over [`SHARD_COUNT`]
/// mutexes, so two keys hashing to the same shard serialize their table
/// updates. Critical sections only touch the key's queue, and callbacks never
/// run while a shard lock is held.
pub struct LocalRendezvous {
    shards: Box<[Mutex<Shard>]>,
    hasher: RandomState,
    status: Mutex<Option<Error>>,
    next_waiter_id: AtomicU64,
    this: Weak<LocalRendezvous>,
}

impl LocalRendezvous {
    /// An empty table, shared behind an `Arc`.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
            status: Mutex::new(None),
            next_waiter_id: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    /// Number of queued sends and receives across all keys.
    pub fn pending_len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().values().map(VecDeque::len).sum::<usize>())
            .sum()
    }

    /// The abort status, if [`Rendezvous::start_abort`] has been called.
    pub fn abort_status(&self) -> Option<Error> {
        self.status.lock().clone()
    }

    fn shard(&self, key: &ParsedKey) -> &Mutex<Shard> {
        let index = (self.hasher.hash_one(key) % SHARD_COUNT as u64) as usize;
        &self.shards[index]
    }

    /// Remove and return the oldest item under `key` if it is a send.
    fn take_send(shard: &mut Shard, key: &ParsedKey) -> Option<PendingSend> {
        let queue = shard.get_mut(key)?;
        let sent = match queue.pop_front() {
            Some(Item::Send(sent)) => sent,
            Some(other) => {
                queue.push_front(other);
                return None;
            }
            None => return None,
        };
        if queue.is_empty() {
            shard.remove(key);
        }
        Some(sent)
    }

    /// Remove and return the oldest item under `key` if it is a receive.
    fn take_recv(shard: &mut Shard, key: &ParsedKey) -> Option<PendingRecv> {
        let queue = shard.get_mut(key)?;
        let waiter = match queue.pop_front() {
            Some(Item::Recv(waiter)) => waiter,
            Some(other) => {
                queue.push_front(other);
                return None;
            }
            None => return None,
        };
        if queue.is_empty() {
            shard.remove(key);
        }
        Some(waiter)
    }

    /// Withdraw the receive `id` under `key`, if it is still waiting.
    fn cancel_waiter(&self, key: &ParsedKey, id: u64) {
        let waiter = {
            let mut shard = self.shard(key).lock();
            let Some(queue) = shard.get_mut(key) else {
                return;
            };
            let Some(position) = queue
                .iter()
                .position(|item| matches!(item, Item::Recv(w) if w.id == id))
            else {
                return;
            };
            let removed = queue.remove(position);
            if queue.is_empty() {
                shard.remove(key);
            }
            match removed {
                Some(Item::Recv(waiter)) => waiter,
                _ => return,
            }
        };
        tracing::debug!(%key, "pending receive cancelled");
        // The manager already dropped this callback while firing it.
        (waiter.done)(Err(Error::canceled(format!("receive of {key} was cancelled"))));
    }

    /// Empty every shard; returns the pending receives and the number of
    /// unconsumed sends that were discarded.
    fn drain(&self) -> (Vec<PendingRecv>, usize) {
        let mut waiters = Vec::new();
        let mut dropped_sends = 0usize;
        for shard in self.shards.iter() {
            let drained: Vec<VecDeque<Item>> = shard.lock().drain().map(|(_, q)| q).collect();
            for item in drained.into_iter().flatten() {
                match item {
                    Item::Recv(waiter) => waiters.push(waiter),
                    Item::Send(_) => dropped_sends += 1,
                }
            }
        }
        (waiters, dropped_sends)
    }

    fn abort_pending(&self, status: &Error) {
        let (waiters, dropped_sends) = self.drain();
        tracing::warn!(
            %status,
            waiters = waiters.len(),
            dropped_sends,
            "rendezvous aborted"
        );
        for waiter in waiters {
            waiter.complete(Err(status.clone()));
        }
    }
}

impl Rendezvous for LocalRendezvous {
    fn send(&self, key: &ParsedKey, args: &Args, value: Array, is_dead: bool) -> Result<()> {
        tracing::trace!(%key, is_dead, bytes = value.total_bytes(), "send");

        let waiter = {
            let mut shard = self.shard(key).lock();
            if let Some(status) = self.status.lock().clone() {
                return Err(status);
            }
            match Self::take_recv(&mut shard, key) {
                Some(waiter) => waiter,
                None => {
                    shard
                        .entry(key.clone())
                        .or_default()
                        .push_back(Item::Send(PendingSend {
                            args: args.clone(),
                            value,
                            is_dead,
                        }));
                    return Ok(());
                }
            }
        };

        let recv_args = waiter.args.clone();
        waiter.complete(Ok(Delivery {
            send_args: args.clone(),
            recv_args,
            value,
            is_dead,
        }));
        Ok(())
    }

    fn recv_async(&self, key: &ParsedKey, args: &Args, done: DoneCallback) {
        tracing::trace!(%key, "recv");

        let mut shard = self.shard(key).lock();
        if let Some(status) = self.status.lock().clone() {
            drop(shard);
            done(Err(status));
            return;
        }

        if let Some(sent) = Self::take_send(&mut shard, key) {
            drop(shard);
            done(Ok(Delivery {
                send_args: sent.args,
                recv_args: args.clone(),
                value: sent.value,
                is_dead: sent.is_dead,
            }));
            return;
        }

        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let cancel = match &args.cancellation {
            Some(manager) => {
                let this = self.this.clone();
                let cancel_key = key.clone();
                let registered = manager.register_callback(move || {
                    if let Some(table) = this.upgrade() {
                        table.cancel_waiter(&cancel_key, id);
                    }
                });
                match registered {
                    Some(token) => Some((Arc::clone(manager), token)),
                    None => {
                        drop(shard);
                        done(Err(Error::canceled(format!("receive of {key} was cancelled"))));
                        return;
                    }
                }
            }
            None => None,
        };

        shard
            .entry(key.clone())
            .or_default()
            .push_back(Item::Recv(PendingRecv {
                id,
                args: args.clone(),
                done,
                cancel,
            }));
    }

    fn start_abort(&self, status: Error) {
        let status = {
            let mut current = self.status.lock();
            match &*current {
                // Keep the first abort status.
                Some(first) => first.clone(),
                None => {
                    *current = Some(status.clone());
                    status
                }
            }
        };
        self.abort_pending(&status);
    }
}

impl Drop for LocalRendezvous {
    fn drop(&mut self) {
        let (waiters, dropped_sends) = self.drain();
        if dropped_sends > 0 {
            tracing::debug!(dropped_sends, "local rendezvous dropped with unconsumed sends");
        }
        if waiters.is_empty() {
            return;
        }
        let status = Error::aborted("local rendezvous dropped with pending receives");
        tracing::warn!(%status, waiters = waiters.len(), "rendezvous aborted");
        for waiter in waiters {
            waiter.complete(Err(status.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameAndIter, RendezvousExt};
    use std::time::Duration;

    fn key(name: &str) -> ParsedKey {
        ParsedKey::from_parts("/cpu:0", 1, "/cpu:1", name, FrameAndIter::default()).unwrap()
    }

    #[test]
    fn send_is_queued_until_received() {
        let table = LocalRendezvous::new();
        table
            .send(&key("a"), &Args::new(), Array::i64_vector(&[1]), false)
            .unwrap();
        assert_eq!(table.pending_len(), 1);

        let (tx, rx) = std::sync::mpsc::channel();
        table.recv_async(&key("a"), &Args::new(), Box::new(move |r| tx.send(r).unwrap()));
        let delivery = rx.try_recv().unwrap().unwrap();
        assert_eq!(delivery.value.to_i64s().unwrap(), vec![1]);
        assert_eq!(table.pending_len(), 0);
    }

    #[test]
    fn sends_on_one_key_are_received_in_order() {
        let table = LocalRendezvous::new();
        for v in 0..3 {
            table
                .send(&key("seq"), &Args::new(), Array::i64_vector(&[v]), false)
                .unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = std::sync::mpsc::channel();
            table.recv_async(&key("seq"), &Args::new(), Box::new(move |r| tx.send(r).unwrap()));
            seen.push(rx.try_recv().unwrap().unwrap().value.to_i64s().unwrap()[0]);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn keys_sharing_a_shard_stay_independent() {
        let table = LocalRendezvous::new();
        // Seventeen keys over sixteen shards: two must collide.
        let keys: Vec<ParsedKey> = (0..=SHARD_COUNT).map(|i| key(&format!("k{i}"))).collect();
        let (a, b) = keys
            .iter()
            .enumerate()
            .find_map(|(i, a)| {
                keys[i + 1..]
                    .iter()
                    .find(|b| std::ptr::eq(table.shard(a), table.shard(b)))
                    .map(|b| (a, b))
            })
            .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        table.recv_async(b, &Args::new(), Box::new(move |r| {
            let _ = tx.send(r.map(|d| d.is_dead));
        }));
        table.send(a, &Args::new(), Array::i64_vector(&[1]), false).unwrap();

        assert!(rx.try_recv().is_err(), "a send on one key must not satisfy another");
        assert_eq!(table.pending_len(), 2);
    }

    #[test]
    fn abort_keeps_first_status() {
        let table = LocalRendezvous::new();
        table.start_abort(Error::aborted("first"));
        table.start_abort(Error::aborted("second"));
        let err = table
            .send(&key("a"), &Args::new(), Array::i64_vector(&[1]), false)
            .unwrap_err();
        assert_eq!(err.message(), "first");
    }

    #[derive(Clone, Default)]
    struct LogBuf(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Run `f` with every event at debug and above captured as text.
    fn captured_logs(f: impl FnOnce()) -> String {
        let buf = LogBuf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buf.0.lock().clone();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[test]
    fn dropping_with_only_sends_is_not_an_abort() {
        let logs = captured_logs(|| {
            let table = LocalRendezvous::new();
            table
                .send(&key("unread"), &Args::new(), Array::i64_vector(&[1]), false)
                .unwrap();
            drop(table);
        });
        assert!(logs.contains("unconsumed sends"), "{logs}");
        assert!(!logs.contains("rendezvous aborted"), "{logs}");
        assert!(!logs.contains("WARN"), "{logs}");
    }

    #[test]
    fn dropping_with_waiters_aborts_them() {
        let (tx, rx) = std::sync::mpsc::channel();
        let logs = captured_logs(|| {
            let table = LocalRendezvous::new();
            table.recv_async(&key("w"), &Args::new(), Box::new(move |r| tx.send(r).unwrap()));
            drop(table);
        });
        assert_eq!(rx.recv().unwrap().unwrap_err().code(), crate::ErrorCode::Aborted);
        assert!(logs.contains("rendezvous aborted"), "{logs}");
    }

    #[tokio::test]
    async fn timed_out_receive_leaves_no_waiter() {
        let table = LocalRendezvous::new();
        let err = table
            .recv(&key("late"), &Args::new(), Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::DeadlineExceeded);
        assert_eq!(table.pending_len(), 0);
    }
}
