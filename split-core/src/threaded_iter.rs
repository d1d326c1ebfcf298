// split-core/src/threaded_iter.rs

//! A background producer feeding a bounded, buffer-recycling queue.
//!
//! [`ThreadedIter`] runs a [`Producer`] on its own thread. Produced items flow
//! to the consumer through a bounded channel; items the consumer is done with
//! can be handed back with [`ThreadedIter::recycle`] so the producer refills
//! them in place instead of allocating.
//!
//! The producer thread is a small state machine:
//!
//! ```text
//!   Produce --(next() == false | fault)--> Idle
//!      ^  \                                 |
//!      |   `------------ Rewind ------------+
//!      `--- Resume <-- (ack, wait) <--------'
//!   any state --Shutdown--> exit
//! ```
//!
//! A rewind is a barrier: the producer acknowledges it and parks, the consumer
//! drains everything that was produced before the rewind into the free list,
//! and only then lets the producer resume. Nothing produced before a rewind
//! is ever observed after it.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Select, Sender, TryRecvError};
use tracing::{debug, warn};

use crate::error::{Result, SplitError};

/// Fills cells for a [`ThreadedIter`].
pub trait Producer<T>: Send {
    /// Produces the next item into `cell`.
    ///
    /// `cell` holds a recycled item when one is available; its old contents
    /// must be overwritten. Returns `Ok(false)` at the end of the stream.
    fn next(&mut self, cell: &mut Option<T>) -> Result<bool>;

    /// Restarts the stream from the beginning.
    fn before_first(&mut self) -> Result<()> {
        Err(SplitError::pipeline("producer does not support before_first"))
    }
}

/// A [`Producer`] built from a pair of closures.
pub struct FnProducer<N, B> {
    next: N,
    before_first: B,
}

impl<N, B> FnProducer<N, B> {
    /// Wraps `next`, which fills one cell, and `before_first`, which restarts
    /// the stream.
    pub fn new(next: N, before_first: B) -> Self {
        Self { next, before_first }
    }
}

impl<T, N, B> Producer<T> for FnProducer<N, B>
where
    N: FnMut(&mut Option<T>) -> Result<bool> + Send,
    B: FnMut() -> Result<()> + Send,
{
    fn next(&mut self, cell: &mut Option<T>) -> Result<bool> {
        (self.next)(cell)
    }

    fn before_first(&mut self) -> Result<()> {
        (self.before_first)()
    }
}

enum Message<T> {
    Item(T),
    End,
    Fault(SplitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Rewind,
    Resume,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumerState {
    Running,
    Ended,
    Faulted,
}

/// Hands items back to a [`ThreadedIter`]'s free list from anywhere.
pub struct Recycler<T> {
    free_tx: Sender<T>,
}

impl<T> Clone for Recycler<T> {
    fn clone(&self) -> Self {
        Self {
            free_tx: self.free_tx.clone(),
        }
    }
}

impl<T> Recycler<T> {
    /// Returns `item` to the pipeline so the producer can refill it.
    pub fn recycle(&self, item: T) {
        // The producer may already be gone; the item is then simply dropped.
        let _ = self.free_tx.send(item);
    }
}

/// A single-producer prefetch pipeline.
pub struct ThreadedIter<T: Send + 'static> {
    data_rx: Receiver<Message<T>>,
    free_tx: Sender<T>,
    control_tx: Sender<Signal>,
    ack_rx: Receiver<Result<()>>,
    worker: Option<JoinHandle<()>>,
    state: ConsumerState,
}

impl<T: Send + 'static> ThreadedIter<T> {
    /// Spawns the producer thread. At most `capacity` items (minimum 1) wait
    /// in the queue at any time.
    ///
    /// # Errors
    ///
    /// Returns a pipeline error if the thread cannot be spawned.
    pub fn new<P>(producer: P, capacity: usize) -> Result<Self>
    where
        P: Producer<T> + 'static,
    {
        let capacity = capacity.max(1);
        let (data_tx, data_rx) = channel::bounded(capacity);
        let (free_tx, free_rx) = channel::unbounded();
        let (control_tx, control_rx) = channel::unbounded();
        let (ack_tx, ack_rx) = channel::unbounded();

        let worker = ProducerLoop {
            producer,
            data_tx,
            free_rx,
            control_rx,
            ack_tx,
            spare: None,
            idle: false,
            faulted: false,
        };
        let handle = thread::Builder::new()
            .name("split-prefetch".to_string())
            .spawn(move || worker.run())
            .map_err(|e| SplitError::pipeline(format!("failed to spawn producer thread: {e}")))?;
        debug!(capacity, "started prefetch pipeline");

        Ok(Self {
            data_rx,
            free_tx,
            control_tx,
            ack_rx,
            worker: Some(handle),
            state: ConsumerState::Running,
        })
    }

    /// Spawns a pipeline over a pair of closures.
    pub fn from_fn<N, B>(next: N, before_first: B, capacity: usize) -> Result<Self>
    where
        N: FnMut(&mut Option<T>) -> Result<bool> + Send + 'static,
        B: FnMut() -> Result<()> + Send + 'static,
    {
        Self::new(FnProducer::new(next, before_first), capacity)
    }

    /// Blocks until the next item is available.
    ///
    /// Returns `Ok(None)` at the end of the stream. A producer fault is
    /// returned exactly once; afterwards the pipeline only yields `Ok(None)`.
    pub fn next(&mut self) -> Result<Option<T>> {
        if self.state != ConsumerState::Running {
            return Ok(None);
        }
        match self.data_rx.recv() {
            Ok(Message::Item(item)) => Ok(Some(item)),
            Ok(Message::End) => {
                self.state = ConsumerState::Ended;
                Ok(None)
            }
            Ok(Message::Fault(e)) => {
                self.state = ConsumerState::Faulted;
                Err(e)
            }
            Err(_) => {
                self.state = ConsumerState::Faulted;
                Err(SplitError::pipeline("producer thread exited unexpectedly"))
            }
        }
    }

    /// Returns an item to the free list.
    pub fn recycle(&self, item: T) {
        let _ = self.free_tx.send(item);
    }

    /// A handle for returning items from other threads.
    pub fn recycler(&self) -> Recycler<T> {
        Recycler {
            free_tx: self.free_tx.clone(),
        }
    }

    /// Restarts the producer from the beginning of its stream.
    ///
    /// Every item queued before the call is moved to the free list; the first
    /// item returned by `next` afterwards is the first item of the new pass.
    ///
    /// # Errors
    ///
    /// Returns the producer's fault if rewinding failed or a fault was still
    /// queued, and a pipeline error if the pipeline had already faulted.
    pub fn before_first(&mut self) -> Result<()> {
        if self.state == ConsumerState::Faulted {
            return Err(SplitError::pipeline("cannot rewind a faulted pipeline"));
        }
        self.signal(Signal::Rewind)?;
        let ack = match self.ack_rx.recv() {
            Ok(ack) => ack,
            Err(_) => {
                self.state = ConsumerState::Faulted;
                return Err(SplitError::pipeline("producer thread exited unexpectedly"));
            }
        };

        // The producer is parked until Resume, so the queue only holds items
        // from the previous pass.
        let mut queued_fault = None;
        loop {
            match self.data_rx.try_recv() {
                Ok(Message::Item(item)) => self.recycle(item),
                Ok(Message::End) => {}
                Ok(Message::Fault(e)) => queued_fault = Some(e),
                Err(_) => break,
            }
        }
        self.signal(Signal::Resume)?;

        let result = match queued_fault {
            Some(e) => Err(e),
            None => ack,
        };
        self.state = match result {
            Ok(()) => ConsumerState::Running,
            Err(_) => ConsumerState::Faulted,
        };
        debug!(ok = result.is_ok(), "prefetch pipeline rewound");
        result
    }

    fn signal(&mut self, signal: Signal) -> Result<()> {
        self.control_tx.send(signal).map_err(|_| {
            self.state = ConsumerState::Faulted;
            SplitError::pipeline("producer thread exited unexpectedly")
        })
    }
}

impl<T: Send + 'static> Drop for ThreadedIter<T> {
    fn drop(&mut self) {
        let _ = self.control_tx.send(Signal::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("prefetch producer thread panicked during shutdown");
            }
        }
        debug!("prefetch pipeline shut down");
    }
}

enum SendOutcome<T> {
    Sent,
    Interrupted(Signal, Message<T>),
    Disconnected,
}

struct ProducerLoop<T, P> {
    producer: P,
    data_tx: Sender<Message<T>>,
    free_rx: Receiver<T>,
    control_rx: Receiver<Signal>,
    ack_tx: Sender<Result<()>>,
    /// A free cell the producer holds on to between items.
    spare: Option<T>,
    /// The stream ended or faulted; only control signals are served.
    idle: bool,
    faulted: bool,
}

impl<T: Send, P: Producer<T>> ProducerLoop<T, P> {
    fn run(mut self) {
        loop {
            if self.idle {
                let keep_going = match self.control_rx.recv() {
                    Ok(Signal::Rewind) => self.rewind(None),
                    Ok(Signal::Resume) => true,
                    Ok(Signal::Shutdown) | Err(_) => false,
                };
                if !keep_going {
                    return;
                }
                continue;
            }

            match self.control_rx.try_recv() {
                Ok(Signal::Rewind) => {
                    if !self.rewind(None) {
                        return;
                    }
                    continue;
                }
                Ok(Signal::Shutdown) | Err(TryRecvError::Disconnected) => return,
                Ok(Signal::Resume) | Err(TryRecvError::Empty) => {}
            }

            let message = self.produce();
            let terminal = !matches!(message, Message::Item(_));
            let is_fault = matches!(message, Message::Fault(_));
            match self.send(message) {
                SendOutcome::Sent => {
                    if terminal {
                        self.idle = true;
                        self.faulted = is_fault;
                    }
                }
                SendOutcome::Interrupted(signal, message) => {
                    let pending_fault = match message {
                        Message::Item(item) => {
                            self.spare = Some(item);
                            None
                        }
                        Message::End => None,
                        Message::Fault(e) => Some(e),
                    };
                    let keep_going = match signal {
                        Signal::Rewind => self.rewind(pending_fault),
                        Signal::Shutdown => false,
                        Signal::Resume => true,
                    };
                    if !keep_going {
                        return;
                    }
                }
                SendOutcome::Disconnected => return,
            }
        }
    }

    fn produce(&mut self) -> Message<T> {
        let mut cell = self.spare.take().or_else(|| self.free_rx.try_recv().ok());
        let producer = &mut self.producer;
        let outcome = catch_unwind(AssertUnwindSafe(|| producer.next(&mut cell)));
        match outcome {
            Ok(Ok(true)) => match cell {
                Some(item) => Message::Item(item),
                None => Message::Fault(SplitError::pipeline(
                    "producer reported an item but left the cell empty",
                )),
            },
            Ok(Ok(false)) => {
                self.spare = cell;
                Message::End
            }
            Ok(Err(e)) => Message::Fault(e),
            Err(panic) => Message::Fault(SplitError::pipeline(format!(
                "producer panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    /// Sends `message`, unless a control signal arrives first.
    fn send(&self, message: Message<T>) -> SendOutcome<T> {
        let mut select = Select::new();
        let send_index = select.send(&self.data_tx);
        let control_index = select.recv(&self.control_rx);
        let oper = select.select();
        let index = oper.index();
        if index == send_index {
            match oper.send(&self.data_tx, message) {
                Ok(()) => SendOutcome::Sent,
                Err(_) => SendOutcome::Disconnected,
            }
        } else {
            debug_assert_eq!(index, control_index);
            match oper.recv(&self.control_rx) {
                Ok(signal) => SendOutcome::Interrupted(signal, message),
                Err(_) => SendOutcome::Disconnected,
            }
        }
    }

    /// Serves a rewind request. Returns `false` when the thread should exit.
    fn rewind(&mut self, pending_fault: Option<SplitError>) -> bool {
        let result = if let Some(e) = pending_fault {
            Err(e)
        } else if self.faulted {
            Err(SplitError::pipeline("cannot rewind a faulted pipeline"))
        } else {
            let producer = &mut self.producer;
            match catch_unwind(AssertUnwindSafe(|| producer.before_first())) {
                Ok(result) => result,
                Err(panic) => Err(SplitError::pipeline(format!(
                    "producer panicked during before_first: {}",
                    panic_message(panic.as_ref())
                ))),
            }
        };
        self.faulted = result.is_err();
        self.idle = self.faulted;

        if self.ack_tx.send(result).is_err() {
            return false;
        }
        loop {
            match self.control_rx.recv() {
                Ok(Signal::Resume) => return true,
                Ok(Signal::Rewind) => continue,
                Ok(Signal::Shutdown) | Err(_) => return false,
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts 0..limit, allocating a fresh Vec only when no cell is recycled.
    struct Counter {
        current: usize,
        limit: usize,
        allocations: Arc<AtomicUsize>,
        fail_at: Option<usize>,
    }

    impl Counter {
        fn new(limit: usize) -> Self {
            Self {
                current: 0,
                limit,
                allocations: Arc::new(AtomicUsize::new(0)),
                fail_at: None,
            }
        }
    }

    impl Producer<Vec<usize>> for Counter {
        fn next(&mut self, cell: &mut Option<Vec<usize>>) -> Result<bool> {
            if self.fail_at == Some(self.current) {
                return Err(SplitError::format(format!("bad item {}", self.current)));
            }
            if self.current >= self.limit {
                return Ok(false);
            }
            let item = cell.get_or_insert_with(|| {
                self.allocations.fetch_add(1, Ordering::SeqCst);
                Vec::with_capacity(1)
            });
            item.clear();
            item.push(self.current);
            self.current += 1;
            Ok(true)
        }

        fn before_first(&mut self) -> Result<()> {
            self.current = 0;
            Ok(())
        }
    }

    fn drain(iter: &mut ThreadedIter<Vec<usize>>) -> Vec<usize> {
        let mut seen = Vec::new();
        while let Some(item) = iter.next().unwrap() {
            seen.push(item[0]);
            iter.recycle(item);
        }
        seen
    }

    #[test]
    fn test_order_preserved_for_any_capacity() {
        for capacity in 1..=8 {
            let mut iter = ThreadedIter::new(Counter::new(500), capacity).unwrap();
            let mut seen = Vec::new();
            let mut held = Vec::new();
            while let Some(item) = iter.next().unwrap() {
                seen.push(item[0]);
                // Vary recycle timing: some now, some in bursts later.
                if item[0] % 3 == 0 {
                    iter.recycle(item);
                } else {
                    held.push(item);
                    if held.len() > capacity {
                        for item in held.drain(..) {
                            iter.recycle(item);
                        }
                    }
                }
            }
            assert_eq!(seen, (0..500).collect::<Vec<_>>(), "capacity {capacity}");
        }
    }

    #[test]
    fn test_recycling_bounds_allocations() {
        let producer = Counter::new(1000);
        let allocations = producer.allocations.clone();
        let capacity = 2;
        let mut iter = ThreadedIter::new(producer, capacity).unwrap();

        assert_eq!(drain(&mut iter).len(), 1000);
        assert!(allocations.load(Ordering::SeqCst) <= capacity + 2);
    }

    #[test]
    fn test_before_first_restarts_stream() {
        let mut iter = ThreadedIter::new(Counter::new(10), 3).unwrap();

        // Partial pass, leaving items queued
        for expected in 0..3 {
            let item = iter.next().unwrap().unwrap();
            assert_eq!(item[0], expected);
            iter.recycle(item);
        }
        iter.before_first().unwrap();
        assert_eq!(drain(&mut iter), (0..10).collect::<Vec<_>>());

        // Rewind after the end
        assert!(iter.next().unwrap().is_none());
        iter.before_first().unwrap();
        assert_eq!(drain(&mut iter), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_before_first_while_producer_blocked() {
        let mut iter = ThreadedIter::new(Counter::new(usize::MAX), 1).unwrap();
        for _ in 0..5 {
            let first = iter.next().unwrap().unwrap();
            assert_eq!(first[0], 0);
            let second = iter.next().unwrap().unwrap();
            assert_eq!(second[0], 1);
            iter.before_first().unwrap();
        }
    }

    #[test]
    fn test_fault_delivered_exactly_once() {
        let mut producer = Counter::new(100);
        producer.fail_at = Some(5);
        let mut iter = ThreadedIter::new(producer, 4).unwrap();

        for expected in 0..5 {
            assert_eq!(iter.next().unwrap().unwrap()[0], expected);
        }
        assert!(matches!(iter.next(), Err(SplitError::Format { .. })));
        assert!(iter.next().unwrap().is_none());
        assert!(iter.next().unwrap().is_none());
        assert!(iter.before_first().is_err());
    }

    #[test]
    fn test_fault_queued_before_rewind() {
        let (reached_tx, reached_rx) = std::sync::mpsc::channel();
        let mut produced = 0u32;
        let mut iter: ThreadedIter<u32> = ThreadedIter::from_fn(
            move |cell: &mut Option<u32>| {
                if produced == 1 {
                    let _ = reached_tx.send(());
                    return Err(SplitError::format("corrupt frame"));
                }
                produced += 1;
                *cell = Some(produced);
                Ok(true)
            },
            || Ok(()),
            4,
        )
        .unwrap();

        assert_eq!(iter.next().unwrap(), Some(1));
        reached_rx.recv().unwrap();
        // The fault was produced but not yet observed; the rewind reports it.
        assert!(matches!(iter.before_first(), Err(SplitError::Format { .. })));
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn test_producer_panic_becomes_fault() {
        let mut iter: ThreadedIter<u32> = ThreadedIter::from_fn(
            |_cell: &mut Option<u32>| -> Result<bool> { panic!("disk on fire") },
            || Ok(()),
            2,
        )
        .unwrap();

        match iter.next() {
            Err(SplitError::Pipeline { message }) => assert!(message.contains("disk on fire")),
            other => panic!("expected pipeline fault, got {:?}", other.map(|_| ())),
        }
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn test_before_first_fault() {
        let mut iter: ThreadedIter<u32> = ThreadedIter::from_fn(
            |_cell: &mut Option<u32>| Ok(false),
            || Err(SplitError::storage("/data", "connection reset")),
            2,
        )
        .unwrap();

        assert!(iter.next().unwrap().is_none());
        assert!(matches!(iter.before_first(), Err(SplitError::Storage { .. })));
        assert!(iter.next().unwrap().is_none());
        assert!(iter.before_first().is_err());
    }

    #[test]
    fn test_default_before_first_unsupported() {
        struct Once(bool);
        impl Producer<u8> for Once {
            fn next(&mut self, cell: &mut Option<u8>) -> Result<bool> {
                if self.0 {
                    return Ok(false);
                }
                self.0 = true;
                *cell = Some(7);
                Ok(true)
            }
        }

        let mut iter = ThreadedIter::new(Once(false), 1).unwrap();
        assert_eq!(iter.next().unwrap(), Some(7));
        assert!(matches!(iter.before_first(), Err(SplitError::Pipeline { .. })));
    }

    #[test]
    fn test_empty_cell_is_a_fault() {
        let mut iter: ThreadedIter<u8> =
            ThreadedIter::from_fn(|_cell: &mut Option<u8>| Ok(true), || Ok(()), 1).unwrap();
        assert!(matches!(iter.next(), Err(SplitError::Pipeline { .. })));
    }

    #[test]
    fn test_recycler_from_another_thread() {
        let producer = Counter::new(200);
        let allocations = producer.allocations.clone();
        let mut iter = ThreadedIter::new(producer, 2).unwrap();
        let recycler = iter.recycler();

        let (tx, rx) = std::sync::mpsc::channel::<Vec<usize>>();
        let returner = std::thread::spawn(move || {
            for item in rx {
                recycler.recycle(item);
            }
        });

        let mut count = 0;
        while let Some(item) = iter.next().unwrap() {
            assert_eq!(item[0], count);
            count += 1;
            tx.send(item).unwrap();
        }
        drop(tx);
        returner.join().unwrap();

        assert_eq!(count, 200);
        assert!(allocations.load(Ordering::SeqCst) <= 200);
    }

    #[test]
    fn test_drop_with_blocked_producer() {
        let mut iter = ThreadedIter::new(Counter::new(usize::MAX), 1).unwrap();
        assert_eq!(iter.next().unwrap().unwrap()[0], 0);
        drop(iter);
    }
}
