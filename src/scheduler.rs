//! Cooperative batch scheduler.
//!
//! Spawning or destroying thousands of replicas in one frame would stall the host, so that work is
//! queued as batches and advanced by one item per batch each time `drive_batches` runs (once per
//! `Update`). A batch is an explicit work queue: nothing suspends mid-item, and a batch yields
//! simply by returning after its item.
//!
//! Batches are either cancellable (the normal case) or detached. `teardown` drops every
//! cancellable batch immediately; detached batches keep running and can be flushed synchronously
//! when no further ticks will come.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bevy::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Pending,
    Completed,
    Cancelled,
}

impl BatchOutcome {
    fn encode(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Completed => 1,
            Self::Cancelled => 2,
        }
    }

    fn decode(value: u8) -> Self {
        match value {
            1 => Self::Completed,
            2 => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug)]
struct BatchState {
    total: usize,
    processed: AtomicUsize,
    outcome: AtomicU8,
    cancel_requested: AtomicBool,
}

/// Observer side of a submitted batch. Cheap to clone; all clones see the same state.
#[derive(Debug, Clone)]
pub struct BatchHandle {
    id: BatchId,
    state: Arc<BatchState>,
}

impl BatchHandle {
    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn total(&self) -> usize {
        self.state.total
    }

    pub fn processed(&self) -> usize {
        self.state.processed.load(Ordering::Relaxed)
    }

    pub fn outcome(&self) -> BatchOutcome {
        BatchOutcome::decode(self.state.outcome.load(Ordering::Relaxed))
    }

    pub fn is_finished(&self) -> bool {
        self.outcome() != BatchOutcome::Pending
    }

    /// Requests cancellation. The batch performs no further items; it is retired on the next
    /// tick. Has no effect on detached batches or batches that already finished.
    pub fn cancel(&self) {
        self.state.cancel_requested.store(true, Ordering::Relaxed);
    }
}

type CompletionFn = Box<dyn FnOnce(&mut World, BatchOutcome) + Send + Sync>;

trait BatchBody: Send + Sync {
    /// Runs the next item. Returns `false` once nothing is left.
    fn step(&mut self, world: &mut World) -> bool;

    fn is_empty(&self) -> bool;
}

struct ItemQueue<T, F> {
    items: VecDeque<T>,
    work: F,
}

impl<T, F> BatchBody for ItemQueue<T, F>
where
    T: Send + Sync + 'static,
    F: FnMut(&mut World, T) + Send + Sync + 'static,
{
    fn step(&mut self, world: &mut World) -> bool {
        match self.items.pop_front() {
            Some(item) => {
                (self.work)(world, item);
                true
            }
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// An ordered list of items plus the work to perform on each.
pub struct Batch {
    label: String,
    total: usize,
    body: Box<dyn BatchBody>,
    on_complete: Option<CompletionFn>,
}

impl Batch {
    pub fn new<T, F>(label: impl Into<String>, items: impl IntoIterator<Item = T>, work: F) -> Self
    where
        T: Send + Sync + 'static,
        F: FnMut(&mut World, T) + Send + Sync + 'static,
    {
        let items: VecDeque<T> = items.into_iter().collect();
        Self {
            label: label.into(),
            total: items.len(),
            body: Box::new(ItemQueue { items, work }),
            on_complete: None,
        }
    }

    /// Runs once with the final outcome, whether the batch completed or was cancelled.
    pub fn on_complete(
        mut self,
        callback: impl FnOnce(&mut World, BatchOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

struct BatchTask {
    id: BatchId,
    label: String,
    cancellable: bool,
    body: Box<dyn BatchBody>,
    state: Arc<BatchState>,
    on_complete: Option<CompletionFn>,
}

impl BatchTask {
    fn finish(mut self, world: &mut World, outcome: BatchOutcome) {
        self.state.outcome.store(outcome.encode(), Ordering::Relaxed);
        debug!(
            "Batch {:?} '{}' {:?} after {}/{} items",
            self.id,
            self.label,
            outcome,
            self.state.processed.load(Ordering::Relaxed),
            self.state.total
        );
        if let Some(callback) = self.on_complete.take() {
            callback(world, outcome);
        }
    }

    fn should_cancel(&self, torn_down: bool) -> bool {
        self.cancellable && (torn_down || self.state.cancel_requested.load(Ordering::Relaxed))
    }
}

#[derive(Resource, Default)]
pub struct BatchScheduler {
    tasks: Vec<BatchTask>,
    retired: Vec<BatchTask>,
    next_id: u64,
    torn_down: bool,
}

impl BatchScheduler {
    fn enqueue(&mut self, batch: Batch, cancellable: bool) -> BatchHandle {
        let id = BatchId(self.next_id);
        self.next_id += 1;
        let state = Arc::new(BatchState {
            total: batch.total,
            processed: AtomicUsize::new(0),
            outcome: AtomicU8::new(BatchOutcome::Pending.encode()),
            cancel_requested: AtomicBool::new(false),
        });
        let handle = BatchHandle {
            id,
            state: state.clone(),
        };
        let task = BatchTask {
            id,
            label: batch.label,
            cancellable,
            body: batch.body,
            state,
            on_complete: batch.on_complete,
        };

        if cancellable && self.torn_down {
            // Finished on the next tick so the completion callback still gets a world.
            self.retired.push(task);
        } else {
            self.tasks.push(task);
        }
        handle
    }

    /// Queues a cancellable batch. After teardown the batch is cancelled without running.
    pub fn run_batch(&mut self, batch: Batch) -> BatchHandle {
        self.enqueue(batch, true)
    }

    /// Queues a batch outside the cancellable set; it runs to completion even after teardown.
    pub fn fire_and_forget(&mut self, batch: Batch) -> BatchHandle {
        self.enqueue(batch, false)
    }

    /// Cancels every outstanding cancellable batch. Items already processed stay processed; the
    /// rest are never touched. Returns how many batches were cancelled.
    pub fn teardown(&mut self) -> usize {
        self.torn_down = true;
        let (cancelled, detached): (Vec<_>, Vec<_>) =
            self.tasks.drain(..).partition(|task| task.cancellable);
        self.tasks = detached;
        let count = cancelled.len();
        for task in &cancelled {
            task.state
                .outcome
                .store(BatchOutcome::Cancelled.encode(), Ordering::Relaxed);
        }
        self.retired.extend(cancelled);
        count
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.retired.is_empty()
    }
}

fn retire(world: &mut World, tasks: Vec<BatchTask>) {
    for task in tasks {
        task.finish(world, BatchOutcome::Cancelled);
    }
}

/// Advances every queued batch by one item. Batches submitted while this runs start on the next
/// tick.
pub fn drive_batches(world: &mut World) {
    let (tasks, retired) = {
        let mut scheduler = world.resource_mut::<BatchScheduler>();
        (
            std::mem::take(&mut scheduler.tasks),
            std::mem::take(&mut scheduler.retired),
        )
    };
    retire(world, retired);

    let mut survivors = Vec::with_capacity(tasks.len());
    let mut cancelled = Vec::new();
    for mut task in tasks {
        let torn_down = world.resource::<BatchScheduler>().torn_down;
        if task.should_cancel(torn_down) {
            cancelled.push(task);
            continue;
        }
        if task.body.step(world) {
            task.state.processed.fetch_add(1, Ordering::Relaxed);
        }
        if task.body.is_empty() {
            task.finish(world, BatchOutcome::Completed);
        } else {
            survivors.push(task);
        }
    }
    retire(world, cancelled);

    let mut scheduler = world.resource_mut::<BatchScheduler>();
    let torn_down = scheduler.torn_down;
    let (cancelled, mut kept): (Vec<_>, Vec<_>) = survivors
        .into_iter()
        .partition(|task| task.should_cancel(torn_down));
    kept.append(&mut scheduler.tasks);
    scheduler.tasks = kept;
    scheduler.retired.extend(cancelled);
}

/// Runs every detached batch to completion right now. Used at shutdown, when the host will not
/// tick again. Cancellable batches are retired without running.
pub fn flush_detached(world: &mut World) {
    loop {
        let (tasks, retired) = {
            let mut scheduler = world.resource_mut::<BatchScheduler>();
            scheduler.torn_down = true;
            (
                std::mem::take(&mut scheduler.tasks),
                std::mem::take(&mut scheduler.retired),
            )
        };
        if tasks.is_empty() && retired.is_empty() {
            return;
        }
        retire(world, retired);

        for mut task in tasks {
            if task.cancellable {
                task.finish(world, BatchOutcome::Cancelled);
                continue;
            }
            while task.body.step(world) {
                task.state.processed.fetch_add(1, Ordering::Relaxed);
            }
            task.finish(world, BatchOutcome::Completed);
        }
    }
}
