//! The execution context every build stage runs against.
//!
//! A [`BuildContext`] carries three things through a generation run:
//! - a stack of nested task scopes from which an overall progress value is derived,
//!   readable from any thread while the build is running,
//! - the cooperative time-slicing budget behind [`BuildContext::yield_now`],
//! - the choice between the single-threaded and the data-parallel code paths.
//!
//! It also owns the scratch buffer pools stages rent their temporary arrays from.

use std::{
    future::Future,
    ops::{Deref, DerefMut},
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Shared state of a single generation run. See the [module docs](self).
#[derive(Debug)]
pub struct BuildContext {
    tasks: Mutex<Vec<TaskProgress>>,
    time_slice: Option<Duration>,
    slice_start: Mutex<Instant>,
    prefer_multithreading: bool,
    yield_count: AtomicU64,
    index_pool: ScratchPool<usize>,
    byte_pool: ScratchPool<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TaskProgress {
    current: u32,
    total: u32,
    label: &'static str,
}

impl Default for BuildContext {
    fn default() -> Self {
        Self::new(Duration::ZERO, false)
    }
}

impl BuildContext {
    /// Creates a new context.
    ///
    /// - `time_slice`: how long the build may run between two yields. [`Duration::ZERO`] never yields.
    /// - `prefer_multithreading`: whether stages should take their data-parallel code path.
    pub fn new(time_slice: Duration, prefer_multithreading: bool) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            time_slice: (!time_slice.is_zero()).then_some(time_slice),
            slice_start: Mutex::new(Instant::now()),
            prefer_multithreading,
            yield_count: AtomicU64::new(0),
            index_pool: ScratchPool::default(),
            byte_pool: ScratchPool::default(),
        }
    }

    /// Whether stages should fan their work out over the rayon thread pool.
    ///
    /// Stages read this once on entry and never mix both code paths.
    #[inline]
    pub fn prefer_multithreading(&self) -> bool {
        self.prefer_multithreading
    }

    /// The configured time slice, or `None` if the build never yields.
    #[inline]
    pub fn time_slice(&self) -> Option<Duration> {
        self.time_slice
    }

    /// Opens a nested task scope with `total` steps. The scope is closed when the returned guard is dropped.
    pub fn push_task(&self, total: u32, label: &'static str) -> TaskScope<'_> {
        let mut tasks = self.tasks.lock();
        tracing::trace!(depth = tasks.len(), total, label, "push task");
        tasks.push(TaskProgress {
            current: 0,
            total,
            label,
        });
        TaskScope {
            context: self,
            depth: tasks.len() - 1,
        }
    }

    /// Advances the innermost task by one step.
    #[inline]
    pub fn step_task(&self) {
        self.step_task_by(1);
    }

    /// Advances the innermost task by `steps` steps.
    pub fn step_task_by(&self, steps: u32) {
        if let Some(task) = self.tasks.lock().last_mut() {
            task.current = task.current.saturating_add(steps).min(task.total);
        }
    }

    fn pop_task(&self, depth: usize) {
        let mut tasks = self.tasks.lock();
        debug_assert_eq!(tasks.len(), depth + 1, "task scopes must be closed in LIFO order");
        if let Some(task) = tasks.pop() {
            tracing::trace!(depth, label = task.label, "pop task");
        }
        // Completing a nested task completes one step of its parent.
        if let Some(parent) = tasks.last_mut() {
            parent.current = parent.current.saturating_add(1).min(parent.total);
        }
    }

    /// The overall progress in `[0, 1]`.
    ///
    /// Each nested task contributes its own fraction scaled down by the size of one step
    /// of every task it is nested in.
    pub fn progress(&self) -> f32 {
        let tasks = self.tasks.lock();
        let mut progress = 0.0;
        let mut weight = 1.0;
        for task in tasks.iter() {
            if task.total == 0 {
                break;
            }
            let total = task.total as f32;
            progress += weight * task.current as f32 / total;
            weight /= total;
        }
        progress.clamp(0.0, 1.0)
    }

    /// The labels of all open tasks, outermost first.
    pub fn task_labels(&self) -> Vec<&'static str> {
        self.tasks.lock().iter().map(|task| task.label).collect()
    }

    /// Re-arms the time budget. Called by the host each time it polls the build.
    pub fn begin_slice(&self) {
        *self.slice_start.lock() = Instant::now();
    }

    /// Whether the current time slice is used up.
    #[inline]
    pub fn slice_elapsed(&self) -> bool {
        match self.time_slice {
            Some(slice) => self.slice_start.lock().elapsed() >= slice,
            None => false,
        }
    }

    /// A suspension point for long-running loops.
    ///
    /// Completes immediately unless the current time slice is used up, in which case the
    /// build is suspended until the host polls it again.
    #[inline]
    pub fn yield_now(&self) -> YieldNow<'_> {
        YieldNow {
            context: self,
            yielded: false,
        }
    }

    /// How often the build has suspended so far.
    pub fn yield_count(&self) -> u64 {
        self.yield_count.load(Ordering::Relaxed)
    }

    /// Drives `future` to completion on the current thread.
    ///
    /// The time slice is re-armed before every poll, so a time-sliced build finishes here
    /// after as many suspensions as it needs.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let mut future = std::pin::pin!(future);
        let mut cx = Context::from_waker(Waker::noop());
        loop {
            self.begin_slice();
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }
        }
    }

    /// Rents an empty index buffer. It is returned to the pool when dropped.
    pub fn rent_indices(&self) -> Pooled<'_, usize> {
        self.index_pool.rent()
    }

    /// Rents an empty byte buffer. It is returned to the pool when dropped.
    pub fn rent_bytes(&self) -> Pooled<'_, u8> {
        self.byte_pool.rent()
    }
}

/// Guard for a task opened with [`BuildContext::push_task`].
#[derive(Debug)]
#[must_use = "the task is closed as soon as the scope is dropped"]
pub struct TaskScope<'a> {
    context: &'a BuildContext,
    depth: usize,
}

impl TaskScope<'_> {
    /// Advances this task by one step.
    #[inline]
    pub fn step(&self) {
        self.context.step_task();
    }

    /// Advances this task by `steps` steps.
    #[inline]
    pub fn step_by(&self, steps: u32) {
        self.context.step_task_by(steps);
    }

    /// Closes the task. Equivalent to dropping the scope.
    pub fn finish(self) {}
}

impl Drop for TaskScope<'_> {
    fn drop(&mut self) {
        self.context.pop_task(self.depth);
    }
}

/// Future returned by [`BuildContext::yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow<'a> {
    context: &'a BuildContext,
    yielded: bool,
}

impl Future for YieldNow<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded || !self.context.slice_elapsed() {
            return Poll::Ready(());
        }
        self.yielded = true;
        self.context.yield_count.fetch_add(1, Ordering::Relaxed);
        // Executors that do not re-arm the slice themselves still make progress.
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// A pool of reusable buffers.
#[derive(Debug)]
pub struct ScratchPool<T> {
    free: Mutex<Vec<Vec<T>>>,
}

impl<T> Default for ScratchPool<T> {
    fn default() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }
}

impl<T> ScratchPool<T> {
    /// Takes an empty buffer out of the pool, allocating a new one if none is free.
    pub fn rent(&self) -> Pooled<'_, T> {
        let buffer = self.free.lock().pop().unwrap_or_default();
        Pooled {
            pool: self,
            buffer,
        }
    }

    /// The number of buffers currently waiting in the pool.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

/// A buffer rented from a [`ScratchPool`]. Returned to the pool on drop, including during unwinding.
#[derive(Debug)]
pub struct Pooled<'a, T> {
    pool: &'a ScratchPool<T>,
    buffer: Vec<T>,
}

impl<T> Deref for Pooled<'_, T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.clear();
        self.pool.free.lock().push(buffer);
    }
}
