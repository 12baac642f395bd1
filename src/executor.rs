//! Single-threaded deterministic task executor
//!
//! Hosts the futures of detachable callbacks. Tasks are polled in the order
//! they were woken, so a run is reproducible. The executor owns every task;
//! wakers only hold weak references, which means dropping the executor
//! drops every suspended callback with it.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
};

/// Identifier of a spawned task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

/// A task in the executor.
pub struct Task {
    id: TaskId,
    /// The future being executed.
    fut: RefCell<Pin<Box<dyn Future<Output = ()>>>>,
    /// Whether this task is currently in the ready queue.
    scheduled: Cell<bool>,
    /// Whether this task has completed and should not be polled again.
    completed: Cell<bool>,
    exec: Weak<RefCell<ExecutorInner>>,
}

#[derive(Default)]
struct ExecutorInner {
    /// FIFO queue of ready tasks.
    ready: VecDeque<Rc<Task>>,
    /// Every task that has not completed.
    tasks: HashMap<TaskId, Rc<Task>>,
    next_id: u64,
}

pub struct Executor {
    inner: Rc<RefCell<ExecutorInner>>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ExecutorInner::default())),
        }
    }

    /// Spawn a task. It first runs on the next `run_until_stalled`.
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) -> TaskId {
        let task = {
            let mut inner = self.inner.borrow_mut();
            let id = TaskId(inner.next_id);
            inner.next_id += 1;
            let task = Rc::new(Task {
                id,
                fut: RefCell::new(Box::pin(fut)),
                scheduled: Cell::new(false),
                completed: Cell::new(false),
                exec: Rc::downgrade(&self.inner),
            });
            inner.tasks.insert(id, task.clone());
            task
        };
        schedule(&task);
        task.id
    }

    /// Poll ready tasks until none are left. Returns the number of polls.
    pub fn run_until_stalled(&self) -> usize {
        let mut polls = 0;
        loop {
            let task = self.inner.borrow_mut().ready.pop_front();
            let Some(task) = task else {
                break;
            };

            task.scheduled.set(false);

            // Stale wakers may have re-added a finished task.
            if task.completed.get() {
                continue;
            }

            polls += 1;

            let waker = task_waker(&task);
            let mut cx = Context::from_waker(&waker);

            let poll = task.fut.borrow_mut().as_mut().poll(&mut cx);
            if let Poll::Ready(()) = poll {
                task.completed.set(true);
                self.inner.borrow_mut().tasks.remove(&task.id);
            }
        }
        polls
    }

    pub fn has_ready_tasks(&self) -> bool {
        !self.inner.borrow().ready.is_empty()
    }

    /// Number of spawned tasks that have not completed.
    pub fn live_tasks(&self) -> usize {
        self.inner.borrow().tasks.len()
    }

    /// Drop every task, suspended or ready, without polling it again.
    pub fn clear(&self) {
        let (ready, tasks) = {
            let mut inner = self.inner.borrow_mut();
            (
                std::mem::take(&mut inner.ready),
                std::mem::take(&mut inner.tasks),
            )
        };
        for task in tasks.values() {
            task.completed.set(true);
        }
        // Futures are dropped here, outside the borrow.
        drop(ready);
        drop(tasks);
    }
}

/// Put a task on its executor's ready queue unless it is already there.
fn schedule(task: &Rc<Task>) {
    if task.completed.get() {
        return;
    }
    if task.scheduled.replace(true) {
        return;
    }
    if let Some(exec) = task.exec.upgrade() {
        exec.borrow_mut().ready.push_back(task.clone());
    }
}

// --- Waker implementation ---
//
// The waker data is a `Weak<Task>` so parked wakers never keep a task alive.

fn task_waker(task: &Rc<Task>) -> Waker {
    unsafe fn clone_fn(data: *const ()) -> RawWaker {
        let weak = Weak::<Task>::from_raw(data as *const Task);
        let cloned = weak.clone();
        std::mem::forget(weak);
        RawWaker::new(Weak::into_raw(cloned) as *const (), &VTABLE)
    }

    unsafe fn wake_fn(data: *const ()) {
        wake_by_ref_fn(data);
        drop_fn(data);
    }

    unsafe fn wake_by_ref_fn(data: *const ()) {
        let weak = Weak::<Task>::from_raw(data as *const Task);
        if let Some(task) = weak.upgrade() {
            schedule(&task);
        }
        std::mem::forget(weak);
    }

    unsafe fn drop_fn(data: *const ()) {
        drop(Weak::<Task>::from_raw(data as *const Task));
    }

    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_fn, wake_fn, wake_by_ref_fn, drop_fn);

    let raw = RawWaker::new(Weak::into_raw(Rc::downgrade(task)) as *const (), &VTABLE);
    unsafe { Waker::from_raw(raw) }
}
