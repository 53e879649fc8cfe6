//! Continuation-passing plumbing for the register programming chains: the
//! `series` and `whilst` combinators plus the per-camera task queue.
//!
//! Steps complete through a callback that may fire synchronously or later on
//! the USB worker thread. Both combinators advance through a trampoline, so
//! a chain of synchronously-completing steps uses constant stack no matter
//! how long it is. The request sink the current thread is allowed to submit
//! through is threaded into every step and completion callback.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::error;

use crate::usb::request::RequestSink;

/// Failure carried through a task chain. The payload is the result code (as
/// an integer) reported by the step that aborted the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainError(pub i32);

/// Value produced by one continuation step.
pub type StepResult = Result<i32, ChainError>;

/// Completion callback handed to a continuation step.
pub type StepDone = Box<dyn FnOnce(&mut dyn RequestSink, StepResult) + Send>;

/// One continuation step.
pub type Step = Box<dyn FnOnce(&mut dyn RequestSink, StepDone) + Send>;

/// Completion callback of one `whilst` loop body run.
pub type LoopDone = Box<dyn FnOnce(&mut dyn RequestSink, Result<(), ChainError>) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SeriesState {
    remaining: VecDeque<Step>,
    results: Vec<i32>,
    finish: Option<Box<dyn FnOnce(&mut dyn RequestSink, Result<(), ChainError>, Vec<i32>) + Send>>,
    pumping: bool,
    in_flight: bool,
    completed: Option<StepResult>,
}

/// Run `tasks` one after another. `finish` receives the chain outcome and
/// the results accumulated so far; an error short-circuits the remaining
/// tasks.
pub fn series(
    sink: &mut dyn RequestSink,
    tasks: Vec<Step>,
    finish: impl FnOnce(&mut dyn RequestSink, Result<(), ChainError>, Vec<i32>) + Send + 'static,
) {
    let state = Arc::new(Mutex::new(SeriesState {
        remaining: tasks.into(),
        results: Vec::new(),
        finish: Some(Box::new(finish)),
        pumping: false,
        in_flight: false,
        completed: None,
    }));
    pump_series(&state, sink);
}

fn series_step_done(state: Arc<Mutex<SeriesState>>, sink: &mut dyn RequestSink, result: StepResult) {
    {
        let mut guard = lock(&state);
        guard.completed = Some(result);
        guard.in_flight = false;
        if guard.pumping {
            // The pump that started this step is still on the stack below us
            // and will consume the completion when the step returns.
            return;
        }
    }
    pump_series(&state, sink);
}

fn pump_series(state: &Arc<Mutex<SeriesState>>, sink: &mut dyn RequestSink) {
    let mut guard = lock(state);
    if guard.pumping {
        return;
    }
    guard.pumping = true;

    loop {
        if let Some(result) = guard.completed.take() {
            match result {
                Ok(value) => guard.results.push(value),
                Err(err) => {
                    guard.remaining.clear();
                    guard.pumping = false;
                    let finish = guard.finish.take();
                    let results = std::mem::take(&mut guard.results);
                    drop(guard);
                    if let Some(finish) = finish {
                        finish(sink, Err(err), results);
                    }
                    return;
                }
            }
        }
        if guard.in_flight {
            guard.pumping = false;
            return;
        }
        let Some(task) = guard.remaining.pop_front() else {
            guard.pumping = false;
            let finish = guard.finish.take();
            let results = std::mem::take(&mut guard.results);
            drop(guard);
            if let Some(finish) = finish {
                finish(sink, Ok(()), results);
            }
            return;
        };

        guard.in_flight = true;
        drop(guard);
        let state_ref = Arc::clone(state);
        task(
            sink,
            Box::new(move |sink, result| series_step_done(state_ref, sink, result)),
        );
        guard = lock(state);
        if guard.completed.is_none() {
            // The step went asynchronous; its completion resumes the pump.
            guard.pumping = false;
            return;
        }
    }
}

struct WhilstState {
    condition: Box<dyn FnMut() -> bool + Send>,
    body: Option<Box<dyn FnMut(&mut dyn RequestSink, LoopDone) + Send>>,
    finish: Option<Box<dyn FnOnce(&mut dyn RequestSink, Result<(), ChainError>) + Send>>,
    pumping: bool,
    in_flight: bool,
    completed: Option<Result<(), ChainError>>,
}

/// Run `body` for as long as `condition` returns true, then call `finish`.
/// An error from the body short-circuits the loop.
pub fn whilst(
    sink: &mut dyn RequestSink,
    condition: impl FnMut() -> bool + Send + 'static,
    body: impl FnMut(&mut dyn RequestSink, LoopDone) + Send + 'static,
    finish: impl FnOnce(&mut dyn RequestSink, Result<(), ChainError>) + Send + 'static,
) {
    let state = Arc::new(Mutex::new(WhilstState {
        condition: Box::new(condition),
        body: Some(Box::new(body)),
        finish: Some(Box::new(finish)),
        pumping: false,
        in_flight: false,
        completed: None,
    }));
    pump_whilst(&state, sink);
}

fn whilst_iteration_done(
    state: Arc<Mutex<WhilstState>>,
    sink: &mut dyn RequestSink,
    result: Result<(), ChainError>,
) {
    {
        let mut guard = lock(&state);
        guard.completed = Some(result);
        guard.in_flight = false;
        if guard.pumping {
            return;
        }
    }
    pump_whilst(&state, sink);
}

fn pump_whilst(state: &Arc<Mutex<WhilstState>>, sink: &mut dyn RequestSink) {
    let mut guard = lock(state);
    if guard.pumping {
        return;
    }
    guard.pumping = true;

    loop {
        if let Some(result) = guard.completed.take() {
            if let Err(err) = result {
                guard.pumping = false;
                let finish = guard.finish.take();
                drop(guard);
                if let Some(finish) = finish {
                    finish(sink, Err(err));
                }
                return;
            }
        }
        if guard.in_flight {
            guard.pumping = false;
            return;
        }
        if !(guard.condition)() {
            guard.pumping = false;
            let finish = guard.finish.take();
            drop(guard);
            if let Some(finish) = finish {
                finish(sink, Ok(()));
            }
            return;
        }

        let Some(mut body) = guard.body.take() else {
            guard.pumping = false;
            return;
        };
        guard.in_flight = true;
        drop(guard);
        let state_ref = Arc::clone(state);
        body(
            sink,
            Box::new(move |sink, result| whilst_iteration_done(state_ref, sink, result)),
        );
        guard = lock(state);
        guard.body = Some(body);
        if guard.completed.is_none() {
            guard.pumping = false;
            return;
        }
    }
}

struct QueueEntry {
    name: &'static str,
    task: Option<Step>,
}

struct TaskQueueInner {
    entries: VecDeque<QueueEntry>,
    pumping: bool,
    running: bool,
    finished: bool,
}

/// Per-camera FIFO of named task chains. At most one chain is in flight;
/// enqueueing onto an empty queue starts the chain immediately, and each
/// completion starts the next entry. Failures are logged with the task name
/// and do not stop the queue.
#[derive(Clone)]
pub struct AsyncTaskQueue {
    inner: Arc<Mutex<TaskQueueInner>>,
}

impl Default for AsyncTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncTaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TaskQueueInner {
                entries: VecDeque::new(),
                pumping: false,
                running: false,
                finished: false,
            })),
        }
    }

    pub fn enqueue(&self, sink: &mut dyn RequestSink, name: &'static str, task: Step) {
        lock(&self.inner).entries.push_back(QueueEntry {
            name,
            task: Some(task),
        });
        pump_queue(&self.inner, sink);
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).entries.is_empty()
    }
}

fn pump_queue(inner: &Arc<Mutex<TaskQueueInner>>, sink: &mut dyn RequestSink) {
    let mut guard = lock(inner);
    if guard.pumping {
        return;
    }
    guard.pumping = true;

    loop {
        if guard.finished {
            guard.finished = false;
            guard.running = false;
            guard.entries.pop_front();
        }
        if guard.running {
            guard.pumping = false;
            return;
        }
        let Some(entry) = guard.entries.front_mut() else {
            guard.pumping = false;
            return;
        };
        let name = entry.name;
        let Some(task) = entry.task.take() else {
            guard.pumping = false;
            return;
        };
        guard.running = true;
        drop(guard);

        let inner_ref = Arc::clone(inner);
        task(
            sink,
            Box::new(move |sink, result| {
                if let Err(ChainError(code)) = result {
                    error!("USB task '{name}' failed with result code {code}");
                }
                {
                    let mut guard = lock(&inner_ref);
                    guard.finished = true;
                    if guard.pumping {
                        return;
                    }
                }
                pump_queue(&inner_ref, sink);
            }),
        );
        guard = lock(inner);
        if !guard.finished {
            guard.pumping = false;
            return;
        }
    }
}
