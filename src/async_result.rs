//! One-shot result of an asynchronous operation.
//!
//! Every network operation of a [crate::Node] returns an [AsyncResult] right away.
//! Callers either block on it, with or without a timeout, or attach observers that
//! run exactly once on the thread completing the operation.

use std::{
    fmt::{self, Debug, Formatter},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use tracing::debug;

use crate::TaskError;

type Observer<T> = Box<dyn FnOnce(Result<T, TaskError>) + Send>;

struct State<T> {
    outcome: Option<Result<T, TaskError>>,
    cancelled: bool,
    observers: Vec<Observer<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read side of a one-shot result.
pub struct AsyncResult<T> {
    shared: Arc<Shared<T>>,
}

/// Write side of an [AsyncResult].
///
/// Dropping it without completing fails the result with [TaskError::Abandoned].
pub struct Completer<T: Clone + Send + 'static> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T: Clone + Send + 'static> AsyncResult<T> {
    /// A pending result and the handle completing it.
    pub fn pending() -> (AsyncResult<T>, Completer<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                outcome: None,
                cancelled: false,
                observers: Vec::new(),
            }),
            ready: Condvar::new(),
        });

        (
            AsyncResult {
                shared: shared.clone(),
            },
            Completer {
                shared: Some(shared),
            },
        )
    }

    /// An already failed result.
    pub fn failed(error: TaskError) -> Self {
        let (result, completer) = Self::pending();
        completer.fail(error);
        result
    }

    /// Runs `task` on a new named thread and completes the result with its return value.
    pub fn spawn<F>(name: &str, task: F) -> Self
    where
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        let (result, completer) = Self::pending();

        match thread::Builder::new()
            .name(name.to_string())
            .spawn(move || completer.finish(task()))
        {
            Ok(_) => result,
            Err(error) => {
                debug!(?error, name, "Failed to spawn task thread");
                Self::failed(TaskError::Spawn(error.to_string()))
            }
        }
    }

    // === Getters ===

    pub fn is_done(&self) -> bool {
        self.shared.lock().outcome.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }

    /// The outcome, if the operation already finished.
    pub fn try_get(&self) -> Option<Result<T, TaskError>> {
        self.shared.lock().outcome.clone()
    }

    // === Public Methods ===

    /// Blocks until the operation finishes.
    pub fn wait(&self) -> Result<T, TaskError> {
        let guard = self.shared.lock();
        let guard = self
            .shared
            .ready
            .wait_while(guard, |state| state.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);

        guard.outcome.clone().unwrap_or(Err(TaskError::Abandoned))
    }

    /// Blocks until the operation finishes or `timeout` elapses.
    ///
    /// Timing out leaves the operation running, a later call may still succeed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        let guard = self.shared.lock();
        let (guard, _) = self
            .shared
            .ready
            .wait_timeout_while(guard, timeout, |state| state.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);

        guard.outcome.clone().unwrap_or(Err(TaskError::Timeout))
    }

    /// Registers a one-shot observer.
    ///
    /// If the operation already finished the observer runs immediately on the
    /// calling thread, otherwise it runs on the thread completing the operation.
    pub fn on_complete<F>(&self, observer: F)
    where
        F: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        let mut state = self.shared.lock();

        match state.outcome.clone() {
            Some(outcome) => {
                drop(state);
                observer(outcome);
            }
            None => state.observers.push(Box::new(observer)),
        }
    }

    /// Marks the result as cancelled.
    ///
    /// Waiters and observers see [TaskError::Cancelled]; the underlying operation
    /// keeps running and its eventual outcome is discarded. Returns false if the
    /// result was already complete.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.lock();

        if state.outcome.is_some() {
            return false;
        }

        state.cancelled = true;
        drop(state);

        settle(&self.shared, Err(TaskError::Cancelled));
        true
    }
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        AsyncResult {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Debug> Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("AsyncResult")
            .field("outcome", &state.outcome)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Completer<T> {
    pub fn complete(self, value: T) {
        self.finish(Ok(value))
    }

    pub fn fail(self, error: TaskError) {
        self.finish(Err(error))
    }

    pub fn finish(mut self, outcome: Result<T, TaskError>) {
        if let Some(shared) = self.shared.take() {
            settle(&shared, outcome);
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            settle(&shared, Err(TaskError::Abandoned));
        }
    }
}

impl<T: Clone + Send + 'static> Debug for Completer<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("pending", &self.shared.is_some())
            .finish()
    }
}

/// Stores the first outcome, wakes waiters and runs observers outside the lock.
fn settle<T: Clone>(shared: &Shared<T>, outcome: Result<T, TaskError>) {
    let observers = {
        let mut state = shared.lock();

        if state.outcome.is_some() {
            return;
        }

        state.outcome = Some(outcome.clone());
        std::mem::take(&mut state.observers)
    };

    shared.ready.notify_all();

    for observer in observers {
        observer(outcome.clone());
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;

    #[test]
    fn wait_blocks_until_completion() {
        let (result, completer) = AsyncResult::<u32>::pending();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(7);
        });

        assert_eq!(result.wait(), Ok(7));
        assert!(result.is_done());
    }

    #[test]
    fn wait_timeout_reports_timeout_and_keeps_running() {
        let (result, completer) = AsyncResult::<u32>::pending();

        let start = Instant::now();
        assert_eq!(
            result.wait_timeout(Duration::from_millis(20)),
            Err(TaskError::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(20));

        completer.complete(1);
        assert_eq!(result.wait_timeout(Duration::from_millis(20)), Ok(1));
    }

    #[test]
    fn observers_run_once_on_completion() {
        let (result, completer) = AsyncResult::<&'static str>::pending();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            result.on_complete(move |outcome| {
                assert_eq!(outcome, Ok("done"));
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        completer.complete("done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn late_observer_is_replayed() {
        let result = AsyncResult::<u8>::failed(TaskError::Timeout);
        let (sender, receiver) = flume::bounded(1);

        result.on_complete(move |outcome| {
            let _ = sender.send(outcome);
        });

        assert_eq!(receiver.try_recv().unwrap(), Err(TaskError::Timeout));
    }

    #[test]
    fn only_first_outcome_counts() {
        let (result, completer) = AsyncResult::<u8>::pending();

        assert!(result.cancel());
        assert!(!result.cancel());
        completer.complete(1);

        assert!(result.is_cancelled());
        assert_eq!(result.wait(), Err(TaskError::Cancelled));
    }

    #[test]
    fn dropped_completer_abandons() {
        let (result, completer) = AsyncResult::<u8>::pending();
        drop(completer);

        assert_eq!(result.wait(), Err(TaskError::Abandoned));
    }

    #[test]
    fn spawn_runs_on_named_thread() {
        let result = AsyncResult::spawn("async-result-test", || {
            Ok(thread::current().name().map(str::to_string))
        });

        assert_eq!(
            result.wait_timeout(Duration::from_secs(5)),
            Ok(Some("async-result-test".to_string()))
        );
    }
}
