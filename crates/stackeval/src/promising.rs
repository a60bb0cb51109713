//! compute-once promises with self-dependency detection
//!
//! A [Once] runs its compute function at most once and hands the result to every requester.
//! Requesters that arrive while the computation is in progress suspend until it finishes.
//!
//! Waiting is where deadlocks come from: if task `A` waits on a promise being computed by
//! task `B` which (transitively) waits on a promise `A` is computing, nobody can make
//! progress. Each participating tokio task therefore carries a task-local [TaskContext] and
//! all tasks of one run share a tracker recording
//!
//! - which task owns (is computing) each in-flight promise,
//! - the stack of promises each task is computing,
//! - the promise each task is currently waiting on.
//!
//! Before suspending, a requester walks `promise -> owner -> promise that owner awaits -> ...`.
//! If the walk arrives back at the requester, the request fails with [CycleError] instead.
//! Every promise on the walked chain is marked and resolves with the same [CycleError] once
//! its compute function returns, so each member of the cycle reports it.
//!
//! Compute functions evaluate their own nested requests sequentially: a promise owned by the
//! current task is always on the current call stack.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromiseId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// The surrounding run was canceled before a result was available
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("evaluation was canceled")]
pub struct Canceled;

/// A request would have waited on its own result
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("self-dependent items: {}", .chain.join(", "))]
pub struct CycleError {
    /// Names of the promises on the cycle, starting at the one that was requested
    pub chain: Vec<String>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PromiseError {
    #[error(transparent)]
    Circular(#[from] CycleError),
    #[error(transparent)]
    Canceled(#[from] Canceled),
}

/// Cooperative cancellation shared by every task of a run
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        tracing::debug!("cancellation requested");
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Completes once [CancelToken::cancel] was called
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            // the sender lives as long as `self`, this is never reached
            std::future::pending::<()>().await
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    owners: HashMap<PromiseId, TaskId>,
    names: HashMap<PromiseId, String>,
    stacks: HashMap<TaskId, Vec<PromiseId>>,
    waiting: HashMap<TaskId, PromiseId>,
    cyclic: HashMap<PromiseId, CycleError>,
}

impl TrackerState {
    /// Follows ownership and waits from `start` and returns the chain of promises if it leads
    /// back to `me`
    fn find_cycle(&self, me: TaskId, start: PromiseId) -> Option<Vec<PromiseId>> {
        let mut chain = vec![];
        let mut promise = start;

        // each step visits a different task unless it reaches `me`
        for _ in 0..=self.stacks.len() {
            let owner = *self.owners.get(&promise)?;
            let stack = self.stacks.get(&owner)?;
            let from = stack.iter().position(|p| *p == promise)?;
            chain.extend_from_slice(&stack[from..]);

            if owner == me {
                return Some(chain);
            }
            promise = *self.waiting.get(&owner)?;
        }

        None
    }

    fn name(&self, promise: PromiseId) -> String {
        self.names
            .get(&promise)
            .cloned()
            .unwrap_or_else(|| format!("promise {}", promise.0))
    }
}

#[derive(Debug, Default)]
struct Tracker {
    state: Mutex<TrackerState>,
}

impl Tracker {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_compute(&self, task: TaskId, promise: PromiseId, name: &str) {
        let mut state = self.lock();
        state.owners.insert(promise, task);
        state.names.insert(promise, name.to_owned());
        state.stacks.entry(task).or_default().push(promise);
    }

    /// Returns the cycle `promise` was found to be part of, if any
    fn end_compute(&self, task: TaskId, promise: PromiseId) -> Option<CycleError> {
        let mut state = self.lock();
        state.owners.remove(&promise);
        state.names.remove(&promise);
        if let Some(stack) = state.stacks.get_mut(&task) {
            if let Some(index) = stack.iter().rposition(|p| *p == promise) {
                stack.remove(index);
            }
            if stack.is_empty() {
                state.stacks.remove(&task);
            }
        }
        state.cyclic.remove(&promise)
    }

    fn begin_wait(&self, task: TaskId, promise: PromiseId) -> Result<(), CycleError> {
        let mut state = self.lock();

        if let Some(chain) = state.find_cycle(task, promise) {
            let err = CycleError {
                chain: chain.iter().map(|id| state.name(*id)).collect(),
            };
            tracing::debug!(%err, "self-dependency detected");
            for id in chain {
                state.cyclic.insert(id, err.clone());
            }
            return Err(err);
        }

        state.waiting.insert(task, promise);
        Ok(())
    }

    fn end_wait(&self, task: TaskId) {
        self.lock().waiting.remove(&task);
    }
}

#[derive(Clone)]
struct TaskContext {
    id: TaskId,
    tracker: Arc<Tracker>,
    cancel: CancelToken,
}

impl TaskContext {
    fn root(cancel: CancelToken) -> Self {
        Self {
            id: TaskId(next_id()),
            tracker: Default::default(),
            cancel,
        }
    }

    fn child(&self) -> Self {
        Self {
            id: TaskId(next_id()),
            tracker: Arc::clone(&self.tracker),
            cancel: self.cancel.clone(),
        }
    }
}

tokio::task_local! {
    static CURRENT_TASK: TaskContext;
}

/// Runs `future` as the root task of a new evaluation run
pub async fn main_task<F: Future>(cancel: CancelToken, future: F) -> F::Output {
    CURRENT_TASK.scope(TaskContext::root(cancel), future).await
}

/// Spawns a tokio task taking part in the current run
///
/// The task shares cycle tracking and cancellation with the task calling `spawn`.
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let task = CURRENT_TASK
        .try_with(TaskContext::child)
        .unwrap_or_else(|_| TaskContext::root(CancelToken::new()));
    tokio::spawn(CURRENT_TASK.scope(task, future))
}

/// True when the current run was canceled
pub fn is_cancelled() -> bool {
    CURRENT_TASK
        .try_with(|task| task.cancel.is_cancelled())
        .unwrap_or(false)
}

type Slot<T> = Option<Result<T, CycleError>>;

enum State<T> {
    Unstarted,
    Running(watch::Receiver<Slot<T>>),
    Resolved(Result<T, CycleError>),
}

enum Role<T> {
    Wait(watch::Receiver<Slot<T>>),
    Compute(watch::Sender<Slot<T>>),
}

/// A value computed at most once, shared by all requesters
pub struct Once<T> {
    id: PromiseId,
    state: Mutex<State<T>>,
}

impl<T> Default for Once<T> {
    fn default() -> Self {
        Self {
            id: PromiseId(next_id()),
            state: Mutex::new(State::Unstarted),
        }
    }
}

impl<T> fmt::Debug for Once<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.lock() {
            State::Unstarted => "unstarted",
            State::Running(_) => "running",
            State::Resolved(_) => "resolved",
        };
        f.debug_struct("Once")
            .field("id", &self.id.0)
            .field("state", &state)
            .finish()
    }
}

impl<T> Once<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + Sync> Once<T> {
    /// The result, if the promise has already been resolved
    pub fn resolved(&self) -> Option<Result<T, CycleError>> {
        match &*self.lock() {
            State::Resolved(result) => Some(result.clone()),
            _ => None,
        }
    }

    /// Returns the promise's value, running `compute` if nobody has started it yet
    ///
    /// `name` identifies the promise in [CycleError]s. If `compute` returns [Canceled] the
    /// promise is not resolved and a later request computes it again.
    pub async fn get<F, Fut>(&self, name: &str, compute: F) -> Result<T, PromiseError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Canceled>>,
    {
        self.get_with(name, compute, Err).await
    }

    /// Like [Once::get], but a promise found to be part of a cycle resolves to
    /// `recover(cycle)` instead of the [CycleError]
    ///
    /// Every later request sees that same value. The request that detects the cycle still
    /// gets [PromiseError::Circular], its own promise is resolved by its owner.
    pub async fn get_or_recover<F, Fut, R>(
        &self,
        name: &str,
        compute: F,
        recover: R,
    ) -> Result<T, PromiseError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Canceled>>,
        R: FnOnce(CycleError) -> T,
    {
        self.get_with(name, compute, |cycle| Ok(recover(cycle))).await
    }

    async fn get_with<F, Fut, R>(
        &self,
        name: &str,
        compute: F,
        on_cycle: R,
    ) -> Result<T, PromiseError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Canceled>>,
        R: FnOnce(CycleError) -> Result<T, CycleError>,
    {
        match CURRENT_TASK.try_with(TaskContext::clone) {
            Ok(task) => self.get_in(task, name, compute, on_cycle).await,
            Err(_) => {
                let task = TaskContext::root(CancelToken::new());
                CURRENT_TASK
                    .scope(task.clone(), self.get_in(task, name, compute, on_cycle))
                    .await
            }
        }
    }

    async fn get_in<F, Fut, R>(
        &self,
        task: TaskContext,
        name: &str,
        compute: F,
        on_cycle: R,
    ) -> Result<T, PromiseError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Canceled>>,
        R: FnOnce(CycleError) -> Result<T, CycleError>,
    {
        let role = {
            let mut state = self.lock();
            match &*state {
                State::Resolved(result) => return result.clone().map_err(PromiseError::from),
                State::Running(receiver) => {
                    let receiver = receiver.clone();
                    task.tracker.begin_wait(task.id, self.id)?;
                    Role::Wait(receiver)
                }
                State::Unstarted => {
                    if task.cancel.is_cancelled() {
                        return Err(Canceled.into());
                    }
                    let (sender, receiver) = watch::channel(None);
                    *state = State::Running(receiver);
                    task.tracker.begin_compute(task.id, self.id, name);
                    Role::Compute(sender)
                }
            }
        };

        match role {
            Role::Wait(mut receiver) => {
                tracing::trace!(promise = name, "waiting for result computed elsewhere");
                let _waiting = WaitGuard { task: &task };
                let slot = tokio::select! {
                    resolved = receiver.wait_for(Option::is_some) => {
                        resolved.ok().and_then(|slot| (*slot).clone())
                    }
                    _ = task.cancel.cancelled() => None,
                };
                // an empty slot means the owner gave up because the run was canceled
                match slot {
                    Some(result) => result.map_err(PromiseError::from),
                    None => Err(Canceled.into()),
                }
            }
            Role::Compute(sender) => {
                tracing::trace!(promise = name, "computing");
                let mut computing = ComputeGuard {
                    once: self,
                    task: &task,
                    finished: false,
                };
                let outcome = tokio::select! {
                    outcome = compute() => outcome,
                    _ = task.cancel.cancelled() => Err(Canceled),
                };
                computing.finished = true;

                let cycle = task.tracker.end_compute(task.id, self.id);
                match outcome {
                    Ok(value) => {
                        let result = match cycle {
                            Some(err) => on_cycle(err),
                            None => Ok(value),
                        };
                        *self.lock() = State::Resolved(result.clone());
                        sender.send_replace(Some(result.clone()));
                        result.map_err(PromiseError::from)
                    }
                    Err(Canceled) => {
                        tracing::debug!(promise = name, "computation canceled");
                        *self.lock() = State::Unstarted;
                        Err(Canceled.into())
                    }
                }
            }
        }
    }
}

struct WaitGuard<'a> {
    task: &'a TaskContext,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.task.tracker.end_wait(self.task.id);
    }
}

/// Puts an abandoned computation back into the unstarted state
struct ComputeGuard<'a, T> {
    once: &'a Once<T>,
    task: &'a TaskContext,
    finished: bool,
}

impl<T> Drop for ComputeGuard<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            self.task.tracker.end_compute(self.task.id, self.once.id);
            *self.once.lock() = State::Unstarted;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn computes_once_for_concurrent_requesters() {
        let once: Arc<Once<Arc<String>>> = Default::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let results = main_task(CancelToken::new(), async {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let once = Arc::clone(&once);
                    let calls = Arc::clone(&calls);
                    spawn(async move {
                        once.get("value", || async {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(Arc::new("computed".to_string()))
                        })
                        .await
                    })
                })
                .collect();

            let mut results = vec![];
            for handle in handles {
                results.push(handle.await.unwrap().unwrap());
            }
            results
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }

    #[tokio::test]
    async fn direct_self_reference_fails_instead_of_waiting() {
        let once: Once<u32> = Once::new();

        let result = main_task(CancelToken::new(), async {
            once.get("a", || async {
                let inner = once.get("a", || async { Ok(0) }).await;
                assert!(matches!(inner, Err(PromiseError::Circular(_))));
                Ok(1)
            })
            .await
        })
        .await;

        assert_eq!(
            result,
            Err(PromiseError::Circular(CycleError {
                chain: vec!["a".into()]
            }))
        );
        // the cycle is memoized like any other result
        assert!(matches!(once.resolved(), Some(Err(_))));
    }

    #[tokio::test]
    async fn nested_cycle_in_one_task_marks_every_member() {
        let a: Once<u32> = Once::new();
        let b: Once<u32> = Once::new();
        let c: Once<u32> = Once::new();

        let result = main_task(CancelToken::new(), async {
            a.get("a", || async {
                let _ = b
                    .get("b", || async {
                        let _ = c
                            .get("c", || async {
                                let _ = a.get("a", || async { Ok(0) }).await;
                                Ok(3)
                            })
                            .await;
                        Ok(2)
                    })
                    .await;
                Ok(1)
            })
            .await
        })
        .await;

        let expected = CycleError {
            chain: vec!["a".into(), "b".into(), "c".into()],
        };
        assert_eq!(result, Err(PromiseError::Circular(expected.clone())));
        assert_eq!(b.resolved(), Some(Err(expected.clone())));
        assert_eq!(c.resolved(), Some(Err(expected)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cycle_across_tasks_does_not_deadlock() {
        let a: Arc<Once<u32>> = Default::default();
        let b: Arc<Once<u32>> = Default::default();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let run = main_task(CancelToken::new(), {
            let (a, b, barrier) = (a.clone(), b.clone(), barrier.clone());
            async move {
                let first = spawn({
                    let (a, b, barrier) = (a.clone(), b.clone(), barrier.clone());
                    async move {
                        a.get("a", || async {
                            barrier.wait().await;
                            let _ = b.get("b", || async { Ok(0) }).await;
                            Ok(1)
                        })
                        .await
                    }
                });
                let second = spawn(async move {
                    b.get("b", || async {
                        barrier.wait().await;
                        let _ = a.get("a", || async { Ok(0) }).await;
                        Ok(2)
                    })
                    .await
                });
                (first.await.unwrap(), second.await.unwrap())
            }
        });

        let (first, second) = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("cycle must be detected instead of deadlocking");

        assert!(matches!(first, Err(PromiseError::Circular(_))));
        assert!(matches!(second, Err(PromiseError::Circular(_))));
        assert!(matches!(a.resolved(), Some(Err(_))));
        assert!(matches!(b.resolved(), Some(Err(_))));
    }

    #[tokio::test]
    async fn cancellation_aborts_computation_and_keeps_memoized_results() {
        let cancel = CancelToken::new();
        let done: Once<u32> = Once::new();
        let pending: Once<u32> = Once::new();

        let (before, canceled, after) = main_task(cancel.clone(), async {
            let before = done.get("done", || async { Ok(1) }).await;
            let canceled = pending
                .get("pending", || async {
                    cancel.cancel();
                    std::future::pending::<()>().await;
                    Ok(2)
                })
                .await;
            let after = done.get("done", || async { Ok(99) }).await;
            (before, canceled, after)
        })
        .await;

        assert_eq!(before, Ok(1));
        assert_eq!(canceled, Err(PromiseError::Canceled(Canceled)));
        assert_eq!(after, Ok(1));
        assert!(pending.resolved().is_none());

        // a later run may compute the abandoned promise
        let retried = main_task(CancelToken::new(), pending.get("pending", || async { Ok(3) })).await;
        assert_eq!(retried, Ok(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_releases_waiters_on_other_tasks() {
        let cancel = CancelToken::new();
        let pending: Arc<Once<u32>> = Default::default();
        let started = Arc::new(tokio::sync::Notify::new());

        let run = main_task(cancel.clone(), {
            let (pending, started) = (pending.clone(), started.clone());
            async move {
                let owner = spawn({
                    let (pending, started) = (pending.clone(), started.clone());
                    async move {
                        pending
                            .get("pending", || async {
                                started.notify_one();
                                std::future::pending::<()>().await;
                                Ok(1)
                            })
                            .await
                    }
                });
                started.notified().await;

                let waiter = spawn({
                    let pending = pending.clone();
                    async move { pending.get("pending", || async { Ok(2) }).await }
                });
                // give the waiter time to suspend on the owner's computation
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();

                (owner.await.unwrap(), waiter.await.unwrap())
            }
        });

        let (owner, waiter) = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("cancellation must wake every task");

        assert_eq!(owner, Err(PromiseError::Canceled(Canceled)));
        assert_eq!(waiter, Err(PromiseError::Canceled(Canceled)));
        assert!(pending.resolved().is_none());
    }

    #[tokio::test]
    async fn recovered_cycle_is_memoized_as_a_value() {
        let once: Once<Arc<String>> = Once::new();
        let recover = |cycle: CycleError| Arc::new(format!("cycle via {}", cycle.chain.join(",")));

        let result = main_task(CancelToken::new(), async {
            once.get_or_recover(
                "a",
                || async {
                    let inner = once
                        .get_or_recover("a", || async { Ok(Arc::new("inner".to_string())) }, recover)
                        .await;
                    assert!(matches!(inner, Err(PromiseError::Circular(_))));
                    Ok(Arc::new("computed".to_string()))
                },
                recover,
            )
            .await
        })
        .await
        .unwrap();

        assert_eq!(result.as_str(), "cycle via a");
        let again = once.get("a", || async { Ok(Arc::new("other".to_string())) }).await.unwrap();
        assert!(Arc::ptr_eq(&result, &again));
    }

    #[tokio::test]
    async fn requests_after_cancellation_fail() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let once: Once<u32> = Once::new();

        let result = main_task(cancel, once.get("late", || async { Ok(1) })).await;
        assert_eq!(result, Err(PromiseError::Canceled(Canceled)));
    }

    #[tokio::test]
    async fn works_without_explicit_main_task() {
        let once: Once<u32> = Once::new();
        assert_eq!(once.get("implicit", || async { Ok(5) }).await, Ok(5));
        assert_eq!(once.get("implicit", || async { Ok(6) }).await, Ok(5));
    }
}
