use crate::errors::EngineError;
use crate::id::{Uid, Xid};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Tracks which transaction holds which record uid and who is waiting
/// for whom. Deadlock is detected synchronously inside `add`, before the
/// caller ever blocks.
pub(crate) struct LockTable {
    inner: Mutex<LockTableInner>,
}

struct LockTableInner {
    // xid -> uids it holds
    holds: HashMap<u64, Vec<u64>>,
    // uid -> holding xid
    held_by: HashMap<u64, u64>,
    // uid -> waiting xids, FIFO
    waiters: HashMap<u64, VecDeque<u64>>,
    // waiting xid -> its blocking handle
    handles: HashMap<u64, Arc<WaitState>>,
    // waiting xid -> the uid it waits for
    waiting_on: HashMap<u64, u64>,
}

struct WaitState {
    granted: Mutex<bool>,
    cond: Condvar,
}

/// Handle a blocked acquirer parks on until the resource is handed over.
pub(crate) struct WaitHandle {
    state: Arc<WaitState>,
}

impl std::fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitHandle").finish_non_exhaustive()
    }
}

impl WaitHandle {
    pub(crate) fn wait(self) {
        let mut granted = self.state.granted.lock();
        while !*granted {
            self.state.cond.wait(&mut granted);
        }
    }
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(LockTableInner {
                holds: HashMap::default(),
                held_by: HashMap::default(),
                waiters: HashMap::default(),
                handles: HashMap::default(),
                waiting_on: HashMap::default(),
            }),
        }
    }

    /// Tries to acquire `uid` for `xid`. `None` means the resource is
    /// already held (re-acquisition) or was granted on the spot; a
    /// handle means the caller must block on it. If blocking would close
    /// a wait cycle, the wait edge is rolled back and a deadlock error
    /// raised instead.
    pub(crate) fn add(&self, xid: Xid, uid: Uid) -> anyhow::Result<Option<WaitHandle>> {
        let (x, u) = (xid.get(), uid.get());
        let mut inner = self.inner.lock();

        if inner.holds.get(&x).is_some_and(|held| held.contains(&u)) {
            return Ok(None);
        }
        if !inner.held_by.contains_key(&u) {
            inner.held_by.insert(u, x);
            inner.holds.entry(x).or_default().push(u);
            return Ok(None);
        }

        inner.waiting_on.insert(x, u);
        inner.waiters.entry(u).or_default().push_back(x);

        if inner.has_deadlock() {
            inner.waiting_on.remove(&x);
            let queue = inner.waiters.get_mut(&u).unwrap();
            queue.retain(|waiter| *waiter != x);
            if queue.is_empty() {
                inner.waiters.remove(&u);
            }
            return Err(EngineError::Deadlock.into());
        }

        let state = Arc::new(WaitState {
            granted: Mutex::new(false),
            cond: Condvar::new(),
        });
        inner.handles.insert(x, state.clone());
        Ok(Some(WaitHandle { state }))
    }

    /// Releases everything `xid` holds, handing each resource to its
    /// next live FIFO waiter, and clears any wait state `xid` left.
    pub(crate) fn remove(&self, xid: Xid) {
        let x = xid.get();
        let mut inner = self.inner.lock();

        if let Some(held) = inner.holds.remove(&x) {
            for u in held {
                Self::grant_next(&mut inner, u);
            }
        }
        inner.waiting_on.remove(&x);
        inner.handles.remove(&x);
    }

    fn grant_next(inner: &mut LockTableInner, u: u64) {
        inner.held_by.remove(&u);
        let Some(queue) = inner.waiters.get_mut(&u) else {
            return;
        };

        while let Some(x) = queue.pop_front() {
            // waiters removed in the meantime have no handle anymore
            let Some(state) = inner.handles.remove(&x) else {
                continue;
            };
            inner.held_by.insert(u, x);
            inner.holds.entry(x).or_default().push(u);
            inner.waiting_on.remove(&x);
            *state.granted.lock() = true;
            state.cond.notify_all();
            break;
        }

        if inner.waiters.get(&u).is_some_and(VecDeque::is_empty) {
            inner.waiters.remove(&u);
        }
    }
}

impl LockTableInner {
    /// One DFS pass over the wait-for graph. Every node visited in the
    /// current walk carries the walk's stamp; meeting the stamp again is
    /// a cycle, while a node stamped by an earlier walk is known
    /// cycle-free. Results are memoized for the duration of the pass.
    fn has_deadlock(&self) -> bool {
        let mut stamps: HashMap<u64, u32> = HashMap::default();
        let mut verdicts: HashMap<u64, bool> = HashMap::default();
        let mut stamp = 0u32;

        for &x in self.holds.keys() {
            if stamps.contains_key(&x) {
                continue;
            }
            stamp += 1;
            if self.dfs(x, stamp, &mut stamps, &mut verdicts) {
                return true;
            }
        }
        false
    }

    fn dfs(
        &self,
        x: u64,
        stamp: u32,
        stamps: &mut HashMap<u64, u32>,
        verdicts: &mut HashMap<u64, bool>,
    ) -> bool {
        if let Some(&verdict) = verdicts.get(&x) {
            return verdict;
        }
        if let Some(&seen) = stamps.get(&x) {
            let cycle = seen == stamp;
            verdicts.insert(x, cycle);
            return cycle;
        }
        stamps.insert(x, stamp);

        let cycle = self
            .waiting_on
            .get(&x)
            .and_then(|u| self.held_by.get(u))
            .is_some_and(|&holder| self.dfs(holder, stamp, stamps, verdicts));
        verdicts.insert(x, cycle);
        cycle
    }
}
