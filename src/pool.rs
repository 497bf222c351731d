use std::{
    ops::{Deref, DerefMut},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use crate::storage::StoreError;

type Connector<C> = Box<dyn Fn() -> Result<C, StoreError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Connections kept open for reuse once returned.
    pub max_idle: usize,
    /// Connections open at once, checked out or idle.
    pub max_open: usize,
    /// How long `get` waits for a connection when `max_open` are in use.
    pub checkout_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_idle: 8,
            max_open: 16,
            checkout_timeout: Duration::from_secs(30),
        }
    }
}

struct PoolState<C> {
    idle: Vec<C>,
    open: usize,
}

/// Keeps idle connections around for reuse. Connections are opened on demand
/// when none is idle, up to `max_open`; callers beyond that wait for one to
/// be returned.
pub struct Pool<C> {
    state: Mutex<PoolState<C>>,
    returned: Condvar,
    options: PoolOptions,
    connect: Connector<C>,
}

impl<C> Pool<C> {
    pub fn new<F>(options: PoolOptions, connect: F) -> Self
    where
        F: Fn() -> Result<C, StoreError> + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
            }),
            returned: Condvar::new(),
            options: PoolOptions {
                max_open: options.max_open.max(1),
                ..options
            },
            connect: Box::new(connect),
        }
    }

    pub fn get(&self) -> Result<PooledConnection<'_, C>, StoreError> {
        let limit = Instant::now() + self.options.checkout_timeout;
        let mut state = self.state();

        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(self.checked_out(conn));
            }
            if state.open < self.options.max_open {
                state.open += 1;
                drop(state);
                tracing::trace!("opening new pooled connection");
                return match (self.connect)() {
                    Ok(conn) => Ok(self.checked_out(conn)),
                    Err(e) => {
                        self.release_slot();
                        Err(e)
                    }
                };
            }

            let now = Instant::now();
            if now >= limit {
                tracing::warn!(max_open = self.options.max_open, "Connection pool exhausted");
                return Err(StoreError::Connection(format!(
                    "no pooled connection available after {:?} ({} open)",
                    self.options.checkout_timeout, self.options.max_open
                )));
            }
            state = self
                .returned
                .wait_timeout(state, limit - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn idle_count(&self) -> usize {
        self.state().idle.len()
    }

    /// Connections currently open, idle or checked out.
    pub fn open_count(&self) -> usize {
        self.state().open
    }

    fn state(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checked_out(&self, conn: C) -> PooledConnection<'_, C> {
        PooledConnection {
            pool: self,
            conn: Some(conn),
            broken: false,
        }
    }

    fn put(&self, conn: C) {
        let mut state = self.state();
        if state.idle.len() < self.options.max_idle {
            state.idle.push(conn);
        } else {
            state.open -= 1;
        }
        drop(state);
        self.returned.notify_one();
    }

    fn release_slot(&self) {
        self.state().open -= 1;
        self.returned.notify_one();
    }
}

/// A checked-out connection, returned to its pool on drop unless marked broken.
pub struct PooledConnection<'a, C> {
    pool: &'a Pool<C>,
    conn: Option<C>,
    broken: bool,
}

impl<C> PooledConnection<'_, C> {
    /// Closes the connection instead of returning it, for connections left in
    /// an unknown state (e.g. a failed rollback).
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<C> Deref for PooledConnection<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only `drop` takes the connection out.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<C> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<C> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.broken {
                drop(conn);
                self.pool.release_slot();
            } else {
                self.pool.put(conn);
            }
        }
    }
}
