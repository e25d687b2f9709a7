//! Bounded object pool with RAII return.
//!
//! Connection read buffers are rented for the duration of a preamble and
//! returned when the guard drops. The pool keeps at most `capacity` idle
//! objects; surplus returns are simply dropped.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, PoisonError},
};

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

struct Shared<T> {
    free: Mutex<Vec<T>>,
    capacity: usize,
    factory: Factory<T>,
}

/// A bounded free list of reusable objects.
pub struct ObjectPool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> ObjectPool<T> {
    /// Number of idle objects currently held.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("capacity", &self.shared.capacity)
            .field("idle", &self.idle())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> ObjectPool<T> {
    /// Create a pool that holds at most `capacity` idle objects and builds
    /// new ones with `factory` when empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use netframing::buffer_pool::ObjectPool;
    ///
    /// let pool = ObjectPool::new(2, || vec![0_u8; 16]);
    /// let first = pool.take();
    /// assert_eq!(first.len(), 16);
    /// drop(first);
    /// assert_eq!(pool.idle(), 1);
    /// ```
    pub fn new(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
                factory: Box::new(factory),
            }),
        }
    }

    /// Rent an object, reusing an idle one when available.
    #[must_use]
    pub fn take(&self) -> Pooled<T> {
        let reused = self
            .shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let value = reused.unwrap_or_else(|| (self.shared.factory)());
        Pooled {
            value: Some(value),
            pool: Arc::clone(&self.shared),
        }
    }
}

/// An object rented from an [`ObjectPool`]; returned to the pool on drop.
pub struct Pooled<T> {
    value: Option<T>,
    pool: Arc<Shared<T>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.value.as_ref() {
            Some(value) => value,
            None => unreachable!("pooled value is only taken on drop"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.value.as_mut() {
            Some(value) => value,
            None => unreachable!("pooled value is only taken on drop"),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        let mut free = self
            .pool
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.pool.capacity {
            free.push(value);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.value).finish()
    }
}
