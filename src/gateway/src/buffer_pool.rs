//! Reactor-local object pools.
//!
//! A [`Pool`] is an index-addressed arena of reusable objects. Checking out an
//! object yields a [`Lease`] that puts the object back into its slot when it
//! is dropped, so every exit path returns it exactly once. Pools are `!Send`
//! and live on the I/O worker thread that created them.
use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::{Rc, Weak};

use faas_common::log;

struct PoolInner<T> {
    name: &'static str,
    /// `Some` while the object sits in the pool, `None` while it is leased.
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    new_fn: Box<dyn Fn() -> T>,
    reset_fn: fn(&mut T),
}

pub struct Pool<T> {
    inner: Rc<RefCell<PoolInner<T>>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Pool")
            .field("name", &inner.name)
            .field("capacity", &inner.slots.len())
            .field("free", &inner.free.len())
            .finish()
    }
}

impl<T> Pool<T> {
    pub fn new<F>(name: &'static str, initial: usize, new_fn: F, reset_fn: fn(&mut T)) -> Self
    where
        F: Fn() -> T + 'static,
    {
        let slots: Vec<Option<T>> = (0..initial).map(|_| Some(new_fn())).collect();
        // hand out low indices first
        let free = (0..initial).rev().collect();
        Pool {
            inner: Rc::new(RefCell::new(PoolInner {
                name,
                slots,
                free,
                new_fn: Box::new(new_fn),
                reset_fn,
            })),
        }
    }

    /// Checks out an object, growing the pool if every slot is leased.
    pub fn get(&self) -> Lease<T> {
        let mut inner = self.inner.borrow_mut();
        let (index, value) = match inner.free.pop() {
            Some(index) => {
                let value = inner.slots[index].take();
                debug_assert!(value.is_some(), "free slot {} is empty", index);
                (index, value)
            }
            None => {
                let value = (inner.new_fn)();
                inner.slots.push(None);
                let index = inner.slots.len() - 1;
                log::debug!("Pool {} grows to {}", inner.name, inner.slots.len());
                (index, Some(value))
            }
        };
        Lease {
            index,
            value,
            pool: Rc::downgrade(&self.inner),
        }
    }

    /// Number of leased objects.
    #[inline]
    pub fn in_use(&self) -> usize {
        let inner = self.inner.borrow();
        inner.slots.len() - inner.free.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.borrow().slots.len()
    }
}

/// A checked-out pool object. Returned to its slot on drop.
pub struct Lease<T> {
    index: usize,
    value: Option<T>,
    pool: Weak<RefCell<PoolInner<T>>>,
}

impl<T: fmt::Debug> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("index", &self.index)
            .field("value", &self.value)
            .finish()
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        match self.value {
            Some(ref value) => value,
            None => unreachable!("lease value is only taken on drop"),
        }
    }
}

impl<T> DerefMut for Lease<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        match self.value {
            Some(ref mut value) => value,
            None => unreachable!("lease value is only taken on drop"),
        }
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        let (Some(mut value), Some(pool)) = (self.value.take(), self.pool.upgrade()) else {
            return;
        };
        // Reset outside of the borrow: resetting may release leases of other
        // pools, or of this one.
        let reset_fn = pool.borrow().reset_fn;
        reset_fn(&mut value);
        let mut inner = pool.borrow_mut();
        debug_assert!(inner.slots[self.index].is_none());
        inner.slots[self.index] = Some(value);
        inner.free.push(self.index);
    }
}

pub type BufferPool = Pool<Box<[u8]>>;

pub fn buffer_pool(name: &'static str, buffer_size: usize, initial: usize) -> BufferPool {
    Pool::new(
        name,
        initial,
        move || vec![0u8; buffer_size].into_boxed_slice(),
        |_| {},
    )
}

/// One pending write: `buf[offset..len]` is yet to be written.
#[derive(Debug, Default)]
pub struct WriteRequest {
    buf: Option<Lease<Box<[u8]>>>,
    len: usize,
    offset: usize,
}

impl WriteRequest {
    pub fn attach(&mut self, buf: Lease<Box<[u8]>>) {
        debug_assert!(self.buf.is_none());
        self.buf = Some(buf);
        self.len = 0;
        self.offset = 0;
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.buf.is_some()
    }

    #[inline]
    pub fn spare_capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len() - self.len)
    }

    /// Copies as much of `data` as fits and returns the number of bytes taken.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let Some(buf) = self.buf.as_mut() else {
            return 0;
        };
        let n = data.len().min(buf.len() - self.len);
        buf[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    #[inline]
    pub fn unwritten(&self) -> &[u8] {
        match self.buf.as_ref() {
            Some(buf) => &buf[self.offset..self.len],
            None => &[],
        }
    }

    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.offset += n;
        debug_assert!(self.offset <= self.len);
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.offset == self.len
    }

    fn reset(&mut self) {
        // returns the buffer to its own pool
        self.buf = None;
        self.len = 0;
        self.offset = 0;
    }
}

pub type WriteRequestPool = Pool<WriteRequest>;

pub fn write_request_pool(initial: usize) -> WriteRequestPool {
    Pool::new("write_request", initial, WriteRequest::default, WriteRequest::reset)
}
