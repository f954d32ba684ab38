#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use bytes::BytesMut;

/// A pool of reusable, fixed-capacity buffers.
///
/// Pulling a [`Buffer`] either reuses a previously returned allocation or
/// creates a new one. Dropping a [`Buffer`] returns it to the pool.
#[derive(Clone)]
pub struct BufferPool<B> {
    inner: Arc<lockfree_object_pool::MutexObjectPool<B>>,
}

impl<B> BufferPool<B>
where
    B: Buf,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(lockfree_object_pool::MutexObjectPool::new(
                move || B::with_capacity(capacity),
                |_| {},
            )),
        }
    }

    pub fn pull(&self) -> Buffer<B> {
        Buffer {
            inner: self.inner.pull_owned(),
            pool: self.inner.clone(),
        }
    }
}

impl<B> BufferPool<B>
where
    B: Buf + DerefMut<Target = [u8]>,
{
    pub fn pull_initialised(&self, data: &[u8]) -> Buffer<B> {
        let mut buffer = self.pull();
        let len = data.len();

        buffer.resize_to(len);
        buffer.copy_from_slice(data);

        buffer
    }
}

pub struct Buffer<B> {
    inner: lockfree_object_pool::MutexOwnedReusable<B>,
    pool: Arc<lockfree_object_pool::MutexObjectPool<B>>,
}

impl Buffer<Vec<u8>> {
    /// Truncates N bytes from the front of the buffer.
    pub fn truncate_front(&mut self, num: usize) {
        let current_len = self.len();

        self.copy_within(num.., 0);
        self.truncate(current_len - num);
    }

    /// Moves the buffer back by N bytes, returning the new space at the front of the buffer.
    pub fn move_back(&mut self, num: usize) -> &mut [u8] {
        let current_len = self.len();

        self.resize(current_len + num, 0);
        self.copy_within(..current_len, num);

        &mut self[..num]
    }
}

impl<B> Clone for Buffer<B>
where
    B: Buf,
{
    fn clone(&self) -> Self {
        let mut copy = self.pool.pull_owned();

        self.inner.deref().clone_into_buf(&mut copy);

        Self {
            inner: copy,
            pool: self.pool.clone(),
        }
    }
}

impl<B> PartialEq for Buffer<B>
where
    B: Deref<Target = [u8]>,
{
    fn eq(&self, other: &Self) -> bool {
        self.as_ref() == other.as_ref()
    }
}

impl<B> Eq for Buffer<B> where B: Deref<Target = [u8]> {}

impl<B> std::fmt::Debug for Buffer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Buffer").finish()
    }
}

impl<B> Deref for Buffer<B> {
    type Target = B;

    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}

impl<B> DerefMut for Buffer<B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.deref_mut()
    }
}

pub trait Buf: Sized {
    fn with_capacity(capacity: usize) -> Self;
    fn clone_into_buf(&self, dst: &mut Self);
    fn resize_to(&mut self, len: usize);
}

impl Buf for Vec<u8> {
    fn with_capacity(capacity: usize) -> Self {
        vec![0; capacity]
    }

    fn clone_into_buf(&self, dst: &mut Self) {
        dst.resize(self.len(), 0);
        dst.copy_from_slice(self);
    }

    fn resize_to(&mut self, len: usize) {
        self.resize(len, 0);
    }
}

impl Buf for BytesMut {
    fn with_capacity(capacity: usize) -> Self {
        BytesMut::zeroed(capacity)
    }

    fn clone_into_buf(&self, dst: &mut Self) {
        dst.resize(self.len(), 0);
        dst.copy_from_slice(self);
    }

    fn resize_to(&mut self, len: usize) {
        self.resize(len, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_can_be_cloned() {
        let pool = BufferPool::<Vec<u8>>::new(1024);

        let buffer = pool.pull_initialised(b"hello world");

        #[allow(clippy::redundant_clone)]
        let buffer2 = buffer.clone();

        assert_eq!(&buffer2[..], &buffer[..]);
    }

    #[test]
    fn cloned_buffer_owns_its_own_memory() {
        let pool = BufferPool::<Vec<u8>>::new(1024);

        let buffer = pool.pull_initialised(b"hello world");

        let buffer2 = buffer.clone();
        drop(buffer);

        assert_eq!(&buffer2[..11], b"hello world");
    }

    #[test]
    fn initialised_buffer_is_only_as_long_as_content() {
        let pool = BufferPool::<Vec<u8>>::new(1024);

        let buffer = pool.pull_initialised(b"hello world");

        assert_eq!(buffer.len(), 11);
    }

    #[test]
    fn truncate_front_drops_leading_bytes() {
        let pool = BufferPool::<Vec<u8>>::new(1024);

        let mut buffer = pool.pull_initialised(b"hello world");
        buffer.truncate_front(6);

        assert_eq!(&buffer[..], b"world");
    }
}
