//! Scoped ownership of intermediate buffers.
//!
//! A [`Lifetime`] owns every buffer adopted into it and frees them all when
//! it goes away, except the ones taken back out with [`Lifetime::keep`].

use crate::buffer::Buffer;

/// Index of a buffer adopted into a [`Lifetime`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle(usize);

#[derive(Debug, Default)]
pub struct Lifetime {
    buffers: Vec<Option<Buffer>>,
}

impl Lifetime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `buffer`. Its consumed flag is cleared; the arena
    /// decides when it is freed.
    pub fn adopt(&mut self, buffer: Buffer) -> Handle {
        buffer.set_consumed(false);
        self.buffers.push(Some(buffer));
        Handle(self.buffers.len() - 1)
    }

    /// `None` once the buffer was kept.
    pub fn get(&self, handle: Handle) -> Option<&Buffer> {
        self.buffers.get(handle.0)?.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Buffer> {
        self.buffers.get_mut(handle.0)?.as_mut()
    }

    /// Move a buffer out so it outlives the arena.
    pub fn keep(&mut self, handle: Handle) -> Option<Buffer> {
        self.buffers.get_mut(handle.0)?.take()
    }

    /// Buffers still owned by the arena.
    pub fn len(&self) -> usize {
        self.buffers.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free every buffer not kept.
    pub fn release(self) {}
}

impl Drop for Lifetime {
    fn drop(&mut self) {
        let owned = self.len();
        for buffer in self.buffers.drain(..).flatten() {
            buffer.free();
        }
        if owned > 0 {
            tracing::trace!(owned, "lifetime released");
        }
    }
}
