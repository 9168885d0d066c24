/// Fixed-capacity ring buffer over a backing array with head/tail/count
/// indices.  Element-wise push/pop for small queues, bulk copy in and out
/// for byte streams.
#[derive(Debug)]
pub struct RingBuffer<T, const N: usize> {
    data: [T; N],
    head: u32,
    tail: u32,
    count: u32,
}

impl<T: Copy, const N: usize> RingBuffer<T, N> {
    /// Create a new ring buffer with all elements set to the given value.
    /// This is const-compatible and can be used for static initialization.
    #[inline(always)]
    pub const fn new_with(value: T) -> Self {
        Self {
            data: [value; N],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    /// Returns the current number of elements in the buffer.
    #[inline(always)]
    pub const fn len(&self) -> u32 {
        self.count
    }

    #[inline(always)]
    pub const fn capacity(&self) -> u32 {
        N as u32
    }

    /// Free slots left before the buffer is full.
    #[inline(always)]
    pub const fn space(&self) -> u32 {
        N as u32 - self.count
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.count >= self.capacity()
    }

    /// Push without overwrite; returns true on success, false if full.
    #[inline(always)]
    pub fn try_push(&mut self, value: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.data[self.head as usize] = value;
        self.head = (self.head + 1) % self.capacity();
        self.count += 1;
        true
    }

    /// Pop oldest element; returns Some(value) or None when empty.
    #[inline(always)]
    pub fn try_pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let value = self.data[self.tail as usize];
        self.tail = (self.tail + 1) % self.capacity();
        self.count -= 1;
        Some(value)
    }

    /// Peek at the oldest element without removing it.
    #[inline(always)]
    pub fn peek(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        Some(&self.data[self.tail as usize])
    }

    /// Append as much of `src` as fits, in at most two copies across the
    /// wrap point.  Returns the number of elements written.
    pub fn write_slice(&mut self, src: &[T]) -> usize {
        let amount = src.len().min(self.space() as usize);
        let head = self.head as usize;
        let first = amount.min(N - head);
        self.data[head..head + first].copy_from_slice(&src[..first]);
        self.data[..amount - first].copy_from_slice(&src[first..amount]);
        self.head = ((head + amount) % N) as u32;
        self.count += amount as u32;
        amount
    }

    /// Remove up to `dst.len()` of the oldest elements into `dst`.
    /// Returns the number of elements read.
    pub fn read_into(&mut self, dst: &mut [T]) -> usize {
        let amount = dst.len().min(self.count as usize);
        let tail = self.tail as usize;
        let first = amount.min(N - tail);
        dst[..first].copy_from_slice(&self.data[tail..tail + first]);
        dst[first..amount].copy_from_slice(&self.data[..amount - first]);
        self.tail = ((tail + amount) % N) as u32;
        self.count -= amount as u32;
        amount
    }
}

impl<T: Copy + Default, const N: usize> RingBuffer<T, N> {
    #[inline(always)]
    pub fn new() -> Self {
        Self::new_with(T::default())
    }
}

impl<T: Copy + Default, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
