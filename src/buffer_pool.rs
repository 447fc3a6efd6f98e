use tokio::sync::Mutex;

/// Relay buffers and the header parser's primary buffer.
pub const SMALL_BUFFER_SIZE: usize = 4_096;
/// The header parser's secondary buffer.
pub const LARGE_BUFFER_SIZE: usize = 16_384;

const MAX_POOL_SIZE: usize = 100;

/// Buffer pool shared by all sessions, backed by async-aware mutexes.
pub struct BufferPool {
    small_buffers: Mutex<Vec<Vec<u8>>>,
    large_buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            small_buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
            large_buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    fn buffer_size(large: bool) -> usize {
        if large {
            LARGE_BUFFER_SIZE
        } else {
            SMALL_BUFFER_SIZE
        }
    }

    /// Get a buffer from the pool or allocate a fresh one.
    pub async fn get_buffer(&self, large: bool) -> Vec<u8> {
        let size = Self::buffer_size(large);
        let mut pool = if large {
            self.large_buffers.lock().await
        } else {
            self.small_buffers.lock().await
        };

        match pool.pop() {
            Some(buffer) => {
                debug_assert_eq!(buffer.len(), size);
                buffer
            }
            None => vec![0u8; size],
        }
    }

    /// Return a buffer to the pool for reuse.
    pub async fn return_buffer(&self, mut buffer: Vec<u8>, large: bool) {
        let expected_size = Self::buffer_size(large);

        // Reject buffers with the wrong capacity to avoid memory bloat
        if buffer.capacity() < expected_size || buffer.capacity() > expected_size * 2 {
            return;
        }

        // Zero the buffer on return to avoid leaking data between connections
        buffer.clear();
        buffer.resize(expected_size, 0);

        let mut pool = if large {
            self.large_buffers.lock().await
        } else {
            self.small_buffers.lock().await
        };

        if pool.len() < MAX_POOL_SIZE {
            pool.push(buffer);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Global buffer pool instance
static BUFFER_POOL: std::sync::OnceLock<BufferPool> = std::sync::OnceLock::new();

fn get_buffer_pool() -> &'static BufferPool {
    BUFFER_POOL.get_or_init(BufferPool::new)
}

/// Convenience function to get a buffer from the global pool
pub async fn get_buffer(large: bool) -> Vec<u8> {
    get_buffer_pool().get_buffer(large).await
}

/// Convenience function to return a buffer to the global pool
pub async fn return_buffer(buffer: Vec<u8>, large: bool) {
    get_buffer_pool().return_buffer(buffer, large).await;
}
