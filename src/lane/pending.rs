use std::collections::VecDeque;
use std::io;

use bytes::{Buf, Bytes};

use crate::error::{Error, Result};

/// Bytes received from the channel that the socket has not accepted yet.
pub struct PendingWriteQueue {
    queue: VecDeque<Bytes>,
    len: usize,
    capacity: usize,
}

impl PendingWriteQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            len: 0,
            capacity,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
    /// Queued bytes.
    pub fn len(&self) -> usize {
        self.len
    }
    /// Fails without queueing anything when `data` does not fit.
    pub fn push(&mut self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let required = self.len + data.len();
        if required > self.capacity {
            return Err(Error::Overflow {
                cap: self.capacity,
                required,
            });
        }
        self.len = required;
        self.queue.push_back(data);
        Ok(())
    }
    /// Writes queued buffers in order until `write` would block.
    pub fn flush<F>(&mut self, mut write: F) -> io::Result<()>
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        while let Some(front) = self.queue.front_mut() {
            match write(&front[..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.len -= n;
                    if n >= front.len() {
                        self.queue.pop_front();
                    } else {
                        front.advance(n);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
