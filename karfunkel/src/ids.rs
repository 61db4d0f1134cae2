//! Monotonic id generation shared by all connections.

use std::ops::AddAssign;
use std::sync::Mutex;

use crate::lock;

/// Hands out increasing ids starting at 1. Safe to share between tasks.
#[derive(Debug)]
pub struct IdGenerator<T> {
    next: Mutex<T>,
}

impl<T> IdGenerator<T>
where
    T: Copy + AddAssign + From<u8>,
{
    pub fn new() -> Self {
        Self::starting_at(T::from(1))
    }

    pub fn starting_at(first: T) -> Self {
        Self {
            next: Mutex::new(first),
        }
    }

    pub fn next(&self) -> T {
        let mut next = lock(&self.next);
        let id = *next;
        *next += T::from(1);
        id
    }
}

impl<T> Default for IdGenerator<T>
where
    T: Copy + AddAssign + From<u8>,
{
    fn default() -> Self {
        Self::new()
    }
}
