/// Errors from misusing a [`RefCount`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RefCountError {
    #[error("reference count already reached zero and cannot be reused")]
    Completed,

    #[error("reference count decremented below zero")]
    Underflow,
}

/// Single-use reference counter.
///
/// Counts outstanding users of a resource. The decrement that brings the
/// count back to zero reports it, and the caller then performs the
/// completion action itself (typically after releasing whatever lock guards
/// the counter). After that transition the counter is spent.
///
/// Not synchronized; keep it behind the lock that guards the resource.
#[derive(Debug, Default)]
pub struct RefCount {
    count: usize,
    complete: bool,
}

impl RefCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn increment(&mut self) -> Result<(), RefCountError> {
        if self.complete {
            return Err(RefCountError::Completed);
        }
        self.count += 1;
        Ok(())
    }

    /// Returns `true` exactly once: on the transition to zero.
    pub fn decrement(&mut self) -> Result<bool, RefCountError> {
        if self.complete {
            return Err(RefCountError::Completed);
        }
        if self.count == 0 {
            return Err(RefCountError::Underflow);
        }
        self.count -= 1;
        if self.count == 0 {
            self.complete = true;
        }
        Ok(self.complete)
    }
}
