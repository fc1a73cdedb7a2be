use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::errors::{usage_error, UsageError};


/// Receives the error output of a command in a chain.  The handle is empty
/// until the chain has been waited on; it then holds all the bytes that
/// command wrote to its stderr, provided the command itself succeeded (even if
/// another command in the chain failed).  Clones of a handle share
/// the same contents.
///
/// See [crate::CommandChain::capture_error].
#[derive(Clone,Debug,Default)]
pub struct CaptureHandle(Arc<Mutex<Option<Vec<u8>>>>);

impl CaptureHandle {
    pub fn new() -> CaptureHandle
    {
        CaptureHandle::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<u8>>>
    {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the captured bytes.
    ///
    /// Panics if the chain has not yet been waited on, or the command failed.
    #[track_caller]
    pub fn get(&self) -> Vec<u8>
    {
        match self.try_get() {
            Some(data) => data,
            None => usage_error(UsageError::NotWaited),
        }
    }

    /// Returns the captured bytes as a String (with lossy UTF-8 conversion).
    ///
    /// Panics if the chain has not yet been waited on, or the command failed.
    #[track_caller]
    pub fn get_string(&self) -> String
    {
        String::from_utf8_lossy(&self.get()).into_owned()
    }

    /// Returns the captured bytes, or None if they are not available yet.
    pub fn try_get(&self) -> Option<Vec<u8>>
    {
        self.lock().clone()
    }

    pub fn is_ready(&self) -> bool
    {
        self.lock().is_some()
    }

    pub(crate) fn set(&self, data: Vec<u8>)
    {
        *self.lock() = Some(data);
    }
}


/// Receives the exit status code of a command whose status is checked by
/// [crate::CommandChain::allow_exit_status] or
/// [crate::CommandChain::allow_any_exit_status].  The code is recorded when
/// the command is waited on, whether or not the code was an allowed one; it
/// remains unset if the command did not exit normally (e.g. it was killed by a
/// signal).
#[derive(Clone,Debug,Default)]
pub struct ObservedStatus(Arc<Mutex<Option<i32>>>);

impl ObservedStatus {
    pub fn new() -> ObservedStatus
    {
        ObservedStatus::default()
    }

    pub fn get(&self) -> Option<i32>
    {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, code: i32)
    {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
    }
}


// ----------------------------------------------------------------------
// TESTS
// ----------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    #[should_panic(expected = "CommandChain hasn't been waited on yet")]
    fn test_capture_before_wait() {
        let h = CaptureHandle::new();
        h.get();
    }

    #[test]
    fn test_capture_set_shared_by_clones() {
        let h = CaptureHandle::new();
        let h2 = h.clone();
        assert!(!h.is_ready());
        assert_eq!(h.try_get(), None);
        h2.set(b"oops\n".to_vec());
        assert!(h.is_ready());
        assert_eq!(h.get(), b"oops\n");
        assert_eq!(h.get_string(), "oops\n");
    }

    #[test]
    fn test_empty_capture_is_ready() {
        let h = CaptureHandle::new();
        h.set(Vec::new());
        assert_eq!(h.get(), Vec::<u8>::new());
    }

    #[test]
    fn test_observed_status() {
        let s = ObservedStatus::new();
        assert_eq!(s.get(), None);
        s.clone().set(3);
        assert_eq!(s.get(), Some(3));
    }
}
