use std::path::PathBuf;
use anyhow;
use thiserror;


/// Runtime failures of a [crate::CommandChain].  These are environmental
/// conditions (files that cannot be opened, programs that cannot be started,
/// commands that exit with an unexpected status) and are returned to the
/// caller wrapped in an [anyhow::Error]; use `downcast_ref::<ChainError>()` to
/// recover the specific kind.
///
/// Stage numbers in these errors are 1-based positions in the chain.
#[derive(thiserror::Error,Debug)]
pub enum ChainError {

    #[error("Unable to open file {1:?} for {0}: {2}")]
    ErrorOpeningFile(&'static str, PathBuf, std::io::Error),

    #[error("Pipe creation failed on {0}: {1}")]
    ErrorCreatingPipe(String, std::io::Error),

    #[error("Temporary file creation failed on {0}: {1:#}")]
    ErrorCreatingTempFile(String, anyhow::Error),

    #[error("Unable to duplicate {1} for {0}: {2}")]
    ErrorDuplicatingSink(String, &'static str, std::io::Error),

    #[error("duplicate command {0:?} detected without a pipe")]
    ErrorMissingPipe(String),

    #[error("unable to execute command {0:?} (command #{1}): {2}")]
    ErrorStarting(String, usize, std::io::Error),

    #[error("failed to wait on command {0:?} (command #{1}): {2}")]
    ErrorWaiting(String, usize, std::io::Error),

    #[error("command {0:?} (command #{1}) failed with exit status {2}")]
    ErrorExitStatus(String, usize, i32),

    #[error("failed to feed input to command {0:?} (command #{1}): {2}")]
    ErrorFeedingInput(String, usize, std::io::Error),

    #[error("failed to copy output of command {0:?} (command #{1}): {2}")]
    ErrorCopyingOutput(String, usize, std::io::Error),

    #[error("failed to read captured stderr of command {0:?} (command #{1}) from {2:?}: {3}")]
    ErrorReadingCapture(String, usize, PathBuf, std::io::Error),

    #[error("failed reading output of the command chain: {0}")]
    ErrorReadingOutput(std::io::Error),
}

impl ChainError {

    /// Returns the exit status code for an [ChainError::ErrorExitStatus]; this
    /// is `-1` if the command did not exit normally (e.g. it was killed by a
    /// signal).
    pub fn exit_code(&self) -> Option<i32>
    {
        match self {
            ChainError::ErrorExitStatus(_, _, code) => Some(*code),
            _ => None,
        }
    }

    /// Returns the 1-based position in the chain of the command this error
    /// is about, if it is about a particular command.
    pub fn stage(&self) -> Option<usize>
    {
        match self {
            ChainError::ErrorStarting(_, n, _) |
            ChainError::ErrorWaiting(_, n, _) |
            ChainError::ErrorExitStatus(_, n, _) |
            ChainError::ErrorFeedingInput(_, n, _) |
            ChainError::ErrorCopyingOutput(_, n, _) |
            ChainError::ErrorReadingCapture(_, n, _, _) => Some(*n),
            _ => None,
        }
    }
}


/// Programmer errors in the way a [crate::CommandChain] was assembled or
/// driven.  These are never returned: the chain panics with the message of
/// the corresponding UsageError, since no runtime condition can make the
/// same sequence of calls valid.
#[derive(thiserror::Error,Debug,Clone,PartialEq)]
pub enum UsageError {

    #[error("Invalid operation on CommandChain: it is already running")]
    NotBuilding,

    #[error("Invalid operation start() on CommandChain: it has already been started")]
    AlreadyStarted,

    #[error("Invalid operation wait() on CommandChain: it is not running")]
    NotRunning,

    #[error("No command is set yet")]
    NoCommand,

    #[error("Expecting next command to consume input")]
    DanglingInput,

    #[error("{0} has already been set on command {1}")]
    AlreadySet(&'static str, String),

    #[error("allow_exit_status expects 1 or more allowed status codes")]
    NoAllowedStatus,

    #[error("CommandChain hasn't been waited on yet")]
    NotWaited,
}

/// Aborts the current operation with the specified usage error.
#[track_caller]
pub(crate) fn usage_error(err: UsageError) -> !
{
    panic!("{}", err)
}


/// Converts an error returned from a chain operation into a panic; this is
/// the common implementation of the `must_xxx` methods.
#[track_caller]
pub(crate) fn must<T>(result: anyhow::Result<T>) -> T
{
    match result {
        Ok(v) => v,
        Err(e) => panic!("Unable to execute command(s): {:#}", e),
    }
}


// ----------------------------------------------------------------------
// TESTS
// ----------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_exit_code_and_stage() {
        let e = ChainError::ErrorExitStatus("false".into(), 2, 1);
        assert_eq!(e.exit_code(), Some(1));
        assert_eq!(e.stage(), Some(2));
        assert_eq!(format!("{}", e),
                   "command \"false\" (command #2) failed with exit status 1");

        let e = ChainError::ErrorMissingPipe("wc".into());
        assert_eq!(e.exit_code(), None);
        assert_eq!(e.stage(), None);
        assert_eq!(format!("{}", e),
                   "duplicate command \"wc\" detected without a pipe");
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err = anyhow::Error::new(ChainError::ErrorExitStatus("sh".into(), 1, -1))
            .context("running the chain");
        match err.root_cause().downcast_ref::<ChainError>() {
            Some(ChainError::ErrorExitStatus(prog, 1, -1)) => assert_eq!(prog, "sh"),
            other => panic!("Unexpected root cause: {:?}", other),
        }
    }

    #[test]
    #[should_panic(expected = "Stdout has already been set on command \"cat\" (command #1)")]
    fn test_usage_error_message() {
        usage_error(UsageError::AlreadySet("Stdout", "\"cat\" (command #1)".into()));
    }

    #[test]
    #[should_panic(expected = "Unable to execute command(s): outer: inner")]
    fn test_must_panics_with_context() {
        let r: anyhow::Result<()> = Err(anyhow::anyhow!("inner")).map_err(|e| e.context("outer"));
        must(r);
    }

    #[test]
    fn test_must_passes_value() {
        assert_eq!(must(Ok::<_, anyhow::Error>(7)), 7);
    }
}
