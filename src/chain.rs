use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;

use crate::config::ChainConfig;
use crate::errors::*;
use crate::execution::OsRun;
use crate::stage::Stage;
use crate::stdio::{InWire, Sink};

mod builder;
mod running;
mod readers;

pub use builder::{NO_ARGS, open_for_read, open_for_write, must_open_for_read, must_open_for_write};
pub use running::{ChainWaiter, ChainResult};
pub use readers::LineStream;
pub(crate) use running::RunningStage;


/// The lifecycle of a [CommandChain].  A chain only moves forward through
/// these states: commands can only be added while `Building`, the chain can
/// only be started once, and only waited on once.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum ChainState {
    Building,
    Running,
    Waiting,
    /// All commands completed successfully.
    Succeeded,
    /// The chain could not be started, or a command failed.
    Failed,
}


// ----------------------------------------------------------------------
/// A chain of sub-process commands, connected by pipes.
///
/// The chain is built by adding commands in pipeline order; the methods that
/// configure a command apply to the most recently added command.  Once built,
/// the chain is started (which starts every command) and then waited on
/// (which waits for every command and reports the first failure).
///
/// ```
/// # use cmdchain::*;
/// let out = CommandChain::new()
///     .command("printf", ["b\\na\\nc\\n"])
///     .pipe()
///     .command("sort", NO_ARGS)
///     .run_and_get_string()?;
/// assert_eq!(out, "a\nb\nc\n");
/// # Ok::<(), anyhow::Error>(())
/// ```
///
/// A CommandChain is a handle: clones refer to the same chain, which is how
/// the [ChainWaiter] and [ChainResult] refer back to it.
//
// All chain data is held in the ChainInternals behind the mutex.  Builder
// calls are expected from a single thread; the mutex allows the waiter and
// result handles to be sent to other threads and makes the temp file cleanup
// at the end of the chain safe from concurrent calls.
#[derive(Clone)]
pub struct CommandChain {
    inner: Arc<Mutex<ChainInternals>>,
}


/// Internal structure managing the chain of commands
pub(crate) struct ChainInternals {
    pub(crate) state: ChainState,

    pub(crate) os: Arc<dyn OsRun>,
    pub(crate) default_stdout: Sink,
    pub(crate) default_stderr: Sink,
    pub(crate) temp_dir: Option<PathBuf>,
    pub(crate) buffer_size: usize,

    pub(crate) stages: Vec<Stage>,

    // Index of the stage that the configuration methods apply to.
    pub(crate) current: Option<usize>,

    // Input waiting to be consumed by the next command added to the chain.
    pub(crate) pending_stdin: Option<InWire>,

    // The first error encountered while building, reported by start().
    pub(crate) deferred: anyhow::Result<()>,

    // Temporary files owned by the chain, removed when the chain finishes.
    pub(crate) temp_files: Vec<NamedTempFile>,

    pub(crate) running: Vec<RunningStage>,
    pub(crate) exit_codes: Vec<Option<i32>>,
}


impl fmt::Debug for CommandChain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ch = self.lock();
        f.debug_struct("CommandChain")
            .field("state", &ch.state)
            .field("stages", &ch.stages)
            .field("pending_stdin", &ch.pending_stdin)
            .field("deferred", &ch.deferred)
            .finish_non_exhaustive()
    }
}


impl CommandChain {

    pub(crate) fn from_config(config: ChainConfig, stdin: Option<InWire>) -> CommandChain
    {
        CommandChain {
            inner: Arc::new(Mutex::new(ChainInternals {
                state: ChainState::Building,
                os: config.executor,
                default_stdout: config.default_stdout,
                default_stderr: config.default_stderr,
                temp_dir: config.temp_dir,
                buffer_size: config.buffer_size,
                stages: Vec::new(),
                current: None,
                pending_stdin: stdin,
                deferred: Ok(()),
                temp_files: Vec::new(),
                running: Vec::new(),
                exit_codes: Vec::new(),
            })),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChainInternals>
    {
        // A usage error panics while holding the lock; the chain data is still
        // consistent enough for the Debug output and the cleanup that follow.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current lifecycle state of the chain.
    pub fn state(&self) -> ChainState
    {
        self.lock().state
    }

    /// Returns the number of commands in the chain.
    pub fn len(&self) -> usize
    {
        self.lock().stages.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.lock().stages.is_empty()
    }

    /// Returns the programs of the commands in the chain, in pipeline order.
    pub fn programs(&self) -> Vec<String>
    {
        self.lock().stages.iter().map(Stage::name).collect()
    }
}


impl ChainInternals {

    pub(crate) fn ensure_building(&self)
    {
        if self.state != ChainState::Building {
            usage_error(UsageError::NotBuilding);
        }
    }

    pub(crate) fn move_to_running(&mut self)
    {
        if self.state != ChainState::Building {
            usage_error(UsageError::AlreadyStarted);
        }
        self.state = ChainState::Running;
    }

    pub(crate) fn move_to_waiting(&mut self)
    {
        if self.state != ChainState::Running {
            usage_error(UsageError::NotRunning);
        }
        self.state = ChainState::Waiting;
    }

    pub(crate) fn move_to_succeeded(&mut self)
    {
        if self.state != ChainState::Waiting {
            usage_error(UsageError::NotRunning);
        }
        self.state = ChainState::Succeeded;
        self.clean_up();
    }

    pub(crate) fn move_to_failed(&mut self)
    {
        self.state = ChainState::Failed;
        for stage in &mut self.stages {
            stage.release();
        }
        self.pending_stdin = None;
        self.clean_up();
    }

    /// Removes the temporary files owned by the chain.  Repeated calls have no
    /// further effect.
    fn clean_up(&mut self)
    {
        for tf in self.temp_files.drain(..) {
            let path = tf.path().to_path_buf();
            if let Err(e) = tf.close() {
                tracing::warn!("Unable to remove temp file {}: {}", path.display(), e);
            }
        }
    }

    /// Returns the stage that configuration methods apply to.
    pub(crate) fn current_stage(&mut self) -> &mut Stage
    {
        match self.current {
            Some(idx) => &mut self.stages[idx],
            None => usage_error(UsageError::NoCommand),
        }
    }

    /// Records an error detected while building the chain, to be reported when
    /// the chain is started.  Only the first such error is kept.
    pub(crate) fn defer(&mut self, err: anyhow::Error)
    {
        if self.deferred.is_ok() {
            tracing::warn!("Error detected: {:#}", err);
            self.deferred = Err(err);
        } else {
            tracing::debug!("Additional error detected: {:#}", err);
        }
    }

    /// Returns (and clears) the deferred error, if any.
    pub(crate) fn take_deferred(&mut self) -> anyhow::Result<()>
    {
        std::mem::replace(&mut self.deferred, Ok(()))
    }

    /// Finalizes the configuration of the current stage.
    pub(crate) fn finalize_current(&mut self)
    {
        if let Some(idx) = self.current {
            let stage = &mut self.stages[idx];
            if let Err(e) = stage.finalize(&self.default_stdout,
                                           &self.default_stderr,
                                           &*self.os) {
                self.defer(anyhow::Error::new(e));
            }
        }
    }
}


// ----------------------------------------------------------------------
// TESTS
// ----------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use crate::*;

    #[test]
    fn test_new_chain_is_building() {
        let chain = CommandChain::new();
        assert_eq!(chain.state(), ChainState::Building);
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
    }

    #[test]
    fn test_clones_share_the_chain() {
        let mut chain = CommandChain::new();
        let other = chain.clone();
        chain.command("echo", ["a"]).pipe().command("cat", NO_ARGS);
        assert_eq!(other.len(), 2);
        assert_eq!(other.programs(), vec!["echo", "cat"]);
    }

    #[test]
    fn test_deferred_keeps_first_error() {
        let chain = CommandChain::new();
        let mut ch = chain.lock();
        ch.defer(anyhow::anyhow!("first"));
        ch.defer(anyhow::anyhow!("second"));
        assert_eq!(format!("{}", ch.take_deferred().unwrap_err()), "first");
        assert!(ch.take_deferred().is_ok());
    }

    #[test]
    fn test_clean_up_is_idempotent() {
        let chain = CommandChain::new();
        let mut ch = chain.lock();
        let tf = tempfile::NamedTempFile::new().unwrap();
        let path = tf.path().to_path_buf();
        ch.temp_files.push(tf);
        ch.move_to_failed();
        assert!(!path.exists());
        ch.move_to_failed();
        assert_eq!(ch.state, ChainState::Failed);
    }

    #[test]
    #[should_panic(expected = "Invalid operation wait() on CommandChain: it is not running")]
    fn test_wait_requires_running() {
        let chain = CommandChain::new();
        chain.lock().move_to_waiting();
    }

    #[test]
    fn test_debug_output() {
        let mut chain = CommandChain::new();
        chain.command("true", NO_ARGS);
        let shown = format!("{:?}", chain);
        assert!(shown.starts_with("CommandChain { state: Building, stages: [Stage { index: 0, program: \"true\""),
                "{}", shown);
    }
}
