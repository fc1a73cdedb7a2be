use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::process::{Child, ExitStatus};
use std::thread::JoinHandle;

use crate::capture::CaptureHandle;
use crate::chain::{ChainInternals, CommandChain};
use crate::errors::*;
use crate::execution::OsRun;
use crate::stage::{ExitPolicy, Stage};
use crate::stdio::{start_feeder, Drain};


/// A started command of the chain, along with the helper threads servicing
/// its stdio.
pub(crate) struct RunningStage {
    name: String,
    number: usize,
    child: Child,
    policy: ExitPolicy,
    feeder: Option<JoinHandle<io::Result<u64>>>,
    drains: Vec<JoinHandle<io::Result<u64>>>,
    capture: Option<(usize, CaptureHandle)>,
}

impl RunningStage {

    /// Waits for the command to exit and its stdio threads to finish, and
    /// applies the command's exit status policy.  Returns the exit code (if the
    /// command exited normally) and the resulting error (if any).  When
    /// `output_closed` is set, termination by SIGPIPE is accepted.
    fn finish(mut self, output_closed: bool)
              -> (Option<i32>, Result<(), ChainError>, Option<(usize, CaptureHandle)>)
    {
        let (code, mut result) = match self.child.wait() {
            Ok(status) if output_closed && killed_by_sigpipe(&status) => {
                tracing::debug!("{:?} (command #{}) stopped by the closed output",
                                self.name, self.number);
                (None, Ok(()))
            }
            Ok(status) => {
                tracing::debug!("{:?} (command #{}) exited: {}", self.name, self.number, status);
                (status.code(),
                 self.policy.check(&status)
                 .map_err(|c| ChainError::ErrorExitStatus(self.name.clone(), self.number, c)))
            }
            Err(e) => (None, Err(ChainError::ErrorWaiting(self.name.clone(), self.number, e))),
        };
        if let Some(feeder) = self.feeder.take() {
            if let Err(e) = join_io(feeder) {
                let err = ChainError::ErrorFeedingInput(self.name.clone(), self.number, e);
                result = result.and(Err(err));
            }
        }
        for drain in self.drains.drain(..) {
            if let Err(e) = join_io(drain) {
                let err = ChainError::ErrorCopyingOutput(self.name.clone(), self.number, e);
                result = result.and(Err(err));
            }
        }
        (code, result, self.capture.take())
    }

    /// Stops a command whose chain could not be completely started.
    fn abandon(mut self)
    {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(feeder) = self.feeder.take() {
            let _ = join_io(feeder);
        }
        for drain in self.drains.drain(..) {
            let _ = join_io(drain);
        }
    }
}

/// Spawns the command for one stage and starts the threads that feed its
/// input and copy its output.
fn start_stage(stage: &mut Stage, os: &dyn OsRun) -> Result<RunningStage, ChainError>
{
    let (mut cmd, feed) = stage.prepare();
    let drains: Vec<Drain> = stage.drains.drain(..).collect();
    let spawned = os.spawn_stage(&stage.describe(), &mut cmd);
    // Dropping the command closes this process's copies of the pipe ends that
    // were handed to the child.
    drop(cmd);
    let mut child = spawned
        .map_err(|e| ChainError::ErrorStarting(stage.name(), stage.number(), e))?;
    let feeder = match (feed, child.stdin.take()) {
        (Some(input), Some(stdin)) => Some(start_feeder(input, stdin)),
        _ => None,
    };
    Ok(RunningStage {
        name: stage.name(),
        number: stage.number(),
        child,
        policy: stage.policy.clone().unwrap_or(ExitPolicy::Success),
        feeder,
        drains: drains.into_iter().map(Drain::start).collect(),
        capture: stage.capture.clone(),
    })
}

#[cfg(unix)]
fn killed_by_sigpipe(status: &ExitStatus) -> bool
{
    use std::os::unix::process::ExitStatusExt;
    const SIGPIPE: i32 = 13;
    status.signal() == Some(SIGPIPE)
}

#[cfg(not(unix))]
fn killed_by_sigpipe(_status: &ExitStatus) -> bool
{
    false
}

fn join_io(handle: JoinHandle<io::Result<u64>>) -> io::Result<u64>
{
    handle.join()
        .unwrap_or_else(|_| Err(io::Error::other("stdio copying thread panicked")))
}


/// A handle to a started [CommandChain], which can be waited on.
pub struct ChainWaiter {
    chain: CommandChain,
}

/// Provides the overall result of a successfully completed [CommandChain].
pub struct ChainResult {
    chain: CommandChain,
}

impl fmt::Debug for ChainWaiter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChainWaiter").field("chain", &self.chain).finish()
    }
}

impl fmt::Debug for ChainResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChainResult").field("chain", &self.chain).finish()
    }
}


impl CommandChain {

    /// Starts all of the commands in the chain, in order.
    ///
    /// Returns the first error detected while the chain was being built, if
    /// any; otherwise returns an error if any command could not be started.  In
    /// both cases the chain is then Failed.
    ///
    /// Panics if the chain has already been started, if it has no commands, or
    /// if [CommandChain::pipe] was called on the last command.
    pub fn start(&mut self) -> anyhow::Result<ChainWaiter>
    {
        let mut guard = self.lock();
        let ch: &mut ChainInternals = &mut guard;
        ch.move_to_running();

        if let Err(e) = ch.take_deferred() {
            ch.move_to_failed();
            return Err(e);
        }
        if ch.stages.is_empty() {
            usage_error(UsageError::NoCommand);
        }
        if ch.pending_stdin.is_some() {
            usage_error(UsageError::DanglingInput);
        }
        ch.finalize_current();
        if let Err(e) = ch.take_deferred() {
            ch.move_to_failed();
            return Err(e);
        }

        let mut running: Vec<RunningStage> = Vec::with_capacity(ch.stages.len());
        for idx in 0..ch.stages.len() {
            match start_stage(&mut ch.stages[idx], &*ch.os) {
                Ok(rs) => running.push(rs),
                Err(err) => {
                    tracing::debug!("{}", err);
                    ch.move_to_failed();
                    for rs in running {
                        rs.abandon();
                    }
                    return Err(anyhow::Error::new(err));
                }
            }
        }
        ch.running = running;
        drop(guard);
        Ok(ChainWaiter { chain: self.clone() })
    }

    /// Starts all of the commands in the chain, panicking on any error.
    #[track_caller]
    pub fn must_start(&mut self) -> ChainWaiter
    {
        must(self.start())
    }
}


impl ChainWaiter {

    /// Waits for every command in the chain to complete.
    ///
    /// All commands are waited on, even if an earlier one has failed.  Returns
    /// the first error encountered (in pipeline order); otherwise the chain is
    /// Succeeded.  The [crate::CaptureHandle] of each command that completed
    /// successfully is filled either way.
    pub fn wait(self) -> anyhow::Result<ChainResult>
    {
        self.wait_for_stages(false)
    }

    /// Waits for a chain whose final output was closed before it was all read.
    /// Commands terminated by SIGPIPE as a result are not failures.
    pub(crate) fn wait_after_close(self) -> anyhow::Result<ChainResult>
    {
        self.wait_for_stages(true)
    }

    fn wait_for_stages(self, output_closed: bool) -> anyhow::Result<ChainResult>
    {
        let running = {
            let mut ch = self.chain.lock();
            ch.move_to_waiting();
            std::mem::take(&mut ch.running)
        };

        let mut first_err: Option<ChainError> = None;
        let mut codes = Vec::with_capacity(running.len());
        let mut captures = Vec::new();
        for stage in running {
            let (code, result, capture) = stage.finish(output_closed);
            codes.push(code);
            match result {
                Ok(()) => captures.extend(capture),
                Err(e) if first_err.is_none() => first_err = Some(e),
                Err(e) => tracing::warn!("Additional failure: {}", e),
            }
        }

        let mut ch = self.chain.lock();
        ch.exit_codes = codes;
        if let Err(e) = ch.read_captures(captures) {
            match first_err {
                None => first_err = Some(e),
                Some(_) => tracing::warn!("Additional failure: {}", e),
            }
        }
        match first_err {
            Some(e) => {
                tracing::debug!("Command chain failed: {}", e);
                ch.move_to_failed();
                Err(anyhow::Error::new(e))
            }
            None => {
                ch.move_to_succeeded();
                drop(ch);
                Ok(ChainResult { chain: self.chain })
            }
        }
    }

    /// Waits for every command in the chain to complete, panicking on any
    /// error.
    #[track_caller]
    pub fn must_wait(self) -> ChainResult
    {
        must(self.wait())
    }

    /// Returns the chain being run.
    pub fn chain(&self) -> &CommandChain
    {
        &self.chain
    }
}


impl ChainResult {

    pub fn chain(&self) -> &CommandChain
    {
        &self.chain
    }

    /// Returns the exit code of each command of the chain, in pipeline order.
    /// A command terminated by a signal has no exit code.
    pub fn exit_codes(&self) -> Vec<Option<i32>>
    {
        self.chain.lock().exit_codes.clone()
    }
}


impl ChainInternals {

    /// Transfers the stderr collected in the temporary files to the
    /// corresponding capture handles.
    fn read_captures(&mut self, captures: Vec<(usize, CaptureHandle)>)
                     -> Result<(), ChainError>
    {
        let mut result = Ok(());
        for (slot, handle) in captures {
            let tf = &mut self.temp_files[slot];
            let path = tf.path().to_path_buf();
            let file = tf.as_file_mut();
            let mut data = Vec::new();
            let read = file.seek(SeekFrom::Start(0)).and_then(|_| file.read_to_end(&mut data));
            match read {
                Ok(_) => handle.set(data),
                Err(e) => {
                    let stage = self.stages.iter()
                        .find(|s| s.capture.as_ref().is_some_and(|(n, _)| *n == slot));
                    let (name, number) = stage.map(|s| (s.name(), s.number()))
                        .unwrap_or_default();
                    let err = ChainError::ErrorReadingCapture(name, number, path, e);
                    match result {
                        Ok(()) => result = Err(err),
                        Err(_) => tracing::warn!("Additional failure: {}", err),
                    }
                }
            }
        }
        result
    }
}


// ----------------------------------------------------------------------
// TESTS
// ----------------------------------------------------------------------
