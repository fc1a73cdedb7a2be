use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};

use crate::capture::{CaptureHandle, ObservedStatus};
use crate::errors::*;
use crate::execution::OsRun;
use crate::stdio::*;


/// Determines which exit statuses of a command are considered successful.
#[derive(Clone,Debug)]
pub(crate) enum ExitPolicy {
    /// Only a zero exit status is successful.
    Success,
    /// Zero or any of the listed codes is successful.
    Allow { codes: Vec<i32>, observed: Option<ObservedStatus> },
    /// Any exit code is successful, but the command must have exited normally.
    AllowAny { observed: Option<ObservedStatus> },
}

impl ExitPolicy {

    /// Checks the exit status of a command against this policy, recording the
    /// exit code for any observer.  On failure, returns the exit code to report
    /// (`-1` if the command did not exit normally).
    pub(crate) fn check(&self, status: &ExitStatus) -> Result<(), i32>
    {
        let code = match status.code() {
            Some(code) => code,
            None => return Err(-1),
        };
        match self {
            ExitPolicy::Success => {}
            ExitPolicy::Allow { observed, .. } |
            ExitPolicy::AllowAny { observed } =>
                if let Some(o) = observed {
                    o.set(code);
                }
        }
        match self {
            ExitPolicy::Success =>
                if code == 0 { Ok(()) } else { Err(code) },
            ExitPolicy::Allow { codes, .. } =>
                if code == 0 || codes.contains(&code) { Ok(()) } else { Err(code) },
            ExitPolicy::AllowAny { .. } => Ok(()),
        }
    }
}


/// One command in a chain along with the configuration of its stdio handles.
/// The stdio handles are taken from the stage when it is started.
#[derive(Debug)]
pub(crate) struct Stage {
    index: usize,
    pub(crate) program: OsString,
    pub(crate) args: Vec<OsString>,
    pub(crate) env: Option<Vec<(OsString, OsString)>>,
    pub(crate) dir: Option<PathBuf>,
    pub(crate) stdin: Option<InWire>,
    pub(crate) stdout: Option<OutWire>,
    pub(crate) stderr: Option<OutWire>,
    pub(crate) drains: Vec<Drain>,
    pub(crate) policy: Option<ExitPolicy>,
    pub(crate) err_to_out: bool,

    // The index of the chain temp file receiving stderr, and the handle to
    // deliver its contents to.
    pub(crate) capture: Option<(usize, CaptureHandle)>,

    finalized: bool,
}

impl Stage {

    pub(crate) fn new<I, A>(index: usize, program: &OsStr, args: I) -> Stage
    where I: IntoIterator<Item = A>, A: AsRef<OsStr>
    {
        Stage {
            index,
            program: program.to_os_string(),
            args: args.into_iter().map(|a| a.as_ref().to_os_string()).collect(),
            env: None,
            dir: None,
            stdin: None,
            stdout: None,
            stderr: None,
            drains: Vec::new(),
            policy: None,
            err_to_out: false,
            capture: None,
            finalized: false,
        }
    }

    /// The program name, for messages.
    pub(crate) fn name(&self) -> String
    {
        self.program.to_string_lossy().into_owned()
    }

    /// 1-based position of this stage in the chain.
    pub(crate) fn number(&self) -> usize
    {
        self.index + 1
    }

    pub(crate) fn describe(&self) -> String
    {
        format!("{:?} (command #{})", self.name(), self.number())
    }

    pub(crate) fn set_policy(&mut self, policy: ExitPolicy)
    {
        if self.policy.is_some() {
            usage_error(UsageError::AlreadySet("Exit status validator", self.describe()));
        }
        self.policy = Some(policy);
    }

    /// Resolves the remaining configuration of this stage: the error-to-output
    /// redirection, the default output and error sinks, and the default exit
    /// status policy.  This is performed once, either when the next command is
    /// added to the chain or when the chain is started.
    pub(crate) fn finalize(&mut self,
                           default_stdout: &Sink,
                           default_stderr: &Sink,
                           os: &dyn OsRun) -> Result<(), ChainError>
    {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        if self.policy.is_none() {
            self.policy = Some(ExitPolicy::Success);
        }
        if self.err_to_out && self.stderr.is_some() {
            usage_error(UsageError::AlreadySet("Stderr", self.describe()));
        }
        if self.stdout.is_none() {
            let (wire, drain) = default_stdout.try_clone()
                .and_then(|sink| sink.into_wire(os))
                .map_err(|e| ChainError::ErrorDuplicatingSink(self.describe(),
                                                              "the default output", e))?;
            self.stdout = Some(wire);
            self.drains.extend(drain);
        }
        if self.err_to_out {
            if let Some(out) = &self.stdout {
                let wire = out.try_clone()
                    .map_err(|e| ChainError::ErrorDuplicatingSink(self.describe(),
                                                                  "the output", e))?;
                self.stderr = Some(wire);
            }
        }
        if self.stderr.is_none() {
            let (wire, drain) = default_stderr.try_clone()
                .and_then(|sink| sink.into_wire(os))
                .map_err(|e| ChainError::ErrorDuplicatingSink(self.describe(),
                                                              "the default error output", e))?;
            self.stderr = Some(wire);
            self.drains.extend(drain);
        }
        Ok(())
    }

    /// Builds the Command to run for this stage, moving the stdio wiring into
    /// it.  Also returns the input that must be fed to the command's stdin
    /// once it is running (if any).
    pub(crate) fn prepare(&mut self) -> (Command, Option<Box<dyn Read + Send>>)
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(env) = &self.env {
            cmd.env_clear();
            cmd.envs(env.iter().map(|(k, v)| (k, v)));
        }
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        let (stdin, feed) = self.stdin.take().unwrap_or(InWire::Stdin).into_stdio();
        cmd.stdin(stdin);
        cmd.stdout(self.stdout.take().map_or_else(Stdio::inherit, OutWire::into_stdio));
        cmd.stderr(self.stderr.take().map_or_else(Stdio::inherit, OutWire::into_stdio));
        (cmd, feed)
    }

    /// Drops all of the stdio wiring of a stage that will never be started,
    /// closing the pipe ends it holds.
    pub(crate) fn release(&mut self)
    {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        self.drains.clear();
    }
}


// ----------------------------------------------------------------------
// TESTS
// ----------------------------------------------------------------------
