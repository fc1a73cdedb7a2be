use std::ffi::OsStr;
use std::io::PipeReader;
use std::path::Path;

use crate::capture::{CaptureHandle, ObservedStatus};
use crate::chain::{ChainInternals, CommandChain};
use crate::config::ChainConfig;
use crate::errors::*;
use crate::stage::{ExitPolicy, Stage};
use crate::stdio::*;


/// An empty argument list, for commands that take no arguments.
pub const NO_ARGS: [&str; 0] = [];


impl Default for CommandChain {
    fn default() -> Self
    {
        CommandChain::new()
    }
}

impl CommandChain {

    /// Creates a new, empty chain using the default [ChainConfig].  The first
    /// command added to the chain reads from the stdin of the current process.
    pub fn new() -> CommandChain
    {
        CommandChain::with_config(ChainConfig::default())
    }

    pub fn with_config(config: ChainConfig) -> CommandChain
    {
        CommandChain::from_config(config, None)
    }

    /// Creates a new chain whose first command reads from the specified input.
    pub fn with_input(source: Source) -> CommandChain
    {
        CommandChain::from_config(ChainConfig::default(), Some(source.into()))
    }

    /// Creates a new chain whose first command reads the specified file.  If
    /// the file cannot be opened, the error is reported when the chain is
    /// started.
    pub fn with_input_file<P>(path: P) -> CommandChain
    where P: AsRef<Path>
    {
        match open_for_read(&path) {
            Ok(f) => CommandChain::with_input(Source::File(f)),
            Err(e) => {
                let chain = CommandChain::with_input(Source::Null);
                chain.lock().defer(e);
                chain
            }
        }
    }

    pub fn with_input_string<S>(text: S) -> CommandChain
    where S: Into<String>
    {
        CommandChain::with_input_bytes(text.into().into_bytes())
    }

    pub fn with_input_bytes<B>(data: B) -> CommandChain
    where B: Into<Vec<u8>>
    {
        CommandChain::with_input(Source::Bytes(data.into()))
    }

    /// Sets the input that the first command will read.  This is an
    /// alternative to the `with_input...` constructors for a chain created by
    /// [CommandChain::with_config].
    pub fn set_input(&mut self, source: Source) -> &mut Self
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            if !ch.stages.is_empty() || ch.pending_stdin.is_some() {
                usage_error(UsageError::AlreadySet("Input", "the chain".into()));
            }
            ch.pending_stdin = Some(source.into());
        }
        self
    }

    /// Adds a new command to the end of the chain.  Any previous command in the
    /// chain must have been connected to this one by [CommandChain::pipe];
    /// otherwise an error is reported when the chain is started.
    pub fn command<P, I, A>(&mut self, program: P, args: I) -> &mut Self
    where P: AsRef<OsStr>,
          I: IntoIterator<Item = A>,
          A: AsRef<OsStr>
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            ch.add_stage(program.as_ref(), args);
        }
        self
    }

    /// Adds a new command to the end of the chain (like
    /// [CommandChain::command]) that runs with exactly the specified environment
    /// variables: the environment of the current process is not inherited.
    pub fn command_with_env<E, K, V, P, I, A>(&mut self, env: E, program: P, args: I)
                                              -> &mut Self
    where E: IntoIterator<Item = (K, V)>,
          K: AsRef<OsStr>,
          V: AsRef<OsStr>,
          P: AsRef<OsStr>,
          I: IntoIterator<Item = A>,
          A: AsRef<OsStr>
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            ch.add_stage(program.as_ref(), args);
            ch.current_stage().env = Some(
                env.into_iter()
                    .map(|(k, v)| (k.as_ref().to_os_string(), v.as_ref().to_os_string()))
                    .collect());
        }
        self
    }

    /// Adds an argument to the most recently added command.
    pub fn push_arg<A>(&mut self, arg: A) -> &mut Self
    where A: AsRef<OsStr>
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            ch.current_stage().args.push(arg.as_ref().to_os_string());
        }
        self
    }

    /// Sets the directory in which the most recently added command runs.
    pub fn set_dir<T>(&mut self, dir: T) -> &mut Self
    where T: AsRef<Path>
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            ch.current_stage().dir = Some(dir.as_ref().to_path_buf());
        }
        self
    }

    /// Allows the most recently added command to exit with any of the specified
    /// status codes (in addition to 0) without failing the chain.  If an
    /// [ObservedStatus] is provided, it receives the actual exit code.
    ///
    /// Panics if no allowed codes are specified, or if the exit status
    /// handling for the command has already been specified.
    pub fn allow_exit_status(&mut self, allowed: &[i32], observed: Option<&ObservedStatus>)
                             -> &mut Self
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            if allowed.is_empty() {
                usage_error(UsageError::NoAllowedStatus);
            }
            ch.current_stage().set_policy(ExitPolicy::Allow {
                codes: allowed.to_vec(),
                observed: observed.cloned(),
            });
        }
        self
    }

    /// Allows the most recently added command to exit with any status code.
    /// The command must still exit normally: a command killed by a signal fails
    /// the chain.
    pub fn allow_any_exit_status(&mut self, observed: Option<&ObservedStatus>) -> &mut Self
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            ch.current_stage().set_policy(ExitPolicy::AllowAny {
                observed: observed.cloned(),
            });
        }
        self
    }

    /// Sends the error output of the most recently added command to the same
    /// place as its output, wherever that is eventually directed.
    pub fn redirect_error_to_output(&mut self) -> &mut Self
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            let stage = ch.current_stage();
            if stage.err_to_out {
                usage_error(UsageError::AlreadySet("Error-to-output redirection",
                                                   stage.describe()));
            }
            stage.err_to_out = true;
        }
        self
    }

    /// Directs the output of the most recently added command to the sink.
    /// Panics if the output of that command has already been directed.
    pub fn set_output(&mut self, sink: Sink) -> &mut Self
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            ch.set_stage_output(sink);
        }
        self
    }

    /// Directs the error output of the most recently added command to the sink.
    /// Panics if the error output of that command has already been directed.
    pub fn set_error(&mut self, sink: Sink) -> &mut Self
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            ch.set_stage_error(sink);
        }
        self
    }

    /// Writes the output of the most recently added command to the file
    /// (created or truncated).  If the file cannot be opened, the error is
    /// reported when the chain is started.
    pub fn set_output_file<P>(&mut self, path: P) -> &mut Self
    where P: AsRef<Path>
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            match open_for_write(&path) {
                Ok(f) => ch.set_stage_output(Sink::File(f)),
                Err(e) => ch.defer(e),
            }
        }
        self
    }

    /// Writes the error output of the most recently added command to the file
    /// (created or truncated).  If the file cannot be opened, the error is
    /// reported when the chain is started.
    pub fn set_error_file<P>(&mut self, path: P) -> &mut Self
    where P: AsRef<Path>
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            match open_for_write(&path) {
                Ok(f) => ch.set_stage_error(Sink::File(f)),
                Err(e) => ch.defer(e),
            }
        }
        self
    }

    /// Sets the output sink for the commands of this chain (including the most
    /// recently added one) whose output is not otherwise directed.
    pub fn set_default_output(&mut self, sink: Sink) -> &mut Self
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            ch.default_stdout = sink;
        }
        self
    }

    /// Sets the error sink for the commands of this chain (including the most
    /// recently added one) whose error output is not otherwise directed.
    pub fn set_default_error(&mut self, sink: Sink) -> &mut Self
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            ch.default_stderr = sink;
        }
        self
    }

    /// Connects the output of the most recently added command to a new pipe and
    /// returns the read end of that pipe.  Returns None if the pipe could not
    /// be created; the error is reported when the chain is started.
    pub fn capture_pipe_output(&mut self) -> Option<PipeReader>
    {
        let mut ch = self.lock();
        ch.ensure_building();
        ch.capture_output_pipe()
    }

    /// Saves the error output of the most recently added command to a temporary
    /// file owned by the chain.  When the chain has been successfully waited
    /// on, the handle receives the entire contents of that error output.
    pub fn capture_error(&mut self, handle: &CaptureHandle) -> &mut Self
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            ch.capture_stage_error(handle);
        }
        self
    }

    /// Connects the output of the most recently added command to the input of
    /// the next command added to the chain.
    pub fn pipe(&mut self) -> &mut Self
    {
        {
            let mut ch = self.lock();
            ch.ensure_building();
            if ch.pending_stdin.is_some() {
                let desc = ch.current_stage().describe();
                usage_error(UsageError::AlreadySet("Pipe", desc));
            }
            if let Some(rd) = ch.capture_output_pipe() {
                ch.pending_stdin = Some(InWire::Pipe(rd));
            }
        }
        self
    }
}


impl ChainInternals {

    fn add_stage<I, A>(&mut self, program: &OsStr, args: I)
    where I: IntoIterator<Item = A>, A: AsRef<OsStr>
    {
        tracing::debug!("Command: {}", program.to_string_lossy());
        self.finalize_current();
        let index = self.stages.len();
        let mut stage = Stage::new(index, program, args);
        match self.pending_stdin.take() {
            Some(inp) => stage.stdin = Some(inp),
            None if index == 0 => stage.stdin = Some(InWire::Stdin),
            None => self.defer(anyhow::Error::new(ChainError::ErrorMissingPipe(stage.name()))),
        }
        self.stages.push(stage);
        self.current = Some(index);
    }

    fn set_stage_output(&mut self, sink: Sink)
    {
        let os = self.os.clone();
        let stage = self.current_stage();
        if stage.stdout.is_some() {
            usage_error(UsageError::AlreadySet("Stdout", stage.describe()));
        }
        match sink.into_wire(&*os) {
            Ok((wire, drain)) => {
                stage.stdout = Some(wire);
                stage.drains.extend(drain);
            }
            Err(e) => {
                let err = ChainError::ErrorCreatingPipe(stage.describe(), e);
                self.defer(anyhow::Error::new(err));
            }
        }
    }

    fn set_stage_error(&mut self, sink: Sink)
    {
        let os = self.os.clone();
        let stage = self.current_stage();
        if stage.stderr.is_some() {
            usage_error(UsageError::AlreadySet("Stderr", stage.describe()));
        }
        match sink.into_wire(&*os) {
            Ok((wire, drain)) => {
                stage.stderr = Some(wire);
                stage.drains.extend(drain);
            }
            Err(e) => {
                let err = ChainError::ErrorCreatingPipe(stage.describe(), e);
                self.defer(anyhow::Error::new(err));
            }
        }
    }

    pub(crate) fn capture_output_pipe(&mut self) -> Option<PipeReader>
    {
        let os = self.os.clone();
        let stage = self.current_stage();
        if stage.stdout.is_some() {
            usage_error(UsageError::AlreadySet("Stdout", stage.describe()));
        }
        match os.mk_pipe() {
            Ok((rd, wr)) => {
                stage.stdout = Some(OutWire::Pipe(wr));
                Some(rd)
            }
            Err(e) => {
                let err = ChainError::ErrorCreatingPipe(stage.describe(), e);
                self.defer(anyhow::Error::new(err));
                None
            }
        }
    }

    fn capture_stage_error(&mut self, handle: &CaptureHandle)
    {
        let os = self.os.clone();
        let temp_dir = self.temp_dir.clone();
        let slot = self.temp_files.len();
        let stage = self.current_stage();
        if stage.stderr.is_some() {
            usage_error(UsageError::AlreadySet("Stderr", stage.describe()));
        }
        let desc = stage.describe();
        let tf = match os.mk_tempfile(temp_dir.as_deref(), "stderr", ".dat") {
            Ok(tf) => tf,
            Err(e) => {
                self.defer(anyhow::Error::new(ChainError::ErrorCreatingTempFile(desc, e)));
                return;
            }
        };
        let dup = tf.as_file().try_clone();
        match dup {
            Ok(f) => {
                stage.stderr = Some(OutWire::File(f));
                stage.capture = Some((slot, handle.clone()));
                self.temp_files.push(tf);
            }
            Err(e) => {
                let err = ChainError::ErrorDuplicatingSink(desc, "the capture file", e);
                self.defer(anyhow::Error::new(err));
            }
        }
    }
}


/// Opens a file for reading.
pub fn open_for_read<P>(path: P) -> anyhow::Result<std::fs::File>
where P: AsRef<Path>
{
    std::fs::File::open(path.as_ref())
        .map_err(|e| anyhow::Error::new(
            ChainError::ErrorOpeningFile("reading", path.as_ref().to_path_buf(), e)))
}

/// Opens (creating or truncating) a file for writing.
pub fn open_for_write<P>(path: P) -> anyhow::Result<std::fs::File>
where P: AsRef<Path>
{
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path.as_ref())
        .map_err(|e| anyhow::Error::new(
            ChainError::ErrorOpeningFile("writing", path.as_ref().to_path_buf(), e)))
}

/// Opens a file for reading, panicking if it cannot be opened.
#[track_caller]
pub fn must_open_for_read<P>(path: P) -> std::fs::File
where P: AsRef<Path>
{
    must(open_for_read(path))
}

/// Opens (creating or truncating) a file for writing, panicking if it cannot
/// be opened.
#[track_caller]
pub fn must_open_for_write<P>(path: P) -> std::fs::File
where P: AsRef<Path>
{
    must(open_for_write(path))
}


// ----------------------------------------------------------------------
// TESTS
// ----------------------------------------------------------------------
