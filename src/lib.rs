//! This package provides functionality for running a chain of executables as
//! sub-processes, where the output of each command is connected to the input of
//! the next command by a pipe (similar to a shell pipeline: `cmd1 | cmd2`).
//!
//! The chain is built by adding commands in the order they appear in the
//! pipeline, and configuring each command just after it is added: the
//! configuration methods always apply to the most recently added command.
//!
//! ```
//! use cmdchain::*;
//! let mut chain = CommandChain::new();
//! chain.command("printf", ["one\\ntwo\\nthree\\n"])
//!      .pipe()
//!      .command("grep", ["t"])
//!      .pipe()
//!      .command("wc", ["-l"]);
//! assert_eq!(chain.programs(), vec!["printf", "grep", "wc"]);
//! ```
//!
//! > ------
//! >
//! > Each command must consume the output of the command before it: adding a
//! > second command without calling [CommandChain::pipe] on the first is an
//! > error, which is reported when the chain is started.
//! >
//! > ------
//!
//! Once built, the chain is started and then waited on.  Starting the chain
//! starts all of the commands; waiting on the chain waits for all of the
//! commands and reports the first command (in pipeline order) that failed.
//!
//! ```
//! # use cmdchain::*;
//! let out = SharedBuffer::new();
//! let mut chain = CommandChain::new();
//! chain.command("printf", ["one\\ntwo\\nthree\\n"])
//!      .pipe()
//!      .command("grep", ["t"])
//!      .set_output(Sink::Buffer(out.clone()));
//! let waiter = chain.start()?;
//! let result = waiter.wait()?;
//! assert_eq!(out.to_string_lossy(), "two\nthree\n");
//! assert_eq!(result.exit_codes(), vec![Some(0), Some(0)]);
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! The output and error output of each command can be sent to any [Sink]; any
//! command that is not explicitly configured uses the chain's default output
//! and error sinks (initially the stdout and stderr of the current process; see
//! [ChainConfig]).  The error output of a command can also be merged into its
//! output with [CommandChain::redirect_error_to_output], or captured for later
//! retrieval with a [CaptureHandle]:
//!
//! ```
//! # use cmdchain::*;
//! let errs = CaptureHandle::new();
//! let lines = CommandChain::new()
//!     .command("bash", ["-c", "echo result; echo warning >&2"])
//!     .capture_error(&errs)
//!     .run_and_get_lines()?;
//! assert_eq!(lines, vec!["result"]);
//! assert_eq!(errs.get_string(), "warning\n");
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! By default a command that exits with a non-zero status causes the chain to
//! fail.  Additional exit codes can be permitted for a command, and the actual
//! code can be observed:
//!
//! ```
//! # use cmdchain::*;
//! let status = ObservedStatus::new();
//! CommandChain::with_input_string("apple\nbanana\n")
//!     .command("grep", ["cherry"])
//!     .allow_exit_status(&[1], Some(&status))
//!     .run_and_wait()?;
//! assert_eq!(status.get(), Some(1));
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Errors that occur while running the chain are returned as an
//! [anyhow::Error] wrapping a [ChainError].  Incorrect use of the chain (for
//! example, setting the output of a command twice, or starting a chain that
//! has no commands) is a programming error and causes a panic.  Each of the
//! operations that returns an error also has a `must_` form that panics on
//! error instead.
//!
//! There are convenience operations that start a chain, collect or stream the
//! output of the last command, and wait for the chain:
//! [CommandChain::run_and_get_string], [CommandChain::run_and_get_lines],
//! [CommandChain::run_and_stream_lines], and others.

// Internal structure:
//
//  * A CommandChain is a shared handle to the ChainInternals, which hold the
//    Stage for each command plus the chain defaults.
//
//  * A Stage holds the stdio "wires" for its command.  Inter-stage pipes are
//    created as soon as pipe() is called; sinks that are not file descriptors
//    (buffers, writers) get a pipe plus a Drain thread that copies from the
//    pipe into the sink while the command runs.
//
//  * start() spawns each Stage through the OsRun executor, producing a
//    RunningStage.  wait() reaps each RunningStage, joins its threads, applies
//    its ExitPolicy, and fills the CaptureHandles from the chain's temp files.
//
// ```text
//   Building --start()--> Running --wait()--> Waiting --> Succeeded
//       |                    |                   |
//       +--------------------+-------------------+------> Failed
// ```

mod errors;
mod config;
mod execution;
mod stdio;
mod capture;
mod stage;
mod chain;

// Exports are setup here such that the user only needs to use the top level
// "cmdchain" module to access the public API.

pub use errors::{ChainError, UsageError};
pub use config::*;
#[doc(inline)]
pub use execution::*;
#[doc(inline)]
pub use stdio::{Sink, Source, SharedBuffer, SharedWriter};
pub use capture::*;
#[doc(inline)]
pub use chain::{CommandChain, ChainState, ChainWaiter, ChainResult, LineStream};
#[doc(inline)]
pub use chain::{NO_ARGS, open_for_read, open_for_write, must_open_for_read, must_open_for_write};
