//! This is the lowest level module that supports the cmdchain library.  This
//! module is responsible for the actual interactions with the OS that the rest
//! of the library determines are needed: creating pipes and temporary files and
//! spawning the sub-process for each command in a chain.
//!
//! This module helps with separation of concerns between the management and
//! determination of what should be done and in what sequence versus the actual
//! performance of those things.  It isolates and minimizes the interactions
//! with the OS, which helps with tracing/logging or test harnesses that wish to
//! observe those interactions.

use anyhow;
use std::io;
use std::io::{PipeReader, PipeWriter};
use std::path::Path;
use std::process::{Child, Command};
use tempfile;


/// The OsRun trait is used to define the interface to the implementation that
/// performs the OS operations needed by a chain.  The default implementation of
/// this trait is the [Executor] which performs the specified actions on the
/// current system.
///
/// An OsRun implementation is shared by reference (and across threads) by the
/// chains configured to use it, so it is expected to be immutable; if it needs
/// to maintain internal state it should use internal locking for those mutable
/// portions.
pub trait OsRun: Send + Sync {

    /// Spawns the prepared command for one stage of a chain.  The label is a
    /// short user-presentable identification of the stage.  The stdio handles
    /// of the command have already been configured.
    fn spawn_stage(&self, label: &str, cmd: &mut Command) -> io::Result<Child>;

    /// Creates an anonymous pipe, returning the read and write ends.
    fn mk_pipe(&self) -> io::Result<(PipeReader, PipeWriter)>;

    /// Creates a temporary file (in the specified directory, or the system
    /// temporary directory if none is specified).  Note that the return value is
    /// provided by the tempfile crate and is a resource managing object: the
    /// file is removed when it is closed or dropped.
    fn mk_tempfile(&self, dir: Option<&Path>, prefix: &str, suffix: &str)
                   -> anyhow::Result<tempfile::NamedTempFile>;
}


/// This is the default Executor defined by the cmdchain crate.  This Executor
/// provides three modes of operation, controlling echoing of the commands
/// to stderr as they are started.
///
/// It is also possible to use user-defined executors that implement the
/// [OsRun] trait.
#[derive(Clone,Copy,Debug,Default,PartialEq)]
pub enum Executor {
    /// Starts the commands without displaying them.
    #[default]
    NormalRun,
    /// Prints each command and its arguments to stderr just before starting it.
    NormalWithEcho,
    /// Prints the label of each command to stderr just before starting it.
    NormalWithLabel,
}

impl Executor {
    /// Renders the command line in the form echoed by
    /// [Executor::NormalWithEcho].
    pub fn describe(cmd: &Command) -> String
    {
        let mut line = cmd.get_program().to_string_lossy().into_owned();
        for arg in cmd.get_args() {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        if let Some(dir) = cmd.get_current_dir() {
            line.push_str(&format!(" [in {}]", dir.display()));
        }
        line
    }
}


impl OsRun for Executor {

    fn spawn_stage(&self, label: &str, cmd: &mut Command) -> io::Result<Child>
    {
        match &self {
            Executor::NormalRun => {}
            Executor::NormalWithLabel => eprintln!("#=> {}", label),
            Executor::NormalWithEcho => eprintln!("#: {}", Executor::describe(cmd)),
        }
        tracing::debug!(stage = %label, "spawning {}", Executor::describe(cmd));
        cmd.spawn()
    }

    fn mk_pipe(&self) -> io::Result<(PipeReader, PipeWriter)>
    {
        io::pipe()
    }

    fn mk_tempfile(&self, dir: Option<&Path>, prefix: &str, suffix: &str)
                   -> anyhow::Result<tempfile::NamedTempFile>
    {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix).suffix(suffix);
        let tf = match dir {
            Some(d) => builder.tempfile_in(d)?,
            None => builder.tempfile()?,
        };
        if let Executor::NormalWithLabel = self {
            eprintln!("Created temp file {:?}", tf.path());
        }
        Ok(tf)
    }
}


// ----------------------------------------------------------------------
// TESTS
// ----------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_describe() {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg("echo hi");
        assert_eq!(Executor::describe(&cmd), "bash -c echo hi");
        cmd.current_dir("/tmp");
        assert_eq!(Executor::describe(&cmd), "bash -c echo hi [in /tmp]");
    }

    #[test]
    fn test_pipe_roundtrip() {
        let (mut rd, mut wr) = Executor::NormalRun.mk_pipe().unwrap();
        wr.write_all(b"through the pipe").unwrap();
        drop(wr);
        let mut got = String::new();
        rd.read_to_string(&mut got).unwrap();
        assert_eq!(got, "through the pipe");
    }

    #[test]
    fn test_tempfile_in_dir_removed_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let tf = Executor::NormalRun
            .mk_tempfile(Some(dir.path()), "stderr", ".dat")
            .unwrap();
        let path = tf.path().to_path_buf();
        assert!(path.starts_with(dir.path()));
        let fname = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(fname.starts_with("stderr") && fname.ends_with(".dat"), "{}", fname);
        assert!(path.exists());
        tf.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_spawn_stage() {
        let mut cmd = Command::new("true");
        let mut child = Executor::NormalWithLabel.spawn_stage("\"true\" (command #1)", &mut cmd)
            .unwrap();
        assert!(child.wait().unwrap().success());
    }
}
