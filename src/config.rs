use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::execution::{Executor, OsRun};
use crate::stdio::Sink;


/// Capacity of the buffered readers used when reading chain output by line.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;


/// The settings that a [crate::CommandChain] starts with.  There is no
/// process-wide configuration: each chain gets its own copy of these, either
/// the defaults via [crate::CommandChain::new] or an explicit set via
/// [crate::CommandChain::with_config].
///
/// ```
/// # use cmdchain::*;
/// let buf = SharedBuffer::new();
/// let config = ChainConfig::default()
///     .executor(Executor::NormalWithEcho)
///     .default_error(Sink::Buffer(buf.clone()))
///     .buffer_size(64 * 1024);
/// let chain = CommandChain::with_config(config);
/// ```
pub struct ChainConfig {
    /// Performs the OS interactions for the chain.
    pub executor: Arc<dyn OsRun>,

    /// Output sink for any command whose output is not otherwise directed.
    pub default_stdout: Sink,

    /// Error sink for any command whose error output is not otherwise
    /// directed.
    pub default_stderr: Sink,

    /// Where temporary files capturing error output are created; the system
    /// temporary directory if not set.
    pub temp_dir: Option<PathBuf>,

    /// Buffer size for buffered reading of the final command's output.
    pub buffer_size: usize,
}

impl Default for ChainConfig {
    fn default() -> Self
    {
        ChainConfig {
            executor: Arc::new(Executor::NormalRun),
            default_stdout: Sink::Stdout,
            default_stderr: Sink::Stderr,
            temp_dir: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("default_stdout", &self.default_stdout)
            .field("default_stderr", &self.default_stderr)
            .field("temp_dir", &self.temp_dir)
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}

impl ChainConfig {

    /// Uses the specified [OsRun] implementation to perform the chain's
    /// operations.
    pub fn executor<E>(self, executor: E) -> Self
    where E: OsRun + 'static
    {
        ChainConfig { executor: Arc::new(executor), ..self }
    }

    pub fn default_output(self, sink: Sink) -> Self
    {
        ChainConfig { default_stdout: sink, ..self }
    }

    pub fn default_error(self, sink: Sink) -> Self
    {
        ChainConfig { default_stderr: sink, ..self }
    }

    pub fn temp_dir<T>(self, dir: T) -> Self
    where T: Into<PathBuf>
    {
        ChainConfig { temp_dir: Some(dir.into()), ..self }
    }

    /// Sets the buffered reader capacity; a zero size is raised to 1.
    pub fn buffer_size(self, size: usize) -> Self
    {
        ChainConfig { buffer_size: size.max(1), ..self }
    }
}


// ----------------------------------------------------------------------
// TESTS
// ----------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ChainConfig::default();
        assert!(matches!(cfg.default_stdout, Sink::Stdout));
        assert!(matches!(cfg.default_stderr, Sink::Stderr));
        assert_eq!(cfg.temp_dir, None);
        assert_eq!(cfg.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_builder_setters() {
        let cfg = ChainConfig::default()
            .executor(Executor::NormalWithLabel)
            .default_output(Sink::Null)
            .default_error(Sink::Stdout)
            .temp_dir("/var/tmp")
            .buffer_size(0);
        assert!(matches!(cfg.default_stdout, Sink::Null));
        assert!(matches!(cfg.default_stderr, Sink::Stdout));
        assert_eq!(cfg.temp_dir, Some(PathBuf::from("/var/tmp")));
        assert_eq!(cfg.buffer_size, 1);
        let shown = format!("{:?}", cfg);
        assert!(shown.starts_with("ChainConfig { default_stdout: Null"), "{}", shown);
    }
}
