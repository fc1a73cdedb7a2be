use std::fmt;
use std::io::{BufRead, BufReader, PipeReader, Read};
use std::ops::ControlFlow;

use crate::chain::{ChainResult, ChainWaiter, CommandChain};
use crate::errors::*;


impl CommandChain {

    /// Starts the chain and waits for it to complete.
    pub fn run_and_wait(&mut self) -> anyhow::Result<ChainResult>
    {
        self.start()?.wait()
    }

    /// Starts the chain with the output of the last command sent to a pipe,
    /// returning the read end of the pipe and the waiter for the chain.  The
    /// caller should read the output before waiting, otherwise the last command
    /// may block on a full pipe.
    pub fn run_and_get_reader(&mut self) -> anyhow::Result<(PipeReader, ChainWaiter)>
    {
        let reader = {
            let mut ch = self.lock();
            ch.ensure_building();
            ch.capture_output_pipe()
        };
        let waiter = self.start()?;
        // A pipe that could not be created was reported by start().
        reader.map(|rd| (rd, waiter))
            .ok_or_else(|| anyhow::anyhow!("No output pipe for the command chain"))
    }

    /// Like [CommandChain::run_and_get_reader], but the output is wrapped in a
    /// [BufReader] using the chain's configured buffer size.
    pub fn run_and_get_buffered_reader(&mut self)
                                       -> anyhow::Result<(BufReader<PipeReader>, ChainWaiter)>
    {
        let capacity = self.lock().buffer_size;
        let (rd, waiter) = self.run_and_get_reader()?;
        Ok((BufReader::with_capacity(capacity, rd), waiter))
    }

    /// Runs the chain to completion and returns everything the last command
    /// wrote to its output.
    pub fn run_and_get_bytes(&mut self) -> anyhow::Result<Vec<u8>>
    {
        let (mut rd, waiter) = self.run_and_get_reader()?;
        let mut data = Vec::new();
        let read = rd.read_to_end(&mut data);
        drop(rd);
        waiter.wait()?;
        read.map_err(|e| anyhow::Error::new(ChainError::ErrorReadingOutput(e)))?;
        Ok(data)
    }

    /// Runs the chain to completion and returns the output of the last command
    /// as a String.  Invalid UTF-8 is replaced rather than reported.
    pub fn run_and_get_string(&mut self) -> anyhow::Result<String>
    {
        let data = self.run_and_get_bytes()?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Runs the chain to completion and returns the output of the last command
    /// split into lines (without the line terminators).
    pub fn run_and_get_lines(&mut self) -> anyhow::Result<Vec<String>>
    {
        let data = self.run_and_get_bytes()?;
        Ok(split_lines(&data))
    }

    /// Starts the chain and returns a [LineStream] over the output of the
    /// last command.
    pub fn run_and_stream(&mut self) -> anyhow::Result<LineStream>
    {
        let (rd, waiter) = self.run_and_get_buffered_reader()?;
        Ok(LineStream { reader: Some(rd), waiter: Some(waiter) })
    }

    /// Runs the chain, passing each line of output of the last command (without
    /// the line terminator) to the callback.  If the callback breaks, the
    /// output is closed as by [LineStream::close].  The chain is waited on in
    /// either case.
    pub fn run_and_stream_lines<F>(&mut self, mut on_line: F) -> anyhow::Result<ChainResult>
    where F: FnMut(&str) -> ControlFlow<()>
    {
        self.run_and_stream_bytes(|line| on_line(&String::from_utf8_lossy(line)))
    }

    /// Like [CommandChain::run_and_stream_lines] for lines that are not
    /// necessarily valid UTF-8.
    pub fn run_and_stream_bytes<F>(&mut self, mut on_line: F) -> anyhow::Result<ChainResult>
    where F: FnMut(&[u8]) -> ControlFlow<()>
    {
        let mut stream = self.run_and_stream()?;
        let mut read_err = None;
        while let Some(line) = stream.next_line_bytes() {
            match line {
                Ok(line) =>
                    if on_line(&line).is_break() {
                        break;
                    },
                Err(e) => {
                    read_err = Some(e);
                    break;
                }
            }
        }
        let result = stream.close()?;
        match read_err {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    #[track_caller]
    pub fn must_run_and_wait(&mut self) -> ChainResult
    {
        must(self.run_and_wait())
    }

    #[track_caller]
    pub fn must_run_and_get_reader(&mut self) -> (PipeReader, ChainWaiter)
    {
        must(self.run_and_get_reader())
    }

    #[track_caller]
    pub fn must_run_and_get_buffered_reader(&mut self) -> (BufReader<PipeReader>, ChainWaiter)
    {
        must(self.run_and_get_buffered_reader())
    }

    #[track_caller]
    pub fn must_run_and_get_bytes(&mut self) -> Vec<u8>
    {
        must(self.run_and_get_bytes())
    }

    #[track_caller]
    pub fn must_run_and_get_string(&mut self) -> String
    {
        must(self.run_and_get_string())
    }

    #[track_caller]
    pub fn must_run_and_get_lines(&mut self) -> Vec<String>
    {
        must(self.run_and_get_lines())
    }

    #[track_caller]
    pub fn must_run_and_stream(&mut self) -> LineStream
    {
        must(self.run_and_stream())
    }

    #[track_caller]
    pub fn must_run_and_stream_lines<F>(&mut self, on_line: F) -> ChainResult
    where F: FnMut(&str) -> ControlFlow<()>
    {
        must(self.run_and_stream_lines(on_line))
    }

    #[track_caller]
    pub fn must_run_and_stream_bytes<F>(&mut self, on_line: F) -> ChainResult
    where F: FnMut(&[u8]) -> ControlFlow<()>
    {
        must(self.run_and_stream_bytes(on_line))
    }
}


/// Splits command output into lines.  A single trailing newline does not
/// start another line, and no output at all has no lines.
fn split_lines(data: &[u8]) -> Vec<String>
{
    if data.is_empty() {
        return Vec::new();
    }
    let data = data.strip_suffix(b"\n").unwrap_or(data);
    data.split(|b| *b == b'\n')
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect()
}


// ----------------------------------------------------------------------
/// A cursor over the lines of output of a running chain.
///
/// Lines are read one at a time with [LineStream::next_line_bytes] or by
/// iterating.  The chain is waited on by [LineStream::close].  Closing before
/// the end of the output closes the pipe, so a command that would write
/// forever is stopped rather than waited on indefinitely.  A LineStream that is
/// dropped without being closed is closed at that point, and a failure of the
/// chain is then only logged.
///
/// ```
/// # use cmdchain::*;
/// let mut stream = CommandChain::new()
///     .command("seq", ["1", "100"])
///     .run_and_stream()?;
/// let first: Vec<String> = stream.by_ref().take(2).collect::<anyhow::Result<_>>()?;
/// assert_eq!(first, vec!["1", "2"]);
/// stream.close()?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct LineStream {
    reader: Option<BufReader<PipeReader>>,
    waiter: Option<ChainWaiter>,
}

impl fmt::Debug for LineStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LineStream")
            .field("reading", &self.reader.is_some())
            .field("waiter", &self.waiter)
            .finish()
    }
}

impl LineStream {

    /// Returns the next line of output without its trailing newline, or None
    /// at the end of the output.  A read error ends the stream.
    pub fn next_line_bytes(&mut self) -> Option<anyhow::Result<Vec<u8>>>
    {
        let rd = self.reader.as_mut()?;
        let mut line = Vec::new();
        match rd.read_until(b'\n', &mut line) {
            Ok(0) => {
                self.reader = None;
                None
            }
            Ok(_) => {
                if line.last() == Some(&b'\n') {
                    line.pop();
                }
                Some(Ok(line))
            }
            Err(e) => {
                self.reader = None;
                Some(Err(anyhow::Error::new(ChainError::ErrorReadingOutput(e))))
            }
        }
    }

    /// Closes the output of the chain and waits for it to complete.  If the
    /// output was not read to the end, the commands still writing to it are
    /// stopped by SIGPIPE, which is not treated as a failure.
    pub fn close(mut self) -> anyhow::Result<ChainResult>
    {
        match self.waiter.take() {
            Some(waiter) => finish_stream(self.reader.take(), waiter),
            None => unreachable!("LineStream waiter is only taken by close or drop"),
        }
    }

    #[track_caller]
    pub fn must_close(self) -> ChainResult
    {
        must(self.close())
    }
}

/// Waits for the chain of a [LineStream].  The reader is still present if the
/// output was abandoned before its end.
fn finish_stream(reader: Option<BufReader<PipeReader>>, waiter: ChainWaiter)
                 -> anyhow::Result<ChainResult>
{
    match reader {
        Some(rd) => {
            drop(rd);
            waiter.wait_after_close()
        }
        None => waiter.wait(),
    }
}

impl Iterator for LineStream {
    type Item = anyhow::Result<String>;

    fn next(&mut self) -> Option<Self::Item>
    {
        self.next_line_bytes()
            .map(|r| r.map(|line| String::from_utf8_lossy(&line).into_owned()))
    }
}

impl Drop for LineStream {
    fn drop(&mut self)
    {
        if let Some(waiter) = self.waiter.take() {
            if let Err(e) = finish_stream(self.reader.take(), waiter) {
                tracing::warn!("Command chain abandoned by its LineStream failed: {:#}", e);
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
    use proptest::prelude::*;

    #[test]
    fn test_split_lines() {
        assert_eq!(split_lines(b""), Vec::<String>::new());
        assert_eq!(split_lines(b"\n"), vec![""]);
        assert_eq!(split_lines(b"a\nb\n"), vec!["a", "b"]);
        assert_eq!(split_lines(b"a\nb"), vec!["a", "b"]);
        assert_eq!(split_lines(b"a\n\n"), vec!["a", ""]);
    }

    proptest! {
        #[test]
        fn test_split_terminated_lines(lines in proptest::collection::vec("[^\n]*", 1..8)) {
            let mut data = lines.join("\n");
            data.push('\n');
            prop_assert_eq!(split_lines(data.as_bytes()), lines);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn test_cat_preserves_bytes(data in proptest::collection::vec(any::<u8>(), 0..20000)) {
            let out = CommandChain::with_input_bytes(data.clone())
                .command("cat", NO_ARGS)
                .run_and_get_bytes()
                .unwrap();
            prop_assert_eq!(out, data);
        }
    }

    #[test]
    fn test_get_string() {
        let out = CommandChain::new()
            .command("printf", ["b\\na\\nc\\n"])
            .pipe()
            .command("sort", NO_ARGS)
            .must_run_and_get_string();
        assert_eq!(out, "a\nb\nc\n");
    }

    #[test]
    fn test_get_lines() {
        let lines = CommandChain::with_input_string("one\ntwo\nthree\n")
            .command("cat", NO_ARGS)
            .pipe()
            .command("tail", ["-n", "2"])
            .must_run_and_get_lines();
        assert_eq!(lines, vec!["two", "three"]);
    }

    #[test]
    fn test_get_lines_no_output() {
        let lines = CommandChain::new()
            .command("true", NO_ARGS)
            .must_run_and_get_lines();
        assert!(lines.is_empty());
    }

    #[test]
    fn test_merged_lines_keep_order() {
        let lines = CommandChain::new()
            .command("bash", ["-c", "echo out; echo err >&2"])
            .redirect_error_to_output()
            .must_run_and_get_lines();
        assert_eq!(lines, vec!["out", "err"]);
    }

    #[test]
    fn test_merged_lines_from_concurrent_writers() {
        let mut lines = CommandChain::new()
            .command("bash", ["-c", "(echo a; echo b) & (echo c >&2; echo d >&2); wait"])
            .redirect_error_to_output()
            .must_run_and_get_lines();
        lines.sort();
        assert_eq!(lines, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_get_bytes_reports_failure() {
        let err = CommandChain::new()
            .command("bash", ["-c", "echo partial; exit 7"])
            .run_and_get_bytes()
            .unwrap_err();
        assert_eq!(err.downcast_ref::<ChainError>().and_then(ChainError::exit_code),
                   Some(7));
    }

    #[test]
    #[should_panic(expected = "Unable to execute command(s): command \"false\" (command #1) failed with exit status 1")]
    fn test_must_run_panics_on_failure() {
        CommandChain::new().command("false", NO_ARGS).must_run_and_wait();
    }

    #[test]
    fn test_reader_and_waiter() {
        let mut chain = CommandChain::new();
        chain.command("echo", ["hello"]);
        let (mut rd, waiter) = chain.must_run_and_get_reader();
        let mut text = String::new();
        rd.read_to_string(&mut text).unwrap();
        assert_eq!(chain.state(), ChainState::Running);
        let res = waiter.must_wait();
        assert_eq!(text, "hello\n");
        assert_eq!(res.exit_codes(), vec![Some(0)]);
        assert_eq!(res.chain().state(), ChainState::Succeeded);
    }

    #[test]
    fn test_buffered_reader_capacity() {
        let mut chain = CommandChain::with_config(ChainConfig::default().buffer_size(10));
        chain.command("printf", ["x\\ny\\n"]);
        let (rd, waiter) = chain.must_run_and_get_buffered_reader();
        assert_eq!(rd.capacity(), 10);
        let lines: Vec<String> = rd.lines().map(Result::unwrap).collect();
        waiter.must_wait();
        assert_eq!(lines, vec!["x", "y"]);
    }

    #[test]
    fn test_stream_lines_all() {
        let mut seen = Vec::new();
        let res = CommandChain::new()
            .command("bash", ["-c", "for n in {0..9}; do echo line $n; done"])
            .must_run_and_stream_lines(|line| {
                seen.push(line.to_string());
                ControlFlow::Continue(())
            });
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[0], "line 0");
        assert_eq!(seen[9], "line 9");
        assert_eq!(res.exit_codes(), vec![Some(0)]);
    }

    #[test]
    fn test_stream_lines_stop_early() {
        let mut seen = Vec::new();
        let res = CommandChain::new()
            .command("seq", ["1", "200000"])
            .run_and_stream_lines(|line| {
                seen.push(line.to_string());
                if seen.len() == 3 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
            });
        assert!(res.is_ok());
        assert_eq!(seen, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_stream_bytes_reports_failure() {
        let mut count = 0;
        let err = CommandChain::new()
            .command("bash", ["-c", "echo one; echo two; exit 3"])
            .run_and_stream_bytes(|_| {
                count += 1;
                ControlFlow::Continue(())
            })
            .unwrap_err();
        assert_eq!(count, 2);
        assert_eq!(err.downcast_ref::<ChainError>().and_then(ChainError::exit_code),
                   Some(3));
    }

    #[test]
    fn test_line_stream_iterates() {
        let mut stream = CommandChain::with_input_string("a\nb\nc")
            .command("cat", NO_ARGS)
            .must_run_and_stream();
        let lines: Vec<String> = stream.by_ref().map(Result::unwrap).collect();
        assert_eq!(lines, vec!["a", "b", "c"]);
        assert!(stream.next_line_bytes().is_none());
        stream.must_close();
    }

    #[test]
    fn test_abandoned_line_stream_waits() {
        let mut chain = CommandChain::new();
        chain.command("seq", ["1", "100000"]);
        {
            let mut stream = chain.must_run_and_stream();
            assert_eq!(stream.next().unwrap().unwrap(), "1");
        }
        assert_eq!(chain.state(), ChainState::Succeeded);
    }

    /// Runs the closure on another thread, failing if it does not finish in
    /// time.
    fn within_10s<T, F>(what: &str, f: F) -> T
    where F: FnOnce() -> T + Send + 'static, T: Send + 'static
    {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || { let _ = tx.send(f()); });
        match rx.recv_timeout(std::time::Duration::from_secs(10)) {
            Ok(v) => v,
            Err(_) => panic!("{} did not return within 10s", what),
        }
    }

    #[test]
    fn test_stop_streaming_endless_output() {
        let (seen, res) = within_10s("run_and_stream_lines", || {
            let mut seen = Vec::new();
            let res = CommandChain::new()
                .command("yes", NO_ARGS)
                .run_and_stream_lines(|line| {
                    seen.push(line.to_string());
                    ControlFlow::Break(())
                });
            (seen, res.map(|r| r.exit_codes()))
        });
        assert_eq!(seen, vec!["y"]);
        assert_eq!(res.unwrap(), vec![None]);
    }

    #[test]
    fn test_stop_streaming_endless_pipeline() {
        let res = within_10s("run_and_stream_bytes", || {
            let mut count = 0;
            CommandChain::new()
                .command("yes", ["abc"])
                .pipe()
                .command("cat", NO_ARGS)
                .run_and_stream_bytes(|line| {
                    assert_eq!(line, b"abc");
                    count += 1;
                    if count == 5 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
                })
                .map(|_| count)
        });
        assert_eq!(res.unwrap(), 5);
    }

    #[test]
    fn test_drop_endless_line_stream() {
        let state = within_10s("dropping the LineStream", || {
            let mut chain = CommandChain::new();
            chain.command("yes", NO_ARGS);
            let mut stream = chain.must_run_and_stream();
            assert_eq!(stream.next().unwrap().unwrap(), "y");
            drop(stream);
            chain.state()
        });
        assert_eq!(state, ChainState::Succeeded);
    }

    #[test]
    fn test_sigpipe_is_failure_when_output_fully_read() {
        let err = CommandChain::new()
            .command("bash", ["-c", "echo last; kill -PIPE $$"])
            .run_and_stream_lines(|_| ControlFlow::Continue(()))
            .unwrap_err();
        assert_eq!(err.downcast_ref::<ChainError>().and_then(ChainError::exit_code),
                   Some(-1));
    }
}
