//! Describes where the input of a chain comes from and where the output and
//! error output of each command in the chain go.
//!
//! The public [Sink] and [Source] types are the user-level descriptions.  When
//! a command is configured these are converted into the internal wiring
//! (`OutWire`, `InWire`) that can be handed to the OS when the command is
//! started.  A destination that is not backed by a file descriptor (an in-memory
//! buffer, an arbitrary writer) is wired to an OS pipe whose read end is
//! serviced by a copier thread (a `Drain`) while the command runs.

use std::fmt;
use std::fs::File;
use std::io;
use std::io::{PipeReader, PipeWriter, Read, Write};
use std::process::{ChildStdin, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::execution::OsRun;


/// A cloneable, thread-safe, in-memory byte buffer.  All clones refer to the
/// same underlying bytes, so a clone can be given to a chain as a [Sink] and
/// the original used to examine the bytes written after the chain completes.
#[derive(Clone,Debug,Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> SharedBuffer
    {
        SharedBuffer::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>>
    {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a copy of the bytes currently in the buffer.
    pub fn contents(&self) -> Vec<u8>
    {
        self.lock().clone()
    }

    pub fn to_string_lossy(&self) -> String
    {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    pub fn len(&self) -> usize
    {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.lock().is_empty()
    }

    pub fn clear(&self)
    {
        self.lock().clear()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize>
    {
        self.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()>
    {
        Ok(())
    }
}


/// A writer shared between the user and a chain's copier thread.
#[derive(Clone)]
pub struct SharedWriter(Arc<Mutex<dyn Write + Send>>);

impl SharedWriter {
    pub fn new<W>(writer: W) -> SharedWriter
    where W: Write + Send + 'static
    {
        SharedWriter(Arc::new(Mutex::new(writer)))
    }
}

impl Write for SharedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize>
    {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).write(data)
    }

    fn flush(&mut self) -> io::Result<()>
    {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).flush()
    }
}

impl fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("SharedWriter")
    }
}


/// Specifies a destination for the output or error output of a command.
pub enum Sink {
    /// The standard output of the current process.
    Stdout,
    /// The standard error of the current process.
    Stderr,
    /// Discard everything written.
    Null,
    /// Write to this (already opened) file.
    File(File),
    /// Collect into an in-memory buffer.
    Buffer(SharedBuffer),
    /// Copy into an arbitrary writer.
    Writer(SharedWriter),
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Sink::Stdout => f.write_str("Stdout"),
            Sink::Stderr => f.write_str("Stderr"),
            Sink::Null => f.write_str("Null"),
            Sink::File(file) => write!(f, "File({:?})", file),
            Sink::Buffer(b) => write!(f, "Buffer({} bytes)", b.len()),
            Sink::Writer(_) => f.write_str("Writer"),
        }
    }
}

impl Sink {

    /// Convenience constructor for a [Sink::Writer] from any writer.
    pub fn writer<W>(writer: W) -> Sink
    where W: Write + Send + 'static
    {
        Sink::Writer(SharedWriter::new(writer))
    }

    /// Creates another Sink referring to the same destination.  This can fail
    /// only for [Sink::File], where the file handle must be duplicated.
    pub fn try_clone(&self) -> io::Result<Sink>
    {
        Ok(match self {
            Sink::Stdout => Sink::Stdout,
            Sink::Stderr => Sink::Stderr,
            Sink::Null => Sink::Null,
            Sink::File(file) => Sink::File(file.try_clone()?),
            Sink::Buffer(b) => Sink::Buffer(b.clone()),
            Sink::Writer(w) => Sink::Writer(w.clone()),
        })
    }

    /// Converts this sink into the wiring for a command.  The returned [Drain]
    /// (if any) must be started when the command is started.
    pub(crate) fn into_wire(self, os: &dyn OsRun) -> io::Result<(OutWire, Option<Drain>)>
    {
        Ok(match self {
            Sink::Stdout => (OutWire::Stdout, None),
            Sink::Stderr => (OutWire::Stderr, None),
            Sink::Null => (OutWire::Null, None),
            Sink::File(file) => (OutWire::File(file), None),
            Sink::Buffer(b) => {
                let (rd, wr) = os.mk_pipe()?;
                (OutWire::Pipe(wr), Some(Drain { reader: rd, target: Box::new(b) }))
            }
            Sink::Writer(w) => {
                let (rd, wr) = os.mk_pipe()?;
                (OutWire::Pipe(wr), Some(Drain { reader: rd, target: Box::new(w) }))
            }
        })
    }
}


/// Specifies the input for the first command in a chain.
pub enum Source {
    /// The standard input of the current process.
    Stdin,
    /// Empty input.
    Null,
    /// Read from this (already opened) file.
    File(File),
    /// Feed these bytes.
    Bytes(Vec<u8>),
    /// Feed everything that can be read from this reader.
    Reader(Box<dyn Read + Send>),
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Source::Stdin => f.write_str("Stdin"),
            Source::Null => f.write_str("Null"),
            Source::File(file) => write!(f, "File({:?})", file),
            Source::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Source::Reader(_) => f.write_str("Reader"),
        }
    }
}

impl From<Source> for InWire {
    fn from(src: Source) -> InWire
    {
        match src {
            Source::Stdin => InWire::Stdin,
            Source::Null => InWire::Null,
            Source::File(file) => InWire::File(file),
            Source::Bytes(data) => InWire::Feed(Box::new(io::Cursor::new(data))),
            Source::Reader(rd) => InWire::Feed(rd),
        }
    }
}


// ----------------------------------------------------------------------
// Internal wiring

/// The resolved destination of a command's output or error output.
pub(crate) enum OutWire {
    Stdout,
    Stderr,
    Null,
    File(File),
    Pipe(PipeWriter),
}

impl fmt::Debug for OutWire {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OutWire::Stdout => f.write_str("Stdout"),
            OutWire::Stderr => f.write_str("Stderr"),
            OutWire::Null => f.write_str("Null"),
            OutWire::File(_) => f.write_str("File"),
            OutWire::Pipe(_) => f.write_str("Pipe"),
        }
    }
}

impl OutWire {

    /// Duplicates this wiring so that two streams of a command can share the
    /// same destination.
    pub(crate) fn try_clone(&self) -> io::Result<OutWire>
    {
        Ok(match self {
            OutWire::Stdout => OutWire::Stdout,
            OutWire::Stderr => OutWire::Stderr,
            OutWire::Null => OutWire::Null,
            OutWire::File(file) => OutWire::File(file.try_clone()?),
            OutWire::Pipe(wr) => OutWire::Pipe(wr.try_clone()?),
        })
    }

    pub(crate) fn into_stdio(self) -> Stdio
    {
        match self {
            OutWire::Stdout => Stdio::from(io::stdout()),
            OutWire::Stderr => Stdio::from(io::stderr()),
            OutWire::Null => Stdio::null(),
            OutWire::File(file) => Stdio::from(file),
            OutWire::Pipe(wr) => Stdio::from(wr),
        }
    }
}


/// The resolved input of a command.
pub(crate) enum InWire {
    Stdin,
    Null,
    File(File),
    Pipe(PipeReader),
    Feed(Box<dyn Read + Send>),
}

impl fmt::Debug for InWire {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InWire::Stdin => f.write_str("Stdin"),
            InWire::Null => f.write_str("Null"),
            InWire::File(_) => f.write_str("File"),
            InWire::Pipe(_) => f.write_str("Pipe"),
            InWire::Feed(_) => f.write_str("Feed"),
        }
    }
}

impl InWire {

    /// Returns the Stdio for the command, along with the reader that must be
    /// fed to the command's piped stdin once it has been spawned.
    pub(crate) fn into_stdio(self) -> (Stdio, Option<Box<dyn Read + Send>>)
    {
        match self {
            InWire::Stdin => (Stdio::inherit(), None),
            InWire::Null => (Stdio::null(), None),
            InWire::File(file) => (Stdio::from(file), None),
            InWire::Pipe(rd) => (Stdio::from(rd), None),
            InWire::Feed(rd) => (Stdio::piped(), Some(rd)),
        }
    }
}


/// The read end of a pipe that a command writes to, and the destination that
/// the data read from it should be copied to.
pub(crate) struct Drain {
    reader: PipeReader,
    target: Box<dyn Write + Send>,
}

impl fmt::Debug for Drain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Drain")
    }
}

impl Drain {

    /// Starts copying on a separate thread.  The copy ends when every write end
    /// of the pipe has been closed, i.e. when the command(s) writing to it have
    /// exited.
    pub(crate) fn start(self) -> thread::JoinHandle<io::Result<u64>>
    {
        let Drain { mut reader, mut target } = self;
        thread::spawn(move || {
            let n = io::copy(&mut reader, &mut target)?;
            target.flush()?;
            Ok(n)
        })
    }
}


/// Starts a thread writing everything from the reader to a command's stdin.
/// The command is allowed to exit without reading all of its input, so a
/// broken pipe is not considered a failure.
pub(crate) fn start_feeder(mut input: Box<dyn Read + Send>, mut stdin: ChildStdin)
                           -> thread::JoinHandle<io::Result<u64>>
{
    thread::spawn(move || {
        match io::copy(&mut input, &mut stdin) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(0),
            Err(e) => Err(e),
        }
        // stdin is closed here, signalling end of input to the command
    })
}


// ----------------------------------------------------------------------
// TESTS
// ----------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use crate::execution::Executor;

    #[test]
    fn test_shared_buffer_clones_share_bytes() {
        let buf = SharedBuffer::new();
        assert!(buf.is_empty());
        let mut other = buf.clone();
        other.write_all(b"abc").unwrap();
        write!(other, "{}", 12).unwrap();
        assert_eq!(buf.contents(), b"abc12");
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.to_string_lossy(), "abc12");
        buf.clear();
        assert!(other.is_empty());
    }

    #[test]
    fn test_sink_try_clone() {
        let tf = tempfile::tempfile().unwrap();
        let sink = Sink::File(tf);
        assert!(matches!(sink.try_clone().unwrap(), Sink::File(_)));
        let buf = SharedBuffer::new();
        match Sink::Buffer(buf.clone()).try_clone().unwrap() {
            Sink::Buffer(mut b) => b.write_all(b"x").unwrap(),
            other => panic!("Unexpected clone: {:?}", other),
        }
        assert_eq!(buf.contents(), b"x");
        assert_eq!(format!("{:?}", Sink::Buffer(buf)), "Buffer(1 bytes)");
    }

    #[test]
    fn test_buffer_sink_drains_pipe() {
        let buf = SharedBuffer::new();
        let (wire, drain) = Sink::Buffer(buf.clone()).into_wire(&Executor::NormalRun).unwrap();
        let handle = drain.expect("buffer sink needs a drain").start();
        match wire {
            OutWire::Pipe(mut wr) => {
                wr.write_all(b"drained bytes\n").unwrap();
            }
            other => panic!("Unexpected wire: {:?}", other),
        }
        assert_eq!(handle.join().unwrap().unwrap(), 14);
        assert_eq!(buf.to_string_lossy(), "drained bytes\n");
    }

    #[test]
    fn test_writer_sink() {
        let shared = SharedBuffer::new();
        let (wire, drain) = Sink::writer(shared.clone()).into_wire(&Executor::NormalRun).unwrap();
        let handle = drain.unwrap().start();
        if let OutWire::Pipe(wr) = wire {
            let mut wr2 = OutWire::Pipe(wr).try_clone().unwrap();
            if let OutWire::Pipe(ref mut w) = wr2 {
                w.write_all(b"via clone").unwrap();
            }
        }
        handle.join().unwrap().unwrap();
        assert_eq!(shared.to_string_lossy(), "via clone");
    }

    #[test]
    fn test_fd_sinks_need_no_drain() {
        for sink in [Sink::Stdout, Sink::Stderr, Sink::Null] {
            let (_wire, drain) = sink.into_wire(&Executor::NormalRun).unwrap();
            assert!(drain.is_none());
        }
    }

    #[test]
    fn test_source_to_wire() {
        assert!(matches!(InWire::from(Source::Stdin), InWire::Stdin));
        assert!(matches!(InWire::from(Source::Null), InWire::Null));
        match InWire::from(Source::Bytes(b"data".to_vec())) {
            InWire::Feed(mut rd) => {
                let mut s = String::new();
                rd.read_to_string(&mut s).unwrap();
                assert_eq!(s, "data");
            }
            other => panic!("Unexpected wire: {:?}", other),
        }
    }
}
