//! Content plumbing between connections: pipes (ring buffers shared by
//! producer/consumer connections on one net thread), file windows, and
//! the streamer that merges ordered nodes into one body.

use crate::buffer::Buffer;
use crate::error::{NetError, NetResult};
use crate::http::FileMeta;
use mio::Token;
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

/// Result of pulling from a content source.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Pull {
    /// Bytes were produced.
    Data(usize),
    /// No data right now; retry when the producer wakes the consumer.
    Wait,
    /// Source exhausted.
    Eof,
}

// Read block for file serving. Small files are served in one block;
// larger ones stream window by window.
pub const FILE_READ_BLOCK: usize = 32768;
/// Files up to this size are read in a single block.
pub const SMALL_FILE_SIZE: u64 = 32768;
/// Upper bound on one file window kept in flight.
pub const FILE_WINDOW_SIZE: u64 = 64 * 1024 * 1024;

/// A half-open window `[offset, end)` over a regular file, read with
/// positional reads as the socket drains.
pub struct FileWindow {
    path: PathBuf,
    file: Option<File>,
    pub offset: u64,
    pub end: u64,
    pub meta: FileMeta,
}

impl FileWindow {
    pub fn new(path: PathBuf, offset: u64, end: u64, meta: FileMeta) -> FileWindow {
        FileWindow {
            path,
            file: None,
            offset,
            end,
            meta,
        }
    }

    #[inline]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.end - self.offset
    }

    /// Pull the next block into `buf`. The file is opened on first
    /// use so stat-only paths never pay for an open.
    pub fn read_into(&mut self, buf: &mut [u8]) -> io::Result<Pull> {
        if self.offset >= self.end {
            return Ok(Pull::Eof);
        }
        if self.file.is_none() {
            self.file = Some(File::open(&self.path)?);
        }
        let file = self.file.as_ref().expect("file opened above");
        let want = (self.remaining().min(buf.len() as u64)) as usize;
        let got = file.read_at(&mut buf[..want], self.offset)?;
        if got == 0 {
            // file truncated under us
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.offset += got as u64;
        Ok(Pull::Data(got))
    }
}

/// Typed handle to a pipe in the net thread's pipe table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PipeId(pub usize);

/// Byte FIFO connecting two connections on the same net thread. The
/// producer appends and sets EOF; the consumer drains. Tokens are kept
/// so the pumps know whom to wake.
pub struct Pipe {
    pub buf: Buffer,
    pub eof: bool,
    pub producer: Option<Token>,
    pub consumer: Option<Token>,
    /// Producer vanished before EOF (backend/subrequest failure).
    pub broken: bool,
}

impl Pipe {
    fn new(size: usize) -> Pipe {
        Pipe {
            buf: Buffer::new(size),
            eof: false,
            producer: None,
            consumer: None,
            broken: false,
        }
    }

    /// Append bytes, up to free capacity. Returns bytes accepted.
    #[inline]
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.buf.append(data)
    }

    #[inline]
    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// Pull buffered bytes into `out`.
    pub fn read_into(&mut self, out: &mut [u8]) -> Pull {
        if self.buf.is_empty() {
            if self.eof {
                return Pull::Eof;
            }
            return Pull::Wait;
        }
        let take = out.len().min(self.buf.len());
        out[..take].copy_from_slice(&self.buf.read_slice()[..take]);
        self.buf.consume(take);
        Pull::Data(take)
    }
}

/// Pipe slots with a free list, owned by the net thread.
pub struct PipeTable {
    slots: Vec<Option<Pipe>>,
    free: Vec<usize>,
}

impl PipeTable {
    pub fn new() -> PipeTable {
        PipeTable {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn create(&mut self, size: usize) -> PipeId {
        let pipe = Pipe::new(size);
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(pipe);
                PipeId(idx)
            }
            None => {
                self.slots.push(Some(pipe));
                PipeId(self.slots.len() - 1)
            }
        }
    }

    #[inline]
    pub fn get_mut(&mut self, id: PipeId) -> &mut Pipe {
        self.slots[id.0].as_mut().expect("pipe already released")
    }

    #[inline]
    pub fn get(&self, id: PipeId) -> &Pipe {
        self.slots[id.0].as_ref().expect("pipe already released")
    }

    pub fn release(&mut self, id: PipeId) {
        if self.slots[id.0].take().is_some() {
            self.free.push(id.0);
        }
    }

    /// Detach a pipe while its producer pumps into it (the pump may
    /// itself read other pipes from this table). Pair with `put`.
    pub fn take(&mut self, id: PipeId) -> Option<Pipe> {
        self.slots[id.0].take()
    }

    pub fn put(&mut self, id: PipeId, pipe: Pipe) {
        self.slots[id.0] = Some(pipe);
    }

    /// Mark the pipe's producer as gone. A consumer mid-stream sees a
    /// broken pipe; one that has not started can fall back.
    pub fn break_pipe(&mut self, id: PipeId) {
        if let Some(pipe) = self.slots[id.0].as_mut() {
            pipe.broken = true;
        }
    }

    /// Producer token of a live pipe.
    pub fn producer(&self, id: PipeId) -> Option<Token> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .and_then(|pipe| pipe.producer)
    }

    /// Consumer token of a live pipe.
    pub fn consumer(&self, id: PipeId) -> Option<Token> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .and_then(|pipe| pipe.consumer)
    }
}

/// One node of a composite response body.
pub enum StreamerNode {
    Bytes { data: Vec<u8>, pos: usize },
    File(FileWindow),
    Pipe(PipeId),
}

/// Sequential in-order merge of nodes into a single content source.
/// Each node's EOF advances to the next; closing marks the node list
/// complete so the final node's EOF ends the whole stream.
pub struct Streamer {
    nodes: VecDeque<StreamerNode>,
    closed: bool,
    started: bool,
}

impl Streamer {
    pub fn new() -> Streamer {
        Streamer {
            nodes: VecDeque::new(),
            closed: false,
            started: false,
        }
    }

    pub fn append_bytes(&mut self, data: Vec<u8>) {
        debug_assert!(!self.closed);
        self.nodes.push_back(StreamerNode::Bytes { data, pos: 0 });
    }

    pub fn append_file(&mut self, fw: FileWindow) {
        debug_assert!(!self.closed);
        self.nodes.push_back(StreamerNode::File(fw));
    }

    pub fn append_pipe(&mut self, id: PipeId) {
        debug_assert!(!self.closed);
        self.nodes.push_back(StreamerNode::Pipe(id));
    }

    /// Call right after appending the last node.
    pub fn close(&mut self) {
        self.closed = true;
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True once any body byte has been produced.
    #[inline]
    pub fn started(&self) -> bool {
        self.started
    }

    /// Pipe ids still referenced by pending nodes (for cleanup).
    pub fn pipe_ids(&self) -> Vec<PipeId> {
        self.nodes
            .iter()
            .filter_map(|n| match n {
                StreamerNode::Pipe(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Pull the next block of the merged stream.
    pub fn read_into(&mut self, out: &mut [u8], pipes: &mut PipeTable) -> NetResult<Pull> {
        loop {
            let node = match self.nodes.front_mut() {
                Some(node) => node,
                None => {
                    if self.closed {
                        return Ok(Pull::Eof);
                    }
                    return Ok(Pull::Wait); // more nodes may still be appended
                }
            };
            let pull = match node {
                StreamerNode::Bytes { data, pos } => {
                    if *pos >= data.len() {
                        Pull::Eof
                    } else {
                        let take = out.len().min(data.len() - *pos);
                        out[..take].copy_from_slice(&data[*pos..*pos + take]);
                        *pos += take;
                        Pull::Data(take)
                    }
                }
                StreamerNode::File(fw) => fw.read_into(out).map_err(NetError::from)?,
                StreamerNode::Pipe(id) => {
                    let pipe = pipes.get_mut(*id);
                    if pipe.broken && pipe.buf.is_empty() && !pipe.eof {
                        return Err(NetError::Fatal(crate::error::FatalKind::Io));
                    }
                    pipe.read_into(out)
                }
            };
            match pull {
                Pull::Data(n) => {
                    self.started = true;
                    return Ok(Pull::Data(n));
                }
                Pull::Wait => return Ok(Pull::Wait),
                Pull::Eof => {
                    if let Some(StreamerNode::Pipe(id)) = self.nodes.front() {
                        pipes.release(*id);
                    }
                    self.nodes.pop_front();
                    // advance to the next node
                }
            }
        }
    }
}

/// Sink for a streamed request body. Handlers connect one before
/// returning from `on_headers` to receive body bytes as they arrive.
pub trait BodySink: Send {
    /// Deliver decoded body bytes. The sink must accept them all;
    /// flow control happens at the socket read side.
    fn on_data(&mut self, data: &[u8]) -> NetResult<()>;
    /// Body complete.
    fn on_complete(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_write_read_eof() {
        let mut pipes = PipeTable::new();
        let id = pipes.create(4096);
        let pipe = pipes.get_mut(id);
        assert_eq!(pipe.read_into(&mut [0u8; 8]), Pull::Wait);
        assert_eq!(pipe.write(b"abc"), 3);
        let mut out = [0u8; 8];
        assert_eq!(pipe.read_into(&mut out), Pull::Data(3));
        assert_eq!(&out[..3], b"abc");
        pipe.set_eof();
        assert_eq!(pipe.read_into(&mut out), Pull::Eof);
    }

    #[test]
    fn test_pipe_table_reuses_slots() {
        let mut pipes = PipeTable::new();
        let a = pipes.create(4096);
        pipes.release(a);
        let b = pipes.create(4096);
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn test_streamer_ordered_merge() {
        let mut pipes = PipeTable::new();
        let id = pipes.create(4096);
        pipes.get_mut(id).write(b"-middle-");
        pipes.get_mut(id).set_eof();

        let mut streamer = Streamer::new();
        streamer.append_bytes(b"start".to_vec());
        streamer.append_pipe(id);
        streamer.append_bytes(b"end".to_vec());
        streamer.close();

        let mut assembled = Vec::new();
        let mut block = [0u8; 4];
        loop {
            match streamer.read_into(&mut block, &mut pipes).unwrap() {
                Pull::Data(n) => assembled.extend_from_slice(&block[..n]),
                Pull::Eof => break,
                Pull::Wait => panic!("unexpected wait"),
            }
        }
        assert_eq!(assembled, b"start-middle-end");
    }

    #[test]
    fn test_streamer_waits_for_open_node_list() {
        let mut pipes = PipeTable::new();
        let mut streamer = Streamer::new();
        streamer.append_bytes(b"a".to_vec());
        let mut block = [0u8; 4];
        assert_eq!(streamer.read_into(&mut block, &mut pipes).unwrap(), Pull::Data(1));
        // bytes node exhausted but list not closed yet
        assert_eq!(streamer.read_into(&mut block, &mut pipes).unwrap(), Pull::Wait);
        streamer.close();
        assert_eq!(streamer.read_into(&mut block, &mut pipes).unwrap(), Pull::Eof);
    }

    #[test]
    fn test_streamer_waits_on_dry_pipe() {
        let mut pipes = PipeTable::new();
        let id = pipes.create(4096);
        let mut streamer = Streamer::new();
        streamer.append_pipe(id);
        streamer.close();
        let mut block = [0u8; 4];
        assert_eq!(streamer.read_into(&mut block, &mut pipes).unwrap(), Pull::Wait);
        pipes.get_mut(id).write(b"zz");
        assert_eq!(streamer.read_into(&mut block, &mut pipes).unwrap(), Pull::Data(2));
        pipes.get_mut(id).set_eof();
        assert_eq!(streamer.read_into(&mut block, &mut pipes).unwrap(), Pull::Eof);
    }

    #[test]
    fn test_streamer_broken_pipe_is_fatal() {
        let mut pipes = PipeTable::new();
        let id = pipes.create(4096);
        let mut streamer = Streamer::new();
        streamer.append_pipe(id);
        streamer.close();
        pipes.break_pipe(id);
        let mut block = [0u8; 4];
        assert!(streamer.read_into(&mut block, &mut pipes).is_err());
    }

    #[test]
    fn test_file_window_reads_range() {
        use std::io::Write;
        let dir = std::env::temp_dir().join("nxweb-stream-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("window.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"0123456789").unwrap();
        drop(f);

        let meta = FileMeta::from_std(&std::fs::metadata(&path).unwrap());
        let mut fw = FileWindow::new(path.clone(), 2, 7, meta);
        let mut out = [0u8; 3];
        let mut collected = Vec::new();
        loop {
            match fw.read_into(&mut out).unwrap() {
                Pull::Data(n) => collected.extend_from_slice(&out[..n]),
                Pull::Eof => break,
                Pull::Wait => unreachable!(),
            }
        }
        assert_eq!(collected, b"23456");
        std::fs::remove_file(&path).ok();
    }
}
