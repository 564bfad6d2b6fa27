//! The finite state machine applied on commit.
//!
//! Commands are byte-prefixed: `[req_type: u8][proto-encoded payload]`.
//! The only request type today is `Append` (0x00) carrying a
//! `ProduceRequest`. The FSM applies committed commands to the local
//! commit log and answers with an encoded `ProduceResponse`.

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use driftlog_proto::{ProduceRequest, ProduceResponse, Record};
use driftlog_storage::{Log, LEN_WIDTH};
use prost::Message;
use tracing::debug;

use crate::error::{Error, Result};

/// Command discriminator for appends.
pub const APPEND_REQUEST_TYPE: u8 = 0;

/// Hooks the consensus runtime drives: apply committed commands, stream
/// out the full state, and rebuild state from such a stream.
pub trait Fsm: Send + 'static {
    /// Apply one committed command and return its encoded response.
    fn apply(&mut self, data: &[u8]) -> Result<Bytes>;

    /// A byte stream capturing the full state at this commit point.
    fn snapshot(&mut self) -> Result<Box<dyn Read + Send>>;

    /// Replace all state with the contents of a snapshot stream.
    fn restore(&mut self, reader: Box<dyn Read>) -> Result<()>;
}

/// The commit-log FSM: committed appends land in the shared [`Log`].
///
/// Applies are idempotent across restarts: commands are applied in commit
/// order and each appends exactly one record, so the k-th command maps to a
/// fixed offset. Commands whose record is already durable from a previous
/// run are skipped and answered with the offset assigned back then.
pub struct LogFsm {
    log: Arc<Log>,
    /// Offset the next applied command will produce.
    next_offset: u64,
    /// Offsets below this were durable before this process started.
    durable_next: u64,
}

impl LogFsm {
    pub fn new(log: Arc<Log>) -> Self {
        let durable_next = log.next_offset();
        let next_offset = log.lowest_offset();
        Self {
            log,
            next_offset,
            durable_next,
        }
    }

    fn apply_append(&mut self, data: &[u8]) -> Result<Bytes> {
        let req = ProduceRequest::decode(data)?;
        let record = req.record.unwrap_or_default();

        let target = self.next_offset;
        self.next_offset += 1;

        let offset = if target < self.durable_next {
            // Replay of a command already applied by a previous run.
            debug!(offset = target, "skipping replay of durable record");
            target
        } else {
            self.log.append(record)?
        };

        let resp = ProduceResponse { offset };
        let mut buf = Vec::with_capacity(resp.encoded_len());
        resp.encode(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

impl Fsm for LogFsm {
    fn apply(&mut self, data: &[u8]) -> Result<Bytes> {
        match data.first().copied() {
            Some(APPEND_REQUEST_TYPE) => self.apply_append(&data[1..]),
            other => Err(Error::Config(format!(
                "unknown command type: {:?}",
                other
            ))),
        }
    }

    fn snapshot(&mut self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.log.reader()?))
    }

    /// Rebuild the log from a frame stream. The first record's offset
    /// becomes the new initial offset so all records keep the offsets they
    /// were assigned on the snapshotting node.
    fn restore(&mut self, mut reader: Box<dyn Read>) -> Result<()> {
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        let mut first = true;

        loop {
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u64::from_be_bytes(len_buf) as usize;
            let mut frame = vec![0u8; len];
            reader.read_exact(&mut frame)?;

            let record = Record::decode(&frame[..])?;
            if first {
                self.log.reset_to(record.offset)?;
                first = false;
            }
            self.log.append(record)?;
        }

        self.next_offset = self.log.next_offset();
        self.durable_next = self.next_offset;
        Ok(())
    }
}
