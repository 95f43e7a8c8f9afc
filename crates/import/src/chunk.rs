use csv_core::{ReadRecordResult, ReaderBuilder, Terminator};
use meisai_core::{SessionId, StreamError};
use serde::{Deserialize, Serialize};

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// One ordered slice of a streamed upload. Chunk boundaries are arbitrary
/// byte offsets: a row, or a UTF-8 sequence, may straddle two chunks.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub session_id: SessionId,
    pub chunk_number: u64,
    pub data: Vec<u8>,
    pub is_last: bool,
}

/// What to do with a chunk addressed to a different session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
    /// Fail the session.
    #[default]
    Reject,
    /// Log and drop the chunk.
    Ignore,
}

/// Rebuilds complete CSV rows from the chunks of one session.
///
/// Row boundaries come from an incremental CSV parser, so a newline inside
/// a quoted field never ends a row and the parse state carries across
/// chunks. Blank lines are skipped, a trailing `\r` is dropped and a UTF-8
/// BOM before the first row is stripped. Bytes of an unfinished row are
/// carried into the next chunk and flushed by the final one.
#[derive(Debug)]
pub struct ChunkReassembler {
    session_id: SessionId,
    policy: MismatchPolicy,
    next_chunk: Option<u64>,
    finished: bool,
    /// Raw bytes of the row in progress.
    buffer: Vec<u8>,
    /// How much of `buffer` the parser has consumed.
    scan_from: usize,
    parser: csv_core::Reader,
    // Scratch for the parser's field output, which is not kept.
    fields: Vec<u8>,
    ends: Vec<usize>,
    rows_emitted: u64,
}

impl ChunkReassembler {
    pub fn new(session_id: SessionId, policy: MismatchPolicy) -> Self {
        ChunkReassembler {
            session_id,
            policy,
            next_chunk: None,
            finished: false,
            buffer: Vec::new(),
            scan_from: 0,
            parser: row_parser(),
            fields: vec![0; 4096],
            ends: vec![0; 64],
            rows_emitted: 0,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes received but not yet part of a complete row.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Accepts the next chunk and returns the rows it completes, including
    /// the flushed tail when `is_last` is set. `Ok(None)` means the chunk was
    /// addressed elsewhere and dropped under [`MismatchPolicy::Ignore`].
    pub fn push(&mut self, chunk: Chunk) -> Result<Option<Vec<Vec<u8>>>, StreamError> {
        if chunk.session_id != self.session_id {
            return match self.policy {
                MismatchPolicy::Reject => Err(StreamError::SessionMismatch {
                    expected: self.session_id,
                    got: chunk.session_id,
                }),
                MismatchPolicy::Ignore => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        got = %chunk.session_id,
                        chunk_number = chunk.chunk_number,
                        "ignoring chunk addressed to another session"
                    );
                    Ok(None)
                }
            };
        }
        if self.finished {
            return Err(StreamError::AfterLast(chunk.chunk_number));
        }
        if let Some(expected) = self.next_chunk {
            if chunk.chunk_number != expected {
                return Err(StreamError::OutOfOrder {
                    expected,
                    got: chunk.chunk_number,
                });
            }
        }
        self.next_chunk = Some(chunk.chunk_number + 1);

        self.buffer.extend_from_slice(&chunk.data);
        let mut rows = Vec::new();
        self.drain_rows(&mut rows);
        if chunk.is_last {
            self.finished = true;
            let tail = std::mem::take(&mut self.buffer);
            let row = clean_row(&tail, self.rows_emitted == 0);
            if !row.is_empty() {
                rows.push(row);
                self.rows_emitted += 1;
            }
            self.scan_from = 0;
            self.parser.reset();
        }
        Ok(Some(rows))
    }

    /// Releases buffered bytes after a cancellation or failure.
    pub fn discard(&mut self) {
        self.buffer = Vec::new();
        self.scan_from = 0;
        self.parser.reset();
        self.finished = true;
    }

    /// Feeds unparsed bytes to the parser and moves every completed row out
    /// of the buffer.
    fn drain_rows(&mut self, rows: &mut Vec<Vec<u8>>) {
        let mut row_start = 0;
        while self.scan_from < self.buffer.len() {
            let (result, nin, _, _) = self.parser.read_record(
                &self.buffer[self.scan_from..],
                &mut self.fields,
                &mut self.ends,
            );
            self.scan_from += nin;
            match result {
                ReadRecordResult::Record => {
                    rows.push(clean_row(
                        &self.buffer[row_start..self.scan_from],
                        self.rows_emitted == 0,
                    ));
                    self.rows_emitted += 1;
                    row_start = self.scan_from;
                }
                ReadRecordResult::InputEmpty | ReadRecordResult::End => break,
                // Scratch full: the parser keeps its place, so read on.
                ReadRecordResult::OutputFull | ReadRecordResult::OutputEndsFull => {
                    if nin == 0 {
                        break;
                    }
                }
            }
        }
        self.buffer.drain(..row_start);
        self.scan_from -= row_start;
    }
}

fn row_parser() -> csv_core::Reader {
    ReaderBuilder::new().terminator(Terminator::Any(b'\n')).build()
}

/// Strips what the parser treats as framing: the BOM, blank lines before
/// the row and its line ending.
fn clean_row(raw: &[u8], first: bool) -> Vec<u8> {
    let mut row = raw;
    if first {
        row = row.strip_prefix(BOM).unwrap_or(row);
    }
    let start = row.iter().position(|&b| b != b'\n').unwrap_or(row.len());
    row = &row[start..];
    row = row.strip_suffix(b"\n").unwrap_or(row);
    row = row.strip_suffix(b"\r").unwrap_or(row);
    row.to_vec()
}
