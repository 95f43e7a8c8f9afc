pub mod chunk;
pub mod csv;
pub mod hash;
pub mod hash_import;
pub mod index;
pub mod linking;
pub mod match_engine;
pub mod pipeline;
pub mod registry;
pub(crate) mod util;

pub use chunk::{Chunk, ChunkReassembler, MismatchPolicy};
pub use hash::{fingerprint, is_fingerprint};
pub use hash_import::{HashImportReport, HashIndexAdmin, ImportOptions};
pub use index::{Classification, FieldSnapshot, HashIndex, HashIndexEntry, IndexStats};
pub use linking::{LinkingService, ProposalOutcome};
pub use match_engine::{BatchProposal, MatchCandidate, MatchConfig, MatchEngine, ScoredMatch};
pub use pipeline::{FileImportRequest, IngestPipeline, PipelineOptions, StreamHandle};
pub use registry::{Page, SessionFilter, SessionRegistry, DEFAULT_RETAINED_SESSIONS};
