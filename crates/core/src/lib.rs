pub mod error;
pub mod mapping;
pub mod record;
pub mod repository;
pub mod session;

pub use error::{MeisaiError, Result, RowError, RowErrorKind, StreamError};
pub use mapping::{
    normalize_confidence, MappingFilter, MappingId, MappingRecord, MappingStatus, MappingUpdate,
    MatchType, NewMapping,
};
pub use record::{RecordId, StatementFields, StatementRecord};
pub use repository::{MappingRepository, StatementRepository};
pub use session::{ImportProgress, ImportSession, ImportSource, ImportStatus, RowOutcome, SessionId};
