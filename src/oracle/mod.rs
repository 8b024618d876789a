// Differential execution engine

pub mod dispatcher;
pub mod divergence;
pub mod handles;
pub mod verdict;

pub use crate::store::Observation;
pub use dispatcher::MirrorFs;
pub use divergence::{
    DiagnosticOnly, DivergenceHandler, DivergenceRecord, FailFast, Recorder, handler_for,
};
pub use handles::{HandleError, HandleSession, HandleTable};
pub use verdict::{
    AttrSubset, ByteMatch, Descriptor, EntrySet, Exact, Judgement, Reconcile, Verdict, judge,
};
