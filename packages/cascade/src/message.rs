//! The unit of data that travels through streams.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lineage::LineageId;

/// One item of pipeline data, addressed by its lineage.
///
/// A message makes exactly one stream hop at a time. Ownership moves from
/// the producer into the stream and from the stream to the consumer that
/// claims it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Where this item came from.
    pub id: LineageId,
    /// Opaque structured content produced by a step.
    pub payload: Value,
}

impl Message {
    /// Create a new message.
    pub fn new(id: LineageId, payload: Value) -> Self {
        Self { id, payload }
    }
}
