//! Per-request context threaded through the write path

use uuid::Uuid;

use crate::ops::RawOpMap;

/// Actor identity plus the raw op maps accumulated by one request.
///
/// Lives for one top-level request/transaction; the outer synchronization
/// layer drains the accumulated maps with [`RequestContext::take_raw_op_maps`]
/// after commit.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: String,
    actor_id: String,
    raw_op_maps: Vec<RawOpMap>,
}

impl RequestContext {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            actor_id: actor_id.into(),
            raw_op_maps: Vec::new(),
        }
    }

    /// Source id stamped on every op this request produces
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn push_raw_op_map(&mut self, map: RawOpMap) {
        self.raw_op_maps.push(map);
    }

    pub fn raw_op_maps(&self) -> &[RawOpMap] {
        &self.raw_op_maps
    }

    pub fn take_raw_op_maps(&mut self) -> Vec<RawOpMap> {
        std::mem::take(&mut self.raw_op_maps)
    }
}
