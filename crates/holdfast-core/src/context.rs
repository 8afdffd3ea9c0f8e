use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use holdfast_types::ContextId;

/// Marks every context id this process issues. Other actors generate ULIDs or
/// UUIDs, neither of which can contain `:`.
pub const CONTEXT_PREFIX: &str = "hf:force:";

/// Longest context id the command transport accepts.
pub const MAX_CONTEXT_ID_LEN: usize = 36;

/// Issues context ids for corrective commands and recognizes them when they
/// come back around on the bus. Ids are only recognized by the instance's
/// prefix, so nothing needs to survive a restart.
#[derive(Debug, Default)]
pub struct ContextTagger {
    counter: AtomicU64,
}

impl ContextTagger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&self) -> ContextId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut id = format!("{CONTEXT_PREFIX}{}", URL_SAFE_NO_PAD.encode(minimal_le_bytes(n)));
        id.truncate(MAX_CONTEXT_ID_LEN);
        ContextId::new(id)
    }

    pub fn is_self_origin(&self, context_id: &str) -> bool {
        context_id.starts_with(CONTEXT_PREFIX)
    }
}

fn minimal_le_bytes(n: u64) -> Vec<u8> {
    let len = (u64::BITS - n.leading_zeros()).div_ceil(8) as usize;
    n.to_le_bytes()[..len].to_vec()
}
