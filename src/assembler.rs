//! Multipart sentence reassembly.
//!
//! Fragments sharing a multipart id are collected keyed by fragment number,
//! so duplicates overwrite and reassembly always concatenates in ascending
//! fragment order regardless of arrival order. State for an id lives from
//! its first fragment until it completes or ages out:
//!
//! ```text
//! NoState ──fragment──▶ Accumulating ──last distinct fragment──▶ Complete (removed)
//!                            │
//!                            └──first_seen older than stale_after──▶ AgedOut (removed)
//! ```

use crate::protocol::Sentence;
use std::collections::{BTreeMap, HashMap};

/// Default age after which an incomplete multipart message is discarded.
pub const DEFAULT_STALE_AFTER_SECS: f64 = 60.0;

#[derive(Debug)]
struct Partial {
    total_fragments: u8,
    payloads: BTreeMap<u8, String>,
    fill_bits: u8,
    first_seen: f64,
}

/// Outcome of feeding one sentence to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// A single-fragment sentence or a fully reassembled multipart one.
    Complete(Sentence),
    /// More fragments are needed.
    Incomplete,
}

/// Reassembles fragmented AIVDM messages.
#[derive(Debug)]
pub struct PartialAssembler {
    partials: HashMap<Option<u32>, Partial>,
    stale_after: f64,
}

impl PartialAssembler {
    pub fn new(stale_after_secs: f64) -> Self {
        Self {
            partials: HashMap::new(),
            stale_after: stale_after_secs,
        }
    }

    /// Feed a sentence received at `now` (receipt time in seconds).
    pub fn accept(&mut self, sentence: Sentence, now: f64) -> Assembly {
        if !sentence.is_multipart() {
            return Assembly::Complete(sentence);
        }

        // Stale state must not take part in this fragment's assembly.
        self.sweep(now);

        let id = sentence.multipart_id;
        let partial = self.partials.entry(id).or_insert_with(|| Partial {
            total_fragments: sentence.total_fragments,
            payloads: BTreeMap::new(),
            fill_bits: 0,
            first_seen: now,
        });

        // Same id, different shape: the old message can never complete.
        if partial.total_fragments != sentence.total_fragments {
            tracing::warn!(
                "Multipart id {:?} restarted ({} -> {} fragments), discarding {} held fragments",
                id,
                partial.total_fragments,
                sentence.total_fragments,
                partial.payloads.len()
            );
            *partial = Partial {
                total_fragments: sentence.total_fragments,
                payloads: BTreeMap::new(),
                fill_bits: 0,
                first_seen: now,
            };
        }

        if sentence.is_last_fragment() {
            partial.fill_bits = sentence.fill_bits;
        }
        partial
            .payloads
            .insert(sentence.fragment_number, sentence.payload.clone());

        if partial.payloads.len() != usize::from(sentence.total_fragments) {
            return Assembly::Incomplete;
        }

        let Some(partial) = self.partials.remove(&id) else {
            return Assembly::Incomplete;
        };
        let payload: String = partial.payloads.into_values().collect();

        Assembly::Complete(Sentence {
            fragment_number: sentence.total_fragments,
            payload,
            fill_bits: partial.fill_bits,
            ..sentence
        })
    }

    /// Drop every partial message first seen `stale_after` seconds or more
    /// before `now`. Returns how many were dropped.
    pub fn sweep(&mut self, now: f64) -> usize {
        let cutoff = now - self.stale_after;
        let before = self.partials.len();
        self.partials.retain(|id, partial| {
            let keep = partial.first_seen > cutoff;
            if !keep {
                tracing::warn!(
                    "Aged out multipart id {:?} ({} of {} fragments)",
                    id,
                    partial.payloads.len(),
                    partial.total_fragments
                );
            }
            keep
        });
        before - self.partials.len()
    }

    /// Number of multipart messages currently held.
    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}

impl Default for PartialAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER_SECS)
    }
}
