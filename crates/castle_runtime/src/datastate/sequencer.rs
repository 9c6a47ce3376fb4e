use castle_types::{DatapointSequence, EngineContext, SequenceState, now_ms};

use crate::parts::{DatastatePart, PartResult};

/// Records the states of datapoints into their sequences
pub struct SequencerPart {
    name: String,
    sequences: Vec<DatapointSequence>,
}

impl SequencerPart {
    pub fn new(name: impl Into<String>, sequences: Vec<DatapointSequence>) -> Self {
        Self {
            name: name.into(),
            sequences,
        }
    }
}

impl DatastatePart for SequencerPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, state: &mut EngineContext) -> PartResult {
        let now = now_ms();
        for sequence in &self.sequences {
            if state.get_sequence(&sequence.id).is_none() {
                state.set_sequence(sequence.clone(), SequenceState::new(&sequence.id));
            }

            let sample = state
                .get_state(&sequence.datapoint_id)
                .filter(|s| s.has_value())
                .cloned();
            // Entries are shared with earlier snapshots; only unshare on change
            let needs_update = state.get_sequence(&sequence.id).is_some_and(|entry| {
                sample
                    .as_ref()
                    .is_some_and(|s| entry.state.accepts(s, sequence.condition))
                    || entry.state.exceeds(&sequence.limit, now)
            });
            if !needs_update {
                continue;
            }

            if let Some(entry) = state.get_sequence_mut(&sequence.id) {
                match sample {
                    Some(sample) => {
                        entry
                            .state
                            .push(sample, sequence.condition, &sequence.limit, now);
                    }
                    None => entry.state.prune(&sequence.limit, now),
                }
            }
        }
        Ok(())
    }
}
