use crate::{
    is_long_form, is_marked, ShortEvent, Word, LONG_EVENT_WORDS, SHORT_EVENT_WORDS,
};
use log::{debug, trace};

/// Progress through a run that may continue in the next packet.
///
/// Runs are not aligned to packet boundaries, so whatever is unfinished at the end of one
/// packet is carried into the decode of the next. Start every session from
/// `DecodeState::default()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeState {
    /// Between runs: unmarked words are skipped.
    #[default]
    Scanning,
    /// Inside a short run; `filled` words of `words` are already collected.
    Short {
        words: [Word; SHORT_EVENT_WORDS],
        filled: usize,
    },
    /// Inside a long run; `remaining` words still have to be skipped.
    Long { remaining: usize },
}

impl DecodeState {
    pub fn is_mid_run(&self) -> bool {
        !matches!(self, Self::Scanning)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    pub events: Vec<ShortEvent>,
    /// Long-form runs whose header was seen in this packet.
    pub long_events: usize,
}

/// Decode one packet, resuming from `state`.
///
/// Pure: the only state is the value passed in and the value returned, so unrelated
/// packets can be decoded concurrently.
pub fn decode(packet: &[Word], state: DecodeState) -> (Decoded, DecodeState) {
    let mut out = Decoded::default();
    let mut state = state;
    let mut offset = 0;

    while offset < packet.len() {
        match state {
            DecodeState::Scanning => {
                let word = packet[offset];
                if !is_marked(word) {
                    offset += 1;
                    continue;
                }
                if is_long_form(word) {
                    debug!("Long-form event header {word:#010x} at word {offset}");
                    out.long_events += 1;
                    state = DecodeState::Long {
                        remaining: LONG_EVENT_WORDS,
                    };
                } else {
                    state = DecodeState::Short {
                        words: [0; SHORT_EVENT_WORDS],
                        filled: 0,
                    };
                }
            }
            DecodeState::Short {
                mut words,
                mut filled,
            } => {
                let take = (SHORT_EVENT_WORDS - filled).min(packet.len() - offset);
                words[filled..filled + take].copy_from_slice(&packet[offset..offset + take]);
                filled += take;
                offset += take;
                if filled == SHORT_EVENT_WORDS {
                    out.events.push(ShortEvent::from_run(words));
                    state = DecodeState::Scanning;
                } else {
                    state = DecodeState::Short { words, filled };
                }
            }
            DecodeState::Long { remaining } => {
                let skip = remaining.min(packet.len() - offset);
                offset += skip;
                state = if skip == remaining {
                    DecodeState::Scanning
                } else {
                    DecodeState::Long {
                        remaining: remaining - skip,
                    }
                };
            }
        }
    }

    if state.is_mid_run() {
        trace!("Run continues past packet end: {state:?}");
    }
    (out, state)
}
