/// One 32-bit word as read from the device.
pub type Word = u32;

/// A fixed-length packet of words, read atomically per `senddata` reply.
pub type Packet = Vec<Word>;

/// High bit: a run (event) starts at this word.
pub const START_MARKER: Word = 0x8000_0000;
/// Top two bits: the run is a long-form (24-word) event.
pub const LONG_FORM_MARKER: Word = 0xC000_0000;

pub const SHORT_EVENT_WORDS: usize = 8;
pub const LONG_EVENT_WORDS: usize = 24;

pub fn is_marked(word: Word) -> bool {
    word & START_MARKER == START_MARKER
}

pub fn is_long_form(word: Word) -> bool {
    word & LONG_FORM_MARKER == LONG_FORM_MARKER
}

/// An 8-word event with the start marker already cleared from the first word.
///
/// Position `i` holds the value for the labeled stream configured at position `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortEvent {
    pub words: [Word; SHORT_EVENT_WORDS],
}

impl ShortEvent {
    /// Build an event from the raw run. The caller passes the words as read; the
    /// marker bit is stripped here so no stored or published value carries it.
    pub fn from_run(mut words: [Word; SHORT_EVENT_WORDS]) -> Self {
        words[0] &= !START_MARKER;
        Self { words }
    }
}

/// The events decoded from one packet, shared by both consumers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedBatch {
    /// Packet sequence number within the session, starting at 0.
    pub sequence: u64,
    /// Session-wide index of `events[0]`.
    pub first_event_id: u64,
    pub events: Vec<ShortEvent>,
    /// Long-form runs seen while decoding this packet.
    pub long_events: usize,
}

impl DecodedBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
