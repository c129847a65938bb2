use std::fmt::{Display, Formatter};

/// A sequence number in the 31 bit space used on the wire. Valid sequence numbers run from 1 to
///  `i32::MAX` and then wrap around to 1, so they stay positive when sent as a signed 32 bit value
///  and can carry a sign for other purposes (see [SendId]).
///
/// ZERO is never sent. It is the initial value of cursors, i.e. "just before 1", and it compares
///  the same way as `MAX` does.
///
/// Sequence numbers are only ever compared through [SequenceNumber::distance], which is correct
///  as long as the two numbers are less than half the sequence space apart.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SequenceNumber(u32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);
    pub const FIRST: SequenceNumber = SequenceNumber(1);
    pub const MAX: SequenceNumber = SequenceNumber(i32::MAX as u32);

    const MODULUS: i64 = i32::MAX as i64;

    pub fn from_raw(value: u32) -> Option<Self> {
        (value <= Self::MAX.0).then_some(SequenceNumber(value))
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        if self.0 >= Self::MAX.0 {
            Self::FIRST
        }
        else {
            SequenceNumber(self.0 + 1)
        }
    }

    /// The signed number of steps from `other` to `self`: positive if `self` is newer
    pub fn distance(&self, other: SequenceNumber) -> i64 {
        let raw = self.0 as i64 - other.0 as i64;
        if raw > Self::MODULUS / 2 {
            raw - Self::MODULUS
        }
        else if raw < -Self::MODULUS / 2 {
            raw + Self::MODULUS
        }
        else {
            raw
        }
    }

    pub fn is_newer_than(&self, other: SequenceNumber) -> bool {
        self.distance(other) > 0
    }
}

/// Identifies a reliable message per connection. Unordered and ordered reliable messages have
///  separate sequences, and on the wire the class is encoded in the sign: positive for unordered,
///  negative for ordered. Zero is invalid.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum SendId {
    Unordered(SequenceNumber),
    Ordered(SequenceNumber),
}

impl Display for SendId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

impl SendId {
    pub fn to_wire(&self) -> i32 {
        match self {
            SendId::Unordered(seq) => seq.0 as i32,
            SendId::Ordered(seq) => -(seq.0 as i32),
        }
    }

    pub fn from_wire(raw: i32) -> Option<SendId> {
        if raw > 0 {
            Some(SendId::Unordered(SequenceNumber(raw as u32)))
        }
        else {
            raw.checked_neg()
                .filter(|&v| v > 0)
                .map(|v| SendId::Ordered(SequenceNumber(v as u32)))
        }
    }

    pub fn sequence(&self) -> SequenceNumber {
        match self {
            SendId::Unordered(seq) | SendId::Ordered(seq) => *seq,
        }
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, SendId::Ordered(_))
    }

    /// the id of the same class with a different sequence number
    pub fn with_sequence(&self, seq: SequenceNumber) -> SendId {
        match self {
            SendId::Unordered(_) => SendId::Unordered(seq),
            SendId::Ordered(_) => SendId::Ordered(seq),
        }
    }
}
