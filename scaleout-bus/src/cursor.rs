//! Subscriber resume positions and their text form.
//!
//! A cursor maps every stream a subscription spans to the id of the last
//! batch the subscriber has seen there. The text form is what a transport
//! hands to its client and what the client echoes back on reconnect:
//!
//! ```text
//! s-0,1f|1,0|2,a
//! ^ ^ ^
//! | | id of the last seen batch, lowercase hex
//! | stream index, decimal
//! mode prefix: `s` resumes explicitly, `d` only wants new messages
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{BusError, BusResult, CursorError};
use crate::types::{MessageId, StreamIndex};

const PREFIX_SEPARATOR: char = '-';
const ENTRY_SEPARATOR: char = '|';
const PAIR_SEPARATOR: char = ',';

/// How the positions in a cursor are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CursorMode {
    /// Resume from the exact ids listed; unlisted streams start at 0.
    Explicit,
    /// Ignore retained backlog; ids listed are floors and unlisted streams
    /// start at whatever the stream holds when the subscription is made.
    DefaultOnlyNew,
}

impl CursorMode {
    const fn prefix(self) -> char {
        match self {
            Self::Explicit => 's',
            Self::DefaultOnlyNew => 'd',
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "s" => Some(Self::Explicit),
            "d" => Some(Self::DefaultOnlyNew),
            _ => None,
        }
    }
}

/// A subscriber's position in every stream it spans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    mode: CursorMode,
    entries: BTreeMap<StreamIndex, MessageId>,
}

impl Cursor {
    /// A cursor that resumes each listed stream from the given id.
    pub fn explicit(entries: impl IntoIterator<Item = (StreamIndex, MessageId)>) -> Self {
        Self {
            mode: CursorMode::Explicit,
            entries: entries.into_iter().collect(),
        }
    }

    /// A cursor that only asks for messages published from now on.
    pub fn default_only_new(entries: impl IntoIterator<Item = (StreamIndex, MessageId)>) -> Self {
        Self {
            mode: CursorMode::DefaultOnlyNew,
            entries: entries.into_iter().collect(),
        }
    }

    /// Decodes optional cursor text.
    ///
    /// Absent or empty text is a fresh subscriber that wants the full
    /// retained backlog; anything else must parse.
    pub fn decode(text: Option<&str>) -> Result<Self, CursorError> {
        match text.map(str::trim) {
            None | Some("") => Ok(Self::explicit([])),
            Some(text) => text.parse(),
        }
    }

    /// How the positions are interpreted.
    pub const fn mode(&self) -> CursorMode {
        self.mode
    }

    /// The position recorded for `stream`, if any.
    pub fn position(&self, stream: StreamIndex) -> Option<MessageId> {
        self.entries.get(&stream).copied()
    }

    /// Iterates over `(stream, id)` pairs in stream order.
    pub fn entries(&self) -> impl Iterator<Item = (StreamIndex, MessageId)> + '_ {
        self.entries.iter().map(|(stream, id)| (*stream, *id))
    }

    /// Number of streams the cursor holds a position for.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cursor holds no positions at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Moves the position of `stream` forward to `id`.
    ///
    /// Positions never move backwards; an older id is ignored.
    pub fn advance(&mut self, stream: StreamIndex, id: MessageId) {
        let entry = self.entries.entry(stream).or_insert(id);
        if *entry < id {
            *entry = id;
        }
    }

    /// Validates the cursor against a span of `stream_count` streams and
    /// fills in every missing stream with id 0.
    pub fn expand(mut self, stream_count: usize) -> BusResult<Self> {
        if let Some((&stream, _)) = self
            .entries
            .iter()
            .find(|(stream, _)| stream.into_inner() >= stream_count)
        {
            return Err(BusError::InvalidStream {
                stream,
                stream_count,
            });
        }

        for index in 0..stream_count {
            self.entries
                .entry(StreamIndex::new(index))
                .or_insert_with(MessageId::initial);
        }
        Ok(self)
    }

    /// Turns every floor into an explicit position, given the current max id
    /// of each stream.
    pub(crate) fn resolve_floors(mut self, current_max: impl Fn(StreamIndex) -> MessageId) -> Self {
        if self.mode == CursorMode::DefaultOnlyNew {
            for (stream, id) in &mut self.entries {
                *id = (*id).max(current_max(*stream));
            }
            self.mode = CursorMode::Explicit;
        }
        self
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{PREFIX_SEPARATOR}", self.mode.prefix())?;
        for (n, (stream, id)) in self.entries.iter().enumerate() {
            if n > 0 {
                write!(f, "{ENTRY_SEPARATOR}")?;
            }
            write!(f, "{stream}{PAIR_SEPARATOR}{:x}", id.into_inner())?;
        }
        Ok(())
    }
}

impl FromStr for Cursor {
    type Err = CursorError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (prefix, body) = text
            .split_once(PREFIX_SEPARATOR)
            .ok_or_else(|| CursorError::InvalidPrefix(text.to_owned()))?;
        let mode =
            CursorMode::from_prefix(prefix).ok_or_else(|| CursorError::InvalidPrefix(text.to_owned()))?;

        let mut entries = BTreeMap::new();
        if !body.is_empty() {
            for pair in body.split(ENTRY_SEPARATOR) {
                let (stream, id) = parse_pair(pair)?;
                if entries.insert(stream, id).is_some() {
                    return Err(CursorError::DuplicateStream(stream));
                }
            }
        }

        Ok(Self { mode, entries })
    }
}

fn parse_pair(pair: &str) -> Result<(StreamIndex, MessageId), CursorError> {
    let malformed = || CursorError::MalformedEntry(pair.to_owned());

    let (stream, id) = pair.split_once(PAIR_SEPARATOR).ok_or_else(malformed)?;
    // from_str_radix tolerates a leading '+', the encoder never emits one
    if stream.starts_with('+') || id.starts_with('+') {
        return Err(malformed());
    }
    let stream = stream.parse::<usize>().map_err(|_| malformed())?;
    let id = u64::from_str_radix(id, 16).map_err(|_| malformed())?;

    Ok((StreamIndex::new(stream), MessageId::new(id)))
}
