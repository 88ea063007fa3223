//! The per-connection command log.
//!
//! One record per in-flight request, in the order the requests were
//! framed, with strictly increasing opaques. Responses consume from the
//! front; the gap between the front and the entry a response names is
//! exactly the set of quiet commands the server answered implicitly.

use crate::error::ProtocolError;
use bytes::Bytes;
use std::collections::VecDeque;

/// One in-flight request: enough of the original packet to synthesise a
/// callback if the server never answers it explicitly.
#[derive(Debug, Clone)]
pub(crate) struct LogEntry {
    /// Widened sequence number; the wire carries the low 32 bits
    pub opaque: u64,
    /// Request opcode
    pub opcode: u8,
    /// VBucket the request was routed to
    pub vbucket: u16,
    /// Key bytes, for callback delivery
    pub key: Bytes,
}

/// Ordered set of in-flight requests on one connection.
#[derive(Debug, Default)]
pub(crate) struct CommandLog {
    entries: VecDeque<LogEntry>,
}

impl CommandLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a record. Opaques must arrive strictly increasing.
    pub(crate) fn push(&mut self, entry: LogEntry) {
        debug_assert!(
            self.entries.back().map_or(true, |e| e.opaque < entry.opaque),
            "command log opaques must be strictly increasing"
        );
        self.entries.push_back(entry);
    }

    /// Locate the entry a response names and split the log around it.
    ///
    /// Returns the entries the server skipped (the implicit-response
    /// gap, possibly empty) and the matched entry itself, removing all
    /// of them from the log.
    pub(crate) fn split_response(
        &mut self,
        wire_opaque: u32,
    ) -> Result<(Vec<LogEntry>, LogEntry), ProtocolError> {
        let position = self
            .entries
            .iter()
            .position(|e| e.opaque as u32 == wire_opaque)
            .ok_or(ProtocolError::UnknownOpaque(wire_opaque))?;
        let skipped = self.entries.drain(..position).collect();
        let matched = self.entries.pop_front().expect("position was in range");
        Ok((skipped, matched))
    }

    /// Remove and return every record, front to back.
    pub(crate) fn drain_all(&mut self) -> Vec<LogEntry> {
        self.entries.drain(..).collect()
    }
}
