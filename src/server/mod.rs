//! Per-node connection handling.
//!
//! Each backend node gets one [`ServerConnection`] owning the socket,
//! the outbound buffers, and the log of in-flight requests. A
//! connection walks `Unresolved → Resolving → Connecting →
//! Authenticating → Ready`, with `Closed` terminal; requests framed
//! before `Ready` accumulate in the `pending` buffer and move to the
//! live `output` queue the moment the connection is usable.
//!
//! Connections never call back into the client that owns them. Instead
//! every [`step`](ServerConnection::step) appends ordered
//! [`DispatchEvent`]s to a caller-owned vector, and the client maps
//! those onto user callbacks; per-connection callback order is the
//! enqueue order by construction.

mod log;

pub(crate) use log::{CommandLog, LogEntry};

use crate::error::{ErrorCode, ProtocolError};
use crate::event::{self, FillOutcome};
use crate::protocol::{self, opcode, Packet, PacketParser};
use crate::sasl::SaslConversation;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, trace, warn};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    /// No address list yet
    Unresolved,
    /// DNS lookup in flight
    Resolving,
    /// Walking the candidate address list
    Connecting,
    /// SASL exchange in flight
    Authenticating,
    /// Socket usable for request traffic
    Ready,
    /// Terminal; in-flight requests have been surfaced
    Closed,
}

/// One callback-worth of result, produced in dispatch order.
#[derive(Debug)]
pub(crate) enum DispatchEvent {
    /// Result of a retrieval request
    Get {
        error: ErrorCode,
        key: Bytes,
        value: Bytes,
        flags: u32,
        cas: u64,
    },
    /// Result of a store-family request
    Store {
        error: ErrorCode,
        key: Bytes,
        cas: u64,
    },
    /// Result of an increment/decrement
    Arithmetic {
        error: ErrorCode,
        key: Bytes,
        value: u64,
        cas: u64,
    },
    /// Result of a delete
    Remove { error: ErrorCode, key: Bytes },
    /// One mutation pushed over a TAP stream
    TapMutation {
        key: Bytes,
        value: Bytes,
        flags: u32,
        expiration: u32,
        cas: u64,
        vbucket: u16,
    },
    /// A connection-level failure, for the error callback
    Failure { error: ErrorCode, message: String },
}

/// Why a connection is closing; carried out of the parse path.
struct CloseReason {
    code: ErrorCode,
    message: String,
}

impl CloseReason {
    fn protocol(err: &ProtocolError) -> Self {
        CloseReason {
            code: ErrorCode::ProtocolError,
            message: err.to_string(),
        }
    }
}

/// State for one backend node.
pub(crate) struct ServerConnection {
    host: String,
    port: String,
    state: ConnectionState,
    addrs: Vec<SocketAddr>,
    cursor: usize,
    stream: Option<TcpStream>,
    sasl: Option<SaslConversation>,
    input: PacketParser,
    output: BytesMut,
    pending: BytesMut,
    cmd_log: CommandLog,
    tap: bool,
}

impl ServerConnection {
    /// Create an unconnected record for `authority` (`host[:port]`).
    pub(crate) fn new(authority: &str, credentials: Option<(&str, &str)>) -> Self {
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) if !port.contains(']') => (host.to_owned(), port.to_owned()),
            _ => (authority.to_owned(), crate::DEFAULT_DATA_PORT.to_string()),
        };
        ServerConnection {
            host,
            port,
            state: ConnectionState::Unresolved,
            addrs: Vec::new(),
            cursor: 0,
            stream: None,
            sasl: credentials.map(|(user, pass)| SaslConversation::new(user, pass)),
            input: PacketParser::new(),
            output: BytesMut::with_capacity(4096),
            pending: BytesMut::new(),
            cmd_log: CommandLog::new(),
            tap: false,
        }
    }

    /// `host:port` for diagnostics.
    pub(crate) fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    #[inline]
    pub(crate) fn has_inflight(&self) -> bool {
        !self.cmd_log.is_empty()
    }

    #[inline]
    pub(crate) fn has_unsent(&self) -> bool {
        !self.output.is_empty() || !self.pending.is_empty()
    }

    pub(crate) fn mark_tap(&mut self) {
        self.tap = true;
    }

    /// The buffer new request bytes belong in: the live output queue
    /// once ready, the staging buffer before that. Nothing lands in
    /// `output` while the connection cannot write it out.
    pub(crate) fn write_buffer(&mut self) -> &mut BytesMut {
        if self.state == ConnectionState::Ready {
            &mut self.output
        } else {
            &mut self.pending
        }
    }

    /// Record an in-flight request for response correlation.
    pub(crate) fn log_request(&mut self, entry: LogEntry) {
        self.cmd_log.push(entry);
    }

    /// Whether [`step`](Self::step) can still make progress.
    pub(crate) fn wants_step(&self) -> bool {
        match self.state {
            ConnectionState::Closed => false,
            ConnectionState::Ready => {
                !self.output.is_empty() || !self.cmd_log.is_empty() || self.tap
            }
            _ => true,
        }
    }

    /// Advance the connection by one event-loop turn, appending any
    /// results to `events`. All failures are handled internally by
    /// closing the connection and surfacing synthetic callbacks.
    pub(crate) async fn step(&mut self, events: &mut Vec<DispatchEvent>) {
        match self.state {
            ConnectionState::Unresolved | ConnectionState::Resolving => {
                self.resolve(events).await;
            }
            ConnectionState::Connecting => self.connect_next(events).await,
            ConnectionState::Authenticating | ConnectionState::Ready => {
                self.poll_io(events).await;
            }
            ConnectionState::Closed => {}
        }
    }

    async fn resolve(&mut self, events: &mut Vec<DispatchEvent>) {
        self.state = ConnectionState::Resolving;
        match lookup_host(self.authority()).await {
            Ok(addrs) => {
                self.addrs = addrs.collect();
                if self.addrs.is_empty() {
                    self.close(
                        ErrorCode::NetworkError,
                        &format!("{} resolved to no addresses", self.authority()),
                        events,
                    );
                } else {
                    trace!(
                        authority = %self.authority(),
                        candidates = self.addrs.len(),
                        "resolved node"
                    );
                    self.cursor = 0;
                    self.state = ConnectionState::Connecting;
                }
            }
            Err(e) => self.close(
                ErrorCode::NetworkError,
                &format!("failed to resolve {}: {e}", self.authority()),
                events,
            ),
        }
    }

    /// Try candidate addresses in order, advancing the cursor past each
    /// failure; exhaustion closes the connection.
    async fn connect_next(&mut self, events: &mut Vec<DispatchEvent>) {
        while let Some(&addr) = self.addrs.get(self.cursor) {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!(authority = %self.authority(), %addr, "connected");
                    return self.on_socket_connected(stream);
                }
                Err(e) => {
                    debug!(authority = %self.authority(), %addr, error = %e, "connect failed");
                    self.cursor += 1;
                }
            }
        }
        self.close(
            ErrorCode::NetworkError,
            &format!("no reachable address for {}", self.authority()),
            events,
        );
    }

    fn on_socket_connected(&mut self, stream: TcpStream) {
        self.stream = Some(stream);
        if self.sasl.is_some() {
            self.state = ConnectionState::Authenticating;
            protocol::encode_sasl_list_mechs(&mut self.output, 0);
        } else {
            self.become_ready();
        }
    }

    /// Promote staged bytes onto the wire queue and open for traffic.
    fn become_ready(&mut self) {
        self.state = ConnectionState::Ready;
        if !self.pending.is_empty() {
            let staged = self.pending.split();
            trace!(
                authority = %self.authority(),
                bytes = staged.len(),
                "flushing staged requests"
            );
            self.output.unsplit(staged);
        }
    }

    async fn poll_io(&mut self, events: &mut Vec<DispatchEvent>) {
        let io_result = {
            let Some(stream) = self.stream.as_ref() else {
                return;
            };
            match event::wait(stream, !self.output.is_empty()).await {
                Ok(ready) => Self::io_once(stream, &mut self.output, &mut self.input, ready),
                Err(e) => Err(e),
            }
        };

        match io_result {
            Ok(ReadProgress::Data) => {
                if let Err(reason) = self.parse_loop(events) {
                    self.close(reason.code, &reason.message, events);
                }
            }
            Ok(ReadProgress::None) => {}
            Ok(ReadProgress::Eof) => self.close(
                ErrorCode::NetworkError,
                "connection closed by server",
                events,
            ),
            Err(e) => self.close(
                ErrorCode::NetworkError,
                &format!("I/O failure on {}: {e}", self.authority()),
                events,
            ),
        }
    }

    /// One write drain and one bounded read, both non-blocking.
    fn io_once(
        stream: &TcpStream,
        output: &mut BytesMut,
        input: &mut PacketParser,
        ready: tokio::io::Ready,
    ) -> std::io::Result<ReadProgress> {
        if ready.is_writable() && !output.is_empty() {
            let written = event::drain(stream, output)?;
            if written > 0 {
                trace!(written, remaining = output.len(), "drained output");
            }
        }
        if ready.is_readable() {
            return match event::fill(stream, input)? {
                FillOutcome::Data(n) => {
                    trace!(read = n, buffered = input.len(), "filled input");
                    Ok(ReadProgress::Data)
                }
                FillOutcome::WouldBlock => Ok(ReadProgress::None),
                FillOutcome::Eof => Ok(ReadProgress::Eof),
            };
        }
        Ok(ReadProgress::None)
    }

    /// Lift every complete packet off the input buffer and dispatch it.
    fn parse_loop(&mut self, events: &mut Vec<DispatchEvent>) -> Result<(), CloseReason> {
        loop {
            let packet = match self.input.parse() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => return Err(CloseReason::protocol(&e)),
            };
            if packet.is_server_push() {
                self.dispatch_tap(packet, events);
                continue;
            }
            match packet.header.opcode {
                opcode::SASL_LIST_MECHS | opcode::SASL_AUTH | opcode::SASL_STEP => {
                    self.advance_sasl(&packet)?;
                }
                _ => self
                    .dispatch_response(packet, events)
                    .map_err(|e| CloseReason::protocol(&e))?,
            }
        }
        self.input.maybe_trim();
        Ok(())
    }

    /// Drive the SASL exchange one packet forward.
    fn advance_sasl(&mut self, packet: &Packet) -> Result<(), CloseReason> {
        if self.state != ConnectionState::Authenticating {
            return Err(CloseReason {
                code: ErrorCode::ProtocolError,
                message: "SASL response outside authentication phase".into(),
            });
        }
        let authority = self.authority();
        let conversation = self.sasl.as_mut().ok_or_else(|| CloseReason {
            code: ErrorCode::ProtocolError,
            message: "SASL response without credentials".into(),
        })?;

        match packet.header.opcode {
            opcode::SASL_LIST_MECHS => {
                let offered = String::from_utf8_lossy(&packet.value);
                match conversation.start(&offered) {
                    Ok((mechanism, initial)) => {
                        debug!(%authority, mechanism, "starting SASL");
                        protocol::encode_sasl_auth(
                            &mut self.output,
                            opcode::SASL_AUTH,
                            0,
                            mechanism,
                            &initial,
                        );
                        Ok(())
                    }
                    Err(e) => Err(CloseReason {
                        code: ErrorCode::AuthError,
                        message: e.to_string(),
                    }),
                }
            }
            opcode::SASL_AUTH | opcode::SASL_STEP => match packet.status() {
                protocol::status::SUCCESS => {
                    debug!(%authority, "authenticated");
                    self.become_ready();
                    Ok(())
                }
                protocol::status::AUTH_CONTINUE => match conversation.step(&packet.value) {
                    Ok(response) => {
                        let mechanism = conversation.mechanism_name();
                        protocol::encode_sasl_auth(
                            &mut self.output,
                            opcode::SASL_STEP,
                            0,
                            mechanism,
                            &response,
                        );
                        Ok(())
                    }
                    Err(e) => Err(CloseReason {
                        code: ErrorCode::AuthError,
                        message: e.to_string(),
                    }),
                },
                _ => Err(CloseReason {
                    code: ErrorCode::AuthError,
                    message: format!("credentials rejected by {authority}"),
                }),
            },
            _ => unreachable!("caller filters SASL opcodes"),
        }
    }

    /// Apply the implicit-response purge, then dispatch the real
    /// response the packet carries.
    fn dispatch_response(
        &mut self,
        packet: Packet,
        events: &mut Vec<DispatchEvent>,
    ) -> Result<(), ProtocolError> {
        let (skipped, matched) = self.cmd_log.split_response(packet.header.opaque)?;
        for entry in skipped {
            // A non-quiet command can never be answered implicitly: a
            // server skipping one is lying about the past, and nothing
            // downstream can be trusted.
            assert!(
                protocol::is_quiet(entry.opcode),
                "server skipped non-quiet command {:#04x} (opaque {})",
                entry.opcode,
                entry.opaque,
            );
            events.push(Self::implicit_event(entry));
        }
        events.push(Self::response_event(matched, &packet));
        Ok(())
    }

    /// The synthetic result for a quiet command the server answered by
    /// staying silent: silence means miss for retrievals and success
    /// for everything else.
    fn implicit_event(entry: LogEntry) -> DispatchEvent {
        if protocol::is_quiet_get(entry.opcode) {
            DispatchEvent::Get {
                error: ErrorCode::KeyNotFound,
                key: entry.key,
                value: Bytes::new(),
                flags: 0,
                cas: 0,
            }
        } else {
            Self::family_event(entry, ErrorCode::Success)
        }
    }

    /// An event of the entry's operation family carrying `code` and no
    /// payload.
    fn family_event(entry: LogEntry, code: ErrorCode) -> DispatchEvent {
        match entry.opcode {
            opcode::GET
            | opcode::GETQ
            | opcode::GETK
            | opcode::GETKQ
            | opcode::GAT
            | opcode::GATQ => DispatchEvent::Get {
                error: code,
                key: entry.key,
                value: Bytes::new(),
                flags: 0,
                cas: 0,
            },
            opcode::SET
            | opcode::ADD
            | opcode::REPLACE
            | opcode::APPEND
            | opcode::PREPEND
            | opcode::SETQ
            | opcode::ADDQ
            | opcode::REPLACEQ
            | opcode::APPENDQ
            | opcode::PREPENDQ => DispatchEvent::Store {
                error: code,
                key: entry.key,
                cas: 0,
            },
            opcode::INCREMENT | opcode::DECREMENT | opcode::INCREMENTQ | opcode::DECREMENTQ => {
                DispatchEvent::Arithmetic {
                    error: code,
                    key: entry.key,
                    value: 0,
                    cas: 0,
                }
            }
            opcode::DELETE | opcode::DELETEQ => DispatchEvent::Remove {
                error: code,
                key: entry.key,
            },
            other => DispatchEvent::Failure {
                error: code,
                message: format!("request {other:#04x} cancelled"),
            },
        }
    }

    /// Map an explicit response onto its request's operation family.
    fn response_event(entry: LogEntry, packet: &Packet) -> DispatchEvent {
        let error = ErrorCode::from_status(packet.status());
        if error == ErrorCode::NotMyVbucket {
            debug!(
                vbucket = entry.vbucket,
                "configuration is stale, refetch required"
            );
        }
        match entry.opcode {
            opcode::GET
            | opcode::GETQ
            | opcode::GETK
            | opcode::GETKQ
            | opcode::GAT
            | opcode::GATQ => {
                let flags = if packet.extras.len() >= 4 {
                    u32::from_be_bytes([
                        packet.extras[0],
                        packet.extras[1],
                        packet.extras[2],
                        packet.extras[3],
                    ])
                } else {
                    0
                };
                DispatchEvent::Get {
                    error,
                    key: entry.key,
                    value: packet.value.clone(),
                    flags,
                    cas: packet.header.cas,
                }
            }
            opcode::SET
            | opcode::ADD
            | opcode::REPLACE
            | opcode::APPEND
            | opcode::PREPEND
            | opcode::SETQ
            | opcode::ADDQ
            | opcode::REPLACEQ
            | opcode::APPENDQ
            | opcode::PREPENDQ => DispatchEvent::Store {
                error,
                key: entry.key,
                cas: packet.header.cas,
            },
            opcode::INCREMENT | opcode::DECREMENT | opcode::INCREMENTQ | opcode::DECREMENTQ => {
                let value = if error.is_success() && packet.value.len() >= 8 {
                    u64::from_be_bytes(packet.value[..8].try_into().expect("length checked"))
                } else {
                    0
                };
                DispatchEvent::Arithmetic {
                    error,
                    key: entry.key,
                    value,
                    cas: packet.header.cas,
                }
            }
            opcode::DELETE | opcode::DELETEQ => DispatchEvent::Remove {
                error,
                key: entry.key,
            },
            other => DispatchEvent::Failure {
                error: ErrorCode::ProtocolError,
                message: format!("response for unexpected opcode {other:#04x}"),
            },
        }
    }

    /// Handle a packet the node pushed at us (TAP traffic).
    fn dispatch_tap(&mut self, packet: Packet, events: &mut Vec<DispatchEvent>) {
        match packet.header.opcode {
            opcode::TAP_MUTATION => {
                // TAP extras: engine-private length (u16), tap flags
                // (u16), ttl + reserved (4 bytes), then the item's
                // flags and expiration (u32 each). The engine-private
                // section prefixes the value and is skipped.
                let extras = &packet.extras;
                let engine_len = if extras.len() >= 2 {
                    u16::from_be_bytes([extras[0], extras[1]]) as usize
                } else {
                    0
                };
                let (flags, expiration) = if extras.len() >= 16 {
                    (
                        u32::from_be_bytes([extras[8], extras[9], extras[10], extras[11]]),
                        u32::from_be_bytes([extras[12], extras[13], extras[14], extras[15]]),
                    )
                } else {
                    (0, 0)
                };
                let value = if packet.value.len() >= engine_len {
                    packet.value.slice(engine_len..)
                } else {
                    packet.value.clone()
                };
                events.push(DispatchEvent::TapMutation {
                    key: packet.key,
                    value,
                    flags,
                    expiration,
                    cas: packet.header.cas,
                    vbucket: packet.header.field,
                });
            }
            opcode::TAP_DELETE
            | opcode::TAP_FLUSH
            | opcode::TAP_OPAQUE
            | opcode::TAP_VBUCKET_SET => {
                debug!(
                    authority = %self.authority(),
                    opcode = packet.header.opcode,
                    "ignoring TAP control message"
                );
            }
            other => {
                debug!(
                    authority = %self.authority(),
                    opcode = other,
                    "ignoring unexpected server-side request"
                );
            }
        }
    }

    /// Terminal failure: surface every in-flight request, then the
    /// connection-level error itself.
    fn close(&mut self, code: ErrorCode, message: &str, events: &mut Vec<DispatchEvent>) {
        if self.state == ConnectionState::Closed {
            return;
        }
        warn!(authority = %self.authority(), %code, reason = message, "closing connection");
        self.state = ConnectionState::Closed;
        self.stream = None;
        self.pending.clear();
        self.output.clear();
        self.input.clear();
        for entry in self.cmd_log.drain_all() {
            events.push(Self::family_event(entry, code));
        }
        events.push(DispatchEvent::Failure {
            error: code,
            message: message.to_owned(),
        });
    }

    /// Orderly teardown: cancel every in-flight request with the purge
    /// semantics (silence is a miss for quiet retrievals, success for
    /// other quiet commands) and release the socket. Non-quiet
    /// leftovers report a network-level cancellation.
    pub(crate) fn teardown(&mut self, events: &mut Vec<DispatchEvent>) {
        if self.state == ConnectionState::Closed {
            return;
        }
        debug!(authority = %self.authority(), inflight = self.cmd_log.len(), "tearing down");
        self.state = ConnectionState::Closed;
        self.stream = None;
        self.pending.clear();
        self.output.clear();
        self.input.clear();
        for entry in self.cmd_log.drain_all() {
            if protocol::is_quiet(entry.opcode) {
                events.push(Self::implicit_event(entry));
            } else {
                events.push(Self::family_event(entry, ErrorCode::NetworkError));
            }
        }
    }
}

enum ReadProgress {
    Data,
    None,
    Eof,
}
