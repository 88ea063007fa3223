//! The client instance: the user-facing handle.
//!
//! A [`Client`] owns the installed vbucket configuration, one
//! [`ServerConnection`] per node, the monotonic sequence counter that
//! mints opaques, and the callback table. Operations are non-blocking
//! appenders: they resolve the destination node, frame the packet into
//! that node's buffer, and return; all I/O progress happens inside
//! [`execute`](Client::execute).
//!
//! Callbacks receive `&mut Client` and may enqueue further operations;
//! they cannot tear the client down, because [`destroy`](Client::destroy)
//! takes it by value.

use crate::bootstrap;
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::{self, opcode, tap_flag, StoreOperation};
use crate::server::{DispatchEvent, LogEntry, ServerConnection};
use crate::vbucket::VbucketConfig;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Arithmetic expiration sentinel: do not create a missing counter.
const NO_CREATE: u32 = 0xffff_ffff;

/// Retrieval result callback: `(client, error, key, value, flags, cas)`.
pub type GetCallback = Box<dyn FnMut(&mut Client, ErrorCode, &[u8], &[u8], u32, u64)>;
/// Store result callback: `(client, error, key, cas)`.
pub type StoreCallback = Box<dyn FnMut(&mut Client, ErrorCode, &[u8], u64)>;
/// Arithmetic result callback: `(client, error, key, value, cas)`.
pub type ArithmeticCallback = Box<dyn FnMut(&mut Client, ErrorCode, &[u8], u64, u64)>;
/// Remove result callback: `(client, error, key)`.
pub type RemoveCallback = Box<dyn FnMut(&mut Client, ErrorCode, &[u8])>;
/// TAP mutation callback:
/// `(client, key, value, flags, expiration, cas, vbucket)`.
pub type TapMutationCallback = Box<dyn FnMut(&mut Client, &[u8], &[u8], u32, u32, u64, u16)>;
/// Connection-level error callback: `(client, error, message)`.
pub type ErrorCallback = Box<dyn FnMut(&mut Client, ErrorCode, &str)>;

/// Outgoing-packet predicate; returning `false` drops the packet (and
/// its callback) silently.
pub type PacketFilter = Box<dyn FnMut(&[u8]) -> bool>;

/// The callback table. Every slot has a no-op default, so a partially
/// populated table is safe; the default error callback logs a warning.
pub struct Callbacks {
    /// Fired once per retrieval request
    pub get: GetCallback,
    /// Fired once per store request
    pub store: StoreCallback,
    /// Fired once per arithmetic request
    pub arithmetic: ArithmeticCallback,
    /// Fired once per remove request
    pub remove: RemoveCallback,
    /// Fired per mutation pushed over a TAP stream
    pub tap_mutation: TapMutationCallback,
    /// Fired on connection-level failures
    pub error: ErrorCallback,
}

impl Default for Callbacks {
    fn default() -> Self {
        Callbacks {
            get: Box::new(|_, _, _, _, _, _| {}),
            store: Box::new(|_, _, _, _| {}),
            arithmetic: Box::new(|_, _, _, _, _| {}),
            remove: Box::new(|_, _, _| {}),
            tap_mutation: Box::new(|_, _, _, _, _, _, _| {}),
            error: Box::new(|_, error, message| {
                warn!(%error, "cluster error: {message}");
            }),
        }
    }
}

/// What a TAP stream should carry.
#[derive(Debug, Clone, Default)]
pub struct TapFilter {
    /// Replay stored mutations from this timestamp onward (0 replays
    /// everything)
    pub backfill: Option<u64>,
    /// Stream the current dataset, then let the server disconnect
    pub dump: bool,
    /// Restrict the stream to these vbuckets; empty means all
    pub vbuckets: Vec<u16>,
}

impl TapFilter {
    /// Wire representation: the flags word plus the filter blob that
    /// rides in the TAP_CONNECT value.
    fn encode(&self) -> (u32, Vec<u8>) {
        let mut flags = 0;
        let mut blob = Vec::new();
        if let Some(timestamp) = self.backfill {
            flags |= tap_flag::BACKFILL;
            blob.extend_from_slice(&timestamp.to_be_bytes());
        }
        if self.dump {
            flags |= tap_flag::DUMP;
        }
        if !self.vbuckets.is_empty() {
            flags |= tap_flag::LIST_VBUCKETS;
            blob.extend_from_slice(&(self.vbuckets.len() as u16).to_be_bytes());
            for vbucket in &self.vbuckets {
                blob.extend_from_slice(&vbucket.to_be_bytes());
            }
        }
        (flags, blob)
    }
}

/// A handle to one bucket on one cluster.
pub struct Client {
    bootstrap_host: String,
    bucket: String,
    username: Option<String>,
    password: Option<String>,
    config: Option<Arc<VbucketConfig>>,
    servers: Vec<ServerConnection>,
    seqno: u64,
    cookie: Option<Box<dyn Any>>,
    callbacks: Rc<RefCell<Callbacks>>,
    packet_filter: Option<PacketFilter>,
}

impl Client {
    /// Create an unconnected client. No I/O happens until
    /// [`connect`](Self::connect).
    pub fn new(
        host: impl Into<String>,
        username: Option<&str>,
        password: Option<&str>,
        bucket: impl Into<String>,
    ) -> Client {
        Client {
            bootstrap_host: host.into(),
            bucket: bucket.into(),
            username: username.map(str::to_owned),
            password: password.map(str::to_owned),
            config: None,
            servers: Vec::new(),
            seqno: 0,
            cookie: None,
            callbacks: Rc::new(RefCell::new(Callbacks::default())),
            packet_filter: None,
        }
    }

    /// Fetch the configuration from the bootstrap host and start
    /// connecting to every node it names.
    pub async fn connect(&mut self) -> Result<()> {
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            (Some(user), None) => Some((user.as_str(), "")),
            _ => None,
        };
        let config = bootstrap::fetch_config(&self.bootstrap_host, &self.bucket, auth).await?;
        self.install_config(config);
        Ok(())
    }

    /// Install a configuration snapshot, replacing the server set.
    ///
    /// Existing connections are torn down first, which cancels their
    /// in-flight requests through the usual synthetic callbacks; the
    /// replacement is atomic from the perspective of an event-loop
    /// turn. Must not be called from inside a callback.
    pub fn install_config(&mut self, config: VbucketConfig) {
        let mut events = Vec::new();
        for server in &mut self.servers {
            server.teardown(&mut events);
        }
        self.dispatch(events);

        let config = Arc::new(config);
        let credentials = self.effective_credentials(&config);
        let credentials = credentials
            .as_ref()
            .map(|(user, pass)| (user.as_str(), pass.as_str()));
        self.servers = (0..config.num_servers())
            .map(|index| ServerConnection::new(config.server(index), credentials))
            .collect();
        debug!(
            servers = self.servers.len(),
            vbuckets = config.num_vbuckets(),
            "installed configuration"
        );
        self.config = Some(config);
    }

    /// Credentials for node authentication: explicit ones from
    /// [`new`](Self::new) win; otherwise the configuration-scoped SASL
    /// credentials apply.
    fn effective_credentials(&self, config: &VbucketConfig) -> Option<(String, String)> {
        if let Some(user) = &self.username {
            let pass = self.password.clone().unwrap_or_default();
            return Some((user.clone(), pass));
        }
        config
            .credentials()
            .map(|(user, pass)| (user.to_owned(), pass.to_owned()))
    }

    /// The installed configuration, if any.
    pub fn vbucket_config(&self) -> Option<&VbucketConfig> {
        self.config.as_deref()
    }

    /// Associate an arbitrary user value, retrievable from callbacks.
    pub fn set_cookie(&mut self, cookie: Box<dyn Any>) {
        self.cookie = Some(cookie);
    }

    /// The associated user value.
    pub fn cookie(&self) -> Option<&dyn Any> {
        self.cookie.as_deref()
    }

    /// Mutable access to the associated user value.
    pub fn cookie_mut(&mut self) -> Option<&mut dyn Any> {
        self.cookie.as_deref_mut()
    }

    /// Replace the callback table.
    pub fn set_callbacks(&mut self, callbacks: Callbacks) {
        self.callbacks = Rc::new(RefCell::new(callbacks));
    }

    /// Install a predicate over outgoing packets. A packet the filter
    /// rejects is dropped silently: no bytes leave, and no callback
    /// ever fires for it.
    pub fn set_packet_filter(&mut self, filter: impl FnMut(&[u8]) -> bool + 'static) {
        self.packet_filter = Some(Box::new(filter));
    }

    fn next_opaque(&mut self) -> u64 {
        self.seqno += 1;
        self.seqno
    }

    fn installed(&self) -> Result<Arc<VbucketConfig>> {
        self.config
            .clone()
            .ok_or_else(|| Error::Network("no vbucket configuration installed".into()))
    }

    /// Frame one request into the destination server's buffer and log
    /// it for response correlation.
    fn enqueue(
        &mut self,
        server_index: usize,
        op: u8,
        vbucket: u16,
        key: &[u8],
        encode: impl FnOnce(&mut BytesMut, u32),
    ) -> Result<()> {
        let opaque = self.next_opaque();
        let mut packet = BytesMut::with_capacity(protocol::HEADER_LEN + key.len());
        encode(&mut packet, opaque as u32);

        if let Some(filter) = &mut self.packet_filter {
            if !filter(&packet) {
                trace!(opcode = op, "packet dropped by filter");
                return Ok(());
            }
        }

        let server = &mut self.servers[server_index];
        if server.is_closed() {
            return Err(Error::Network(format!(
                "server {} is closed",
                server.authority()
            )));
        }
        server.write_buffer().unsplit(packet);
        server.log_request(LogEntry {
            opaque,
            opcode: op,
            vbucket,
            key: Bytes::copy_from_slice(key),
        });
        trace!(opaque, opcode = op, vbucket, server = server_index, "queued request");
        Ok(())
    }

    /// Enqueue retrieval requests for `keys`. Per destination server,
    /// every key but the last travels as GETQ and the last as GETK, so
    /// each node's quiet batch carries its own terminator.
    pub fn mget(&mut self, keys: &[&[u8]]) -> Result<()> {
        self.mget_by_key(None, keys)
    }

    /// [`mget`](Self::mget) with an explicit hash key for co-location.
    pub fn mget_by_key(&mut self, hashkey: Option<&[u8]>, keys: &[&[u8]]) -> Result<()> {
        let config = self.installed()?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut batches: Vec<Vec<(u16, &[u8])>> = vec![Vec::new(); config.num_servers()];
        for &key in keys {
            let (vbucket, master) = config.resolve(key, hashkey)?;
            batches[master].push((vbucket, key));
        }
        for (index, batch) in batches.into_iter().enumerate() {
            let Some(last) = batch.len().checked_sub(1) else {
                continue;
            };
            for (i, (vbucket, key)) in batch.into_iter().enumerate() {
                let op = if i == last {
                    opcode::GETK
                } else {
                    opcode::GETQ
                };
                self.enqueue(index, op, vbucket, key, |buf, opaque| {
                    protocol::encode_get(buf, op, vbucket, opaque, key);
                })?;
            }
        }
        Ok(())
    }

    /// Enqueue one store-family request.
    pub fn store(
        &mut self,
        operation: StoreOperation,
        key: &[u8],
        value: &[u8],
        flags: u32,
        expiration: u32,
        cas: u64,
    ) -> Result<()> {
        self.store_by_key(operation, None, key, value, flags, expiration, cas)
    }

    /// [`store`](Self::store) with an explicit hash key.
    #[allow(clippy::too_many_arguments)]
    pub fn store_by_key(
        &mut self,
        operation: StoreOperation,
        hashkey: Option<&[u8]>,
        key: &[u8],
        value: &[u8],
        flags: u32,
        expiration: u32,
        cas: u64,
    ) -> Result<()> {
        let config = self.installed()?;
        let (vbucket, master) = config.resolve(key, hashkey)?;
        self.enqueue(master, operation.opcode(), vbucket, key, |buf, opaque| {
            protocol::encode_store(
                buf, operation, vbucket, opaque, key, value, flags, expiration, cas,
            );
        })
    }

    /// Enqueue one increment/decrement. A negative `delta` selects
    /// DECREMENT with the magnitude. With `create` set a missing
    /// counter is created holding `initial`; otherwise the operation
    /// misses.
    pub fn arithmetic(
        &mut self,
        key: &[u8],
        delta: i64,
        expiration: u32,
        create: bool,
        initial: u64,
    ) -> Result<()> {
        self.arithmetic_by_key(None, key, delta, expiration, create, initial)
    }

    /// [`arithmetic`](Self::arithmetic) with an explicit hash key.
    pub fn arithmetic_by_key(
        &mut self,
        hashkey: Option<&[u8]>,
        key: &[u8],
        delta: i64,
        expiration: u32,
        create: bool,
        initial: u64,
    ) -> Result<()> {
        let config = self.installed()?;
        let (vbucket, master) = config.resolve(key, hashkey)?;
        let op = if delta < 0 {
            opcode::DECREMENT
        } else {
            opcode::INCREMENT
        };
        let expiration = if create { expiration } else { NO_CREATE };
        self.enqueue(master, op, vbucket, key, |buf, opaque| {
            protocol::encode_arithmetic(
                buf,
                op,
                vbucket,
                opaque,
                key,
                delta.unsigned_abs(),
                initial,
                expiration,
            );
        })
    }

    /// Enqueue one delete. A nonzero `cas` restricts the delete to
    /// that exact version.
    pub fn remove(&mut self, key: &[u8], cas: u64) -> Result<()> {
        self.remove_by_key(None, key, cas)
    }

    /// [`remove`](Self::remove) with an explicit hash key.
    pub fn remove_by_key(&mut self, hashkey: Option<&[u8]>, key: &[u8], cas: u64) -> Result<()> {
        let config = self.installed()?;
        let (vbucket, master) = config.resolve(key, hashkey)?;
        self.enqueue(master, opcode::DELETE, vbucket, key, |buf, opaque| {
            protocol::encode_remove(buf, vbucket, opaque, key, cas);
        })
    }

    /// Open a TAP stream to every node. With `block` set, drives the
    /// event loop until every stream has closed; otherwise the streams
    /// deliver mutations during later [`execute`](Self::execute) calls.
    pub async fn tap_cluster(&mut self, filter: TapFilter, block: bool) -> Result<()> {
        self.installed()?;
        let (flags, blob) = filter.encode();
        for index in 0..self.servers.len() {
            let opaque = self.next_opaque() as u32;
            let server = &mut self.servers[index];
            if server.is_closed() {
                continue;
            }
            // TAP_CONNECT expects no response packet, so it bypasses
            // the command log; the stream itself is the reply.
            protocol::encode_tap_connect(server.write_buffer(), opaque, flags, &blob);
            server.mark_tap();
        }
        if block {
            self.run(|client| client.servers.iter().all(ServerConnection::is_closed))
                .await?;
        }
        Ok(())
    }

    /// Drive all connections until every in-flight request has been
    /// answered and nothing remains buffered. Callbacks fire from
    /// inside this call, in per-server enqueue order.
    pub async fn execute(&mut self) -> Result<()> {
        self.run(|client| !client.has_pending_work()).await
    }

    fn has_pending_work(&self) -> bool {
        self.servers
            .iter()
            .any(|server| server.has_inflight() || (!server.is_closed() && server.has_unsent()))
    }

    /// The event loop: race one step per connection with work, then
    /// dispatch whatever that step produced.
    async fn run(&mut self, done: impl Fn(&Client) -> bool) -> Result<()> {
        loop {
            if done(self) {
                return Ok(());
            }
            let events = {
                let mut steps: FuturesUnordered<_> = self
                    .servers
                    .iter_mut()
                    .filter(|server| server.wants_step())
                    .map(|server| async move {
                        let mut events = Vec::new();
                        server.step(&mut events).await;
                        events
                    })
                    .collect();
                match steps.next().await {
                    Some(events) => events,
                    // Nothing can make progress anymore.
                    None => return Ok(()),
                }
            };
            self.dispatch(events);
        }
    }

    /// Map dispatch events onto user callbacks, preserving order.
    fn dispatch(&mut self, events: Vec<DispatchEvent>) {
        if events.is_empty() {
            return;
        }
        let callbacks = Rc::clone(&self.callbacks);
        let mut callbacks = callbacks.borrow_mut();
        for event in events {
            match event {
                DispatchEvent::Get {
                    error,
                    key,
                    value,
                    flags,
                    cas,
                } => (callbacks.get)(self, error, &key, &value, flags, cas),
                DispatchEvent::Store { error, key, cas } => {
                    (callbacks.store)(self, error, &key, cas);
                }
                DispatchEvent::Arithmetic {
                    error,
                    key,
                    value,
                    cas,
                } => (callbacks.arithmetic)(self, error, &key, value, cas),
                DispatchEvent::Remove { error, key } => (callbacks.remove)(self, error, &key),
                DispatchEvent::TapMutation {
                    key,
                    value,
                    flags,
                    expiration,
                    cas,
                    vbucket,
                } => (callbacks.tap_mutation)(self, &key, &value, flags, expiration, cas, vbucket),
                DispatchEvent::Failure { error, message } => {
                    (callbacks.error)(self, error, &message);
                }
            }
        }
    }

    /// Tear everything down. Every in-flight request receives its
    /// cancellation callback (quiet retrievals miss, other quiet
    /// commands succeed silently, the rest report a network error)
    /// before this returns.
    pub fn destroy(mut self) {
        let mut events = Vec::new();
        for server in &mut self.servers {
            server.teardown(&mut events);
        }
        self.dispatch(events);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("bootstrap_host", &self.bootstrap_host)
            .field("bucket", &self.bucket)
            .field("servers", &self.servers.len())
            .field("seqno", &self.seqno)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(servers: usize) -> VbucketConfig {
        let list = (0..servers).map(|i| format!("node{i}:11210")).collect();
        let map = (0..64).map(|i| vec![(i % servers) as i32]).collect();
        VbucketConfig::new(list, map, None).unwrap()
    }

    fn configured_client(servers: usize) -> Client {
        let mut client = Client::new("localhost", None, None, "default");
        client.install_config(test_config(servers));
        client
    }

    #[test]
    fn operations_require_a_configuration() {
        let mut client = Client::new("localhost", None, None, "default");
        assert!(matches!(client.mget(&[b"a"]), Err(Error::Network(_))));
        assert!(matches!(
            client.store(StoreOperation::Set, b"k", b"v", 0, 0, 0),
            Err(Error::Network(_))
        ));
        assert!(matches!(client.remove(b"k", 0), Err(Error::Network(_))));
    }

    #[test]
    fn cookie_roundtrip() {
        let mut client = configured_client(1);
        client.set_cookie(Box::new(42u32));
        assert_eq!(client.cookie().and_then(|c| c.downcast_ref()), Some(&42u32));
        *client
            .cookie_mut()
            .and_then(|c| c.downcast_mut::<u32>())
            .unwrap() = 7;
        assert_eq!(client.cookie().and_then(|c| c.downcast_ref()), Some(&7u32));
    }

    #[tokio::test]
    async fn execute_with_nothing_queued_returns_immediately() {
        let mut client = configured_client(2);
        client.execute().await.unwrap();
    }

    #[test]
    fn rejected_packets_leave_no_trace() {
        let mut client = configured_client(1);
        client.set_packet_filter(|_| false);
        client.store(StoreOperation::Set, b"k", b"v", 0, 0, 0).unwrap();
        client.mget(&[b"a", b"b"]).unwrap();
        assert!(!client.has_pending_work());
    }

    #[test]
    fn packet_filter_sees_the_framed_packet() {
        let mut client = configured_client(1);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        client.set_packet_filter(move |packet| {
            log.borrow_mut().push(packet.to_vec());
            true
        });
        client.remove(b"gone", 0).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0], protocol::REQUEST_MAGIC);
        assert_eq!(seen[0][1], opcode::DELETE);
        assert!(client.has_pending_work());
    }

    #[test]
    fn destroy_fires_synthetic_misses_for_staged_quiet_gets() {
        let mut client = configured_client(1);
        let keys: Vec<Vec<u8>> = (0..100).map(|i| format!("key{i}").into_bytes()).collect();
        let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        client.mget(&refs).unwrap();

        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&outcomes);
        client.set_callbacks(Callbacks {
            get: Box::new(move |_, error, _, _, _, _| {
                log.borrow_mut().push(error);
            }),
            ..Default::default()
        });
        client.destroy();

        // Quiet gets are cancelled as misses; the GETK terminator is a
        // non-quiet command and reports the cancellation itself.
        let outcomes = outcomes.borrow();
        assert_eq!(outcomes.len(), 100);
        assert!(outcomes[..99]
            .iter()
            .all(|&error| error == ErrorCode::KeyNotFound));
        assert_eq!(outcomes[99], ErrorCode::NetworkError);
    }

    #[test]
    fn tap_filter_encoding() {
        let filter = TapFilter {
            backfill: Some(0),
            dump: false,
            vbuckets: vec![1, 513],
        };
        let (flags, blob) = filter.encode();
        assert_eq!(flags, tap_flag::BACKFILL | tap_flag::LIST_VBUCKETS);
        assert_eq!(&blob[..8], &[0; 8]);
        assert_eq!(&blob[8..10], &2u16.to_be_bytes());
        assert_eq!(&blob[10..12], &1u16.to_be_bytes());
        assert_eq!(&blob[12..14], &513u16.to_be_bytes());
    }

    #[test]
    fn mget_terminates_each_server_batch() {
        let mut client = configured_client(2);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        client.set_packet_filter(move |packet| {
            log.borrow_mut().push(packet[1]);
            true
        });
        let keys: Vec<Vec<u8>> = (0..10).map(|i| format!("key{i}").into_bytes()).collect();
        let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        client.mget(&refs).unwrap();

        let seen = seen.borrow();
        // Exactly one GETK terminator per server that received keys.
        let terminators = seen.iter().filter(|&&op| op == opcode::GETK).count();
        let quiet = seen.iter().filter(|&&op| op == opcode::GETQ).count();
        assert!(terminators >= 1 && terminators <= 2);
        assert_eq!(terminators + quiet, 10);
    }
}
