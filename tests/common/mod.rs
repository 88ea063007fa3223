//! Scripted mock nodes for integration tests.
//!
//! Each [`MockNode`] binds a loopback listener and speaks just enough
//! of the memcached binary protocol to exercise the client: quiet and
//! keyed gets, the store family with CAS semantics, arithmetic with
//! create-if-missing, delete, SASL PLAIN, and TAP streaming.

// Not every test binary uses every helper.
#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use caravel::protocol::{opcode, status, Packet, PacketHeader, PacketParser, RESPONSE_MAGIC};
use caravel::vbucket::VbucketConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One stored item.
#[derive(Debug, Clone)]
pub struct Item {
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas: u64,
}

/// Shared, scripted state of one mock node.
#[derive(Debug, Default)]
pub struct NodeState {
    pub data: HashMap<Vec<u8>, Item>,
    next_cas: u64,
    /// Opcodes of every data request received, in arrival order.
    pub received: Vec<u8>,
}

impl NodeState {
    fn mint_cas(&mut self) -> u64 {
        self.next_cas += 1;
        self.next_cas
    }
}

/// Configuration for a mock node.
#[derive(Debug, Clone, Default)]
pub struct NodeBehavior {
    /// Require SASL PLAIN with these credentials before data traffic
    pub credentials: Option<(String, String)>,
    /// Mutations to stream after a TAP_CONNECT, then close
    pub tap_stream: Vec<(Vec<u8>, Vec<u8>)>,
}

pub struct MockNode {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<NodeState>>,
}

impl MockNode {
    pub async fn start(behavior: NodeBehavior) -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(NodeState::default()));

        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let state = Arc::clone(&shared);
                let behavior = behavior.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, state, behavior).await;
                });
            }
        });

        MockNode { addr, state }
    }

    /// Seed a stored item with an explicit CAS.
    pub fn put(&self, key: &[u8], value: &[u8], cas: u64) {
        let mut state = self.state.lock().unwrap();
        state.data.insert(
            key.to_vec(),
            Item {
                value: value.to_vec(),
                flags: 0,
                cas,
            },
        );
    }

    /// Opcodes received so far.
    pub fn received(&self) -> Vec<u8> {
        self.state.lock().unwrap().received.clone()
    }
}

/// A config whose every vbucket maps to the node at `addrs[vb % n]`.
pub fn config_for(addrs: &[SocketAddr]) -> VbucketConfig {
    let servers = addrs.iter().map(|a| a.to_string()).collect();
    let map = (0..64_usize)
        .map(|vb| vec![(vb % addrs.len()) as i32])
        .collect();
    VbucketConfig::new(servers, map, None).unwrap()
}

async fn serve(
    mut socket: TcpStream,
    state: Arc<Mutex<NodeState>>,
    behavior: NodeBehavior,
) -> std::io::Result<()> {
    let mut parser = PacketParser::new();
    let mut authenticated = behavior.credentials.is_none();
    let mut read_buf = vec![0u8; 8192];

    loop {
        let n = socket.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(());
        }
        parser.extend(&read_buf[..n]);

        let mut reply = BytesMut::new();
        let mut start_tap = false;
        while let Some(packet) = parser.parse().expect("client sent a malformed packet") {
            match packet.header.opcode {
                opcode::SASL_LIST_MECHS => {
                    respond(&mut reply, &packet, status::SUCCESS, &[], b"PLAIN CRAM-MD5", 0);
                }
                opcode::SASL_AUTH => {
                    let ok = match &behavior.credentials {
                        Some((user, pass)) => {
                            let expected = format!("\0{user}\0{pass}");
                            packet.key.as_ref() == b"PLAIN"
                                && packet.value.as_ref() == expected.as_bytes()
                        }
                        None => true,
                    };
                    if ok {
                        authenticated = true;
                        respond(&mut reply, &packet, status::SUCCESS, &[], b"Authenticated", 0);
                    } else {
                        respond(&mut reply, &packet, status::AUTH_ERROR, &[], b"", 0);
                    }
                }
                opcode::TAP_CONNECT => {
                    start_tap = true;
                }
                op => {
                    assert!(authenticated, "data traffic before authentication");
                    state.lock().unwrap().received.push(op);
                    handle_data(&mut reply, &packet, &state);
                }
            }
        }
        if !reply.is_empty() {
            socket.write_all(&reply).await?;
        }
        if start_tap {
            stream_tap(&mut socket, &behavior.tap_stream).await?;
            return Ok(());
        }
    }
}

fn handle_data(reply: &mut BytesMut, packet: &Packet, state: &Arc<Mutex<NodeState>>) {
    let mut state = state.lock().unwrap();
    let key = packet.key.to_vec();
    match packet.header.opcode {
        opcode::GETQ => {
            // Quiet get: a hit responds, a miss stays silent.
            if let Some(item) = state.data.get(&key) {
                let item = item.clone();
                respond(
                    reply,
                    packet,
                    status::SUCCESS,
                    &item.flags.to_be_bytes(),
                    &item.value,
                    item.cas,
                );
            }
        }
        opcode::GETK => match state.data.get(&key) {
            Some(item) => {
                let item = item.clone();
                respond_keyed(
                    reply,
                    packet,
                    status::SUCCESS,
                    &item.flags.to_be_bytes(),
                    &key,
                    &item.value,
                    item.cas,
                );
            }
            None => respond_keyed(reply, packet, status::KEY_ENOENT, &[], &key, b"", 0),
        },
        opcode::SET | opcode::ADD | opcode::REPLACE => {
            let exists = state.data.contains_key(&key);
            let stored_cas = state.data.get(&key).map_or(0, |item| item.cas);
            let st = if packet.header.opcode == opcode::ADD && exists {
                status::KEY_EEXISTS
            } else if packet.header.opcode == opcode::REPLACE && !exists {
                status::KEY_ENOENT
            } else if packet.header.cas != 0 && packet.header.cas != stored_cas {
                status::KEY_EEXISTS
            } else {
                let flags = if packet.extras.len() >= 4 {
                    u32::from_be_bytes(packet.extras[..4].try_into().unwrap())
                } else {
                    0
                };
                let cas = state.mint_cas();
                state.data.insert(
                    key.clone(),
                    Item {
                        value: packet.value.to_vec(),
                        flags,
                        cas,
                    },
                );
                respond(reply, packet, status::SUCCESS, &[], b"", cas);
                return;
            };
            respond(reply, packet, st, &[], b"", 0);
        }
        opcode::APPEND | opcode::PREPEND => match state.data.get(&key).cloned() {
            Some(mut item) => {
                if packet.header.opcode == opcode::APPEND {
                    item.value.extend_from_slice(&packet.value);
                } else {
                    let mut value = packet.value.to_vec();
                    value.extend_from_slice(&item.value);
                    item.value = value;
                }
                item.cas = state.mint_cas();
                let cas = item.cas;
                state.data.insert(key, item);
                respond(reply, packet, status::SUCCESS, &[], b"", cas);
            }
            None => respond(reply, packet, status::NOT_STORED, &[], b"", 0),
        },
        opcode::INCREMENT | opcode::DECREMENT => {
            let delta = u64::from_be_bytes(packet.extras[..8].try_into().unwrap());
            let initial = u64::from_be_bytes(packet.extras[8..16].try_into().unwrap());
            let expiration = u32::from_be_bytes(packet.extras[16..20].try_into().unwrap());
            let current = state.data.get(&key).map(|item| {
                String::from_utf8_lossy(&item.value)
                    .parse::<u64>()
                    .expect("arithmetic on numeric values only in tests")
            });
            let next = match current {
                Some(n) if packet.header.opcode == opcode::INCREMENT => n + delta,
                Some(n) => n.saturating_sub(delta),
                None if expiration == u32::MAX => {
                    respond(reply, packet, status::KEY_ENOENT, &[], b"", 0);
                    return;
                }
                None => initial,
            };
            let cas = state.mint_cas();
            state.data.insert(
                key,
                Item {
                    value: next.to_string().into_bytes(),
                    flags: 0,
                    cas,
                },
            );
            respond(reply, packet, status::SUCCESS, &[], &next.to_be_bytes(), cas);
        }
        opcode::DELETE => {
            let st = if state.data.remove(&key).is_some() {
                status::SUCCESS
            } else {
                status::KEY_ENOENT
            };
            respond(reply, packet, st, &[], b"", 0);
        }
        other => panic!("mock node got unexpected opcode {other:#04x}"),
    }
}

fn respond(buf: &mut BytesMut, request: &Packet, st: u16, extras: &[u8], value: &[u8], cas: u64) {
    respond_keyed(buf, request, st, extras, b"", value, cas);
}

fn respond_keyed(
    buf: &mut BytesMut,
    request: &Packet,
    st: u16,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
    cas: u64,
) {
    let header = PacketHeader {
        magic: RESPONSE_MAGIC,
        opcode: request.header.opcode,
        key_len: key.len() as u16,
        extras_len: extras.len() as u8,
        datatype: 0,
        field: st,
        body_len: (extras.len() + key.len() + value.len()) as u32,
        opaque: request.header.opaque,
        cas,
    };
    header.serialize(buf);
    buf.put_slice(extras);
    buf.put_slice(key);
    buf.put_slice(value);
}

async fn stream_tap(
    socket: &mut TcpStream,
    mutations: &[(Vec<u8>, Vec<u8>)],
) -> std::io::Result<()> {
    for (key, value) in mutations {
        let mut extras = BytesMut::new();
        extras.put_u16(0); // engine private
        extras.put_u16(0); // tap flags
        extras.put_u32(0); // ttl + reserved
        extras.put_u32(0xbeef); // item flags
        extras.put_u32(0); // expiration

        let mut buf = BytesMut::new();
        let header = PacketHeader {
            magic: caravel::protocol::REQUEST_MAGIC,
            opcode: opcode::TAP_MUTATION,
            key_len: key.len() as u16,
            extras_len: extras.len() as u8,
            datatype: 0,
            field: 3, // vbucket
            body_len: (extras.len() + key.len() + value.len()) as u32,
            opaque: 0,
            cas: 1,
        };
        header.serialize(&mut buf);
        buf.put_slice(&extras);
        buf.put_slice(key);
        buf.put_slice(value);
        socket.write_all(&buf).await?;
    }
    socket.flush().await?;
    Ok(())
}
