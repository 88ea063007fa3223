//! VBucket resolution: mapping keys to the node that owns them.
//!
//! Every key hashes deterministically to one vbucket, and the installed
//! configuration names exactly one master node per vbucket. The
//! configuration is an immutable snapshot: topology changes install a
//! replacement, never mutate in place.

mod map;

pub(crate) use map::parse_document;

use crate::error::ConfigError;
use zeroize::Zeroizing;

/// VBucket id type (the wire carries it as u16).
pub type VbucketId = u16;

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                0xedb8_8320 ^ (crc >> 1)
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const CRC32_TABLE: [u32; 256] = crc32_table();

/// CRC32 (IEEE, reflected) over `data`.
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = u32::MAX;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xff) as usize;
        crc = CRC32_TABLE[index] ^ (crc >> 8);
    }
    !crc
}

/// One immutable vbucket configuration snapshot.
///
/// Maps every vbucket id to a master server index plus zero or more
/// replica indices, and optionally scopes SASL credentials to the
/// configuration (the bucket name doubles as the username).
#[derive(Debug, Clone)]
pub struct VbucketConfig {
    servers: Vec<String>,
    map: Vec<Vec<i32>>,
    mask: u16,
    username: Option<String>,
    password: Option<Zeroizing<String>>,
}

impl VbucketConfig {
    /// Build a configuration from a server list and a vbucket table.
    ///
    /// Each `map` row is `[master, replica...]`; `-1` marks an
    /// unassigned slot. The row count must be a nonzero power of two so
    /// the hash can be masked instead of divided.
    pub fn new(
        servers: Vec<String>,
        map: Vec<Vec<i32>>,
        credentials: Option<(String, String)>,
    ) -> Result<Self, ConfigError> {
        if servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        let count = map.len();
        if count == 0 || !count.is_power_of_two() || count > usize::from(u16::MAX) + 1 {
            return Err(ConfigError::BadVbucketCount(count));
        }
        for (vbucket, row) in map.iter().enumerate() {
            for &index in row {
                if index >= 0 && index as usize >= servers.len() {
                    return Err(ConfigError::BadServerIndex {
                        vbucket: vbucket as u16,
                        index,
                        len: servers.len(),
                    });
                }
            }
        }
        let (username, password) = match credentials {
            Some((user, pass)) => (Some(user), Some(Zeroizing::new(pass))),
            None => (None, None),
        };
        Ok(VbucketConfig {
            servers,
            map,
            mask: (count - 1) as u16,
            username,
            password,
        })
    }

    /// Parse one bucket-streaming JSON document into a configuration.
    pub fn from_json(doc: &[u8]) -> Result<Self, ConfigError> {
        parse_document(doc)
    }

    /// Total number of vbuckets.
    #[inline]
    pub fn num_vbuckets(&self) -> usize {
        self.map.len()
    }

    /// Number of nodes in the server list.
    #[inline]
    pub fn num_servers(&self) -> usize {
        self.servers.len()
    }

    /// `host:port` authority of the node at `index`.
    #[inline]
    pub fn server(&self, index: usize) -> &str {
        &self.servers[index]
    }

    /// Configuration-scoped SASL credentials, if any.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    /// The vbucket a key hashes to.
    #[inline]
    pub fn vbucket(&self, key: &[u8]) -> VbucketId {
        (crc32(key) & u32::from(self.mask)) as u16
    }

    /// Master server index for a vbucket.
    pub fn master(&self, vbucket: VbucketId) -> Result<usize, ConfigError> {
        match self.map[vbucket as usize].first() {
            Some(&index) if index >= 0 => Ok(index as usize),
            _ => Err(ConfigError::NoMaster(vbucket)),
        }
    }

    /// Resolve a key to `(vbucket id, master server index)`.
    ///
    /// When `hashkey` is supplied it is hashed instead of `key`, letting
    /// callers co-locate related items in one vbucket.
    pub fn resolve(
        &self,
        key: &[u8],
        hashkey: Option<&[u8]>,
    ) -> Result<(VbucketId, usize), ConfigError> {
        let vbucket = self.vbucket(hashkey.unwrap_or(key));
        let master = self.master(vbucket)?;
        Ok((vbucket, master))
    }
}
