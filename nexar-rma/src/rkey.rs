//! Remote keys: the per-domain key material a peer needs to address memory
//! registered here.
//!
//! Wire layout (little-endian):
//!
//! ```text
//! [md_map: u64][mem_type: u8] { [len: u8][material: len bytes] }*
//! ```
//!
//! One material entry per set bit of `md_map`, in ascending domain order.

use crate::error::{Result, RmaError};
use crate::types::{MAX_MDS, MdIndex, MdMap, MemoryType};

/// Bytes before the first material entry.
pub const RKEY_PREFIX_LEN: usize = 9;

/// Unpacked remote key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteKey {
    md_map: MdMap,
    mem_type: MemoryType,
    /// Dense by `md_map` rank.
    materials: Vec<Vec<u8>>,
}

impl RemoteKey {
    pub fn new(mem_type: MemoryType) -> Self {
        Self {
            md_map: MdMap::EMPTY,
            mem_type,
            materials: Vec::new(),
        }
    }

    pub fn md_map(&self) -> MdMap {
        self.md_map
    }

    pub fn mem_type(&self) -> MemoryType {
        self.mem_type
    }

    /// Add (or replace) the material for `md`.
    pub fn insert(&mut self, md: MdIndex, material: Vec<u8>) -> Result<()> {
        if md as usize >= MAX_MDS {
            return Err(RmaError::InvalidRkey(format!("md {md} out of range")));
        }
        if material.len() > u8::MAX as usize {
            return Err(RmaError::InvalidRkey(format!(
                "md {md} key material is {} bytes, max {}",
                material.len(),
                u8::MAX
            )));
        }
        let slot = self.md_map.rank(md);
        if self.md_map.contains(md) {
            self.materials[slot] = material;
        } else {
            self.materials.insert(slot, material);
            self.md_map.insert(md);
        }
        Ok(())
    }

    pub fn material(&self, md: MdIndex) -> Option<&[u8]> {
        if self.md_map.contains(md) {
            Some(&self.materials[self.md_map.rank(md)])
        } else {
            None
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        let body: usize = self.materials.iter().map(|m| 1 + m.len()).sum();
        let mut buf = Vec::with_capacity(RKEY_PREFIX_LEN + body);
        buf.extend_from_slice(&self.md_map.bits().to_le_bytes());
        buf.push(self.mem_type as u8);
        for m in &self.materials {
            // Length bounded by `insert`.
            buf.push(m.len() as u8);
            buf.extend_from_slice(m);
        }
        buf
    }

    pub fn unpack(buf: &[u8]) -> Result<Self> {
        let md_map = packed_md_map(buf)?;
        let mem_type = packed_mem_type(buf)?;
        let mut materials = Vec::with_capacity(md_map.count());
        let mut pos = RKEY_PREFIX_LEN;
        for md in md_map.iter() {
            let len = *buf
                .get(pos)
                .ok_or_else(|| RmaError::InvalidRkey(format!("missing length for md {md}")))?
                as usize;
            pos += 1;
            let material = buf.get(pos..pos + len).ok_or_else(|| {
                RmaError::InvalidRkey(format!("md {md} material truncated ({len} bytes)"))
            })?;
            materials.push(material.to_vec());
            pos += len;
        }
        if pos != buf.len() {
            return Err(RmaError::InvalidRkey(format!(
                "{} trailing bytes",
                buf.len() - pos
            )));
        }
        Ok(Self {
            md_map,
            mem_type,
            materials,
        })
    }
}

/// Domain bitmap of a packed rkey, without decoding the rest.
pub fn packed_md_map(buf: &[u8]) -> Result<MdMap> {
    let bytes: [u8; 8] = buf
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| RmaError::InvalidRkey(format!("{} bytes is too short", buf.len())))?;
    Ok(MdMap::from_bits(u64::from_le_bytes(bytes)))
}

/// Memory type of a packed rkey, without decoding the rest.
pub fn packed_mem_type(buf: &[u8]) -> Result<MemoryType> {
    let raw = *buf
        .get(8)
        .ok_or_else(|| RmaError::InvalidRkey(format!("{} bytes is too short", buf.len())))?;
    MemoryType::from_u8(raw)
        .ok_or_else(|| RmaError::InvalidRkey(format!("unknown memory type {raw}")))
}

/// Per-endpoint resolution of a remote key: the lane to use and the limits
/// that pick the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RkeyConfig {
    pub lane: usize,
    /// Domain whose material the lane consumes.
    pub rkey_md: MdIndex,
    pub max_put_short: usize,
    pub max_get_short: usize,
    pub put_zcopy_thresh: usize,
    pub get_zcopy_thresh: usize,
}
