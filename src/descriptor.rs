//! Operation descriptor laid out at the start of a shared region
//!
//! ```text
//! offset  field
//!      0  state      (u32, atomic)
//!      4  type       (u32)
//!      8  key_size   (u32)
//!     12  data_size  (u32)
//!     16  payload    key bytes, then data bytes
//! ```
//!
//! `state` is the only synchronized field. The producer publishes `INIT`
//! after filling the payload; the worker publishes `DONE`/`ERROR` with a
//! release store after its last payload write, and the producer must see
//! that value through an acquire load before reading the payload.

use crate::error::{Result, ShareError};
use crate::region::MappedRegion;
use std::sync::atomic::{AtomicU32, Ordering};

/// Size of the fixed header in bytes
pub const HEADER_SIZE: usize = 16;

const STATE_OFFSET: usize = 0;
const TYPE_OFFSET: usize = 4;
const KEY_SIZE_OFFSET: usize = 8;
const DATA_SIZE_OFFSET: usize = 12;

/// Descriptor lifecycle
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpState {
    Init = 0,
    Done = 1,
    Error = 2,
}

impl OpState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(OpState::Init),
            1 => Some(OpState::Done),
            2 => Some(OpState::Error),
            _ => None,
        }
    }
}

/// Operation selector
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpType {
    Encrypt = 1,
    Decrypt = 2,
}

impl OpType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(OpType::Encrypt),
            2 => Some(OpType::Decrypt),
            _ => None,
        }
    }
}

/// Typed access to a descriptor inside a mapped region
pub struct Descriptor<'a> {
    region: &'a MappedRegion,
    state: &'a AtomicU32,
}

impl<'a> Descriptor<'a> {
    /// View the descriptor at the start of `region`
    ///
    /// The region must hold the whole header and start 4-byte aligned.
    pub fn new(region: &'a MappedRegion) -> Result<Self> {
        if region.len() < HEADER_SIZE {
            return Err(ShareError::InvalidRange {
                va: region.va(),
                size: region.len(),
            });
        }
        let state = region.atomic_u32(STATE_OFFSET)?;
        Ok(Self { region, state })
    }

    /// Producer side: fill header and payload, then publish `INIT`
    pub fn init(region: &'a MappedRegion, op_type: u32, key: &[u8], data: &[u8]) -> Result<Self> {
        let desc = Self::new(region)?;
        let needed = HEADER_SIZE + key.len() + data.len();
        if needed > region.len() || key.len() > u32::MAX as usize || data.len() > u32::MAX as usize {
            return Err(ShareError::InvalidRange {
                va: region.va(),
                size: needed,
            });
        }

        region.write_u32(TYPE_OFFSET, op_type)?;
        region.write_u32(KEY_SIZE_OFFSET, key.len() as u32)?;
        region.write_u32(DATA_SIZE_OFFSET, data.len() as u32)?;
        region.write(HEADER_SIZE, key)?;
        region.write(HEADER_SIZE + key.len(), data)?;
        desc.publish(OpState::Init);
        Ok(desc)
    }

    /// Current raw state (acquire)
    #[inline]
    pub fn raw_state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// Current state (acquire); unknown values read as `None`
    #[inline]
    pub fn state(&self) -> Option<OpState> {
        OpState::from_raw(self.raw_state())
    }

    /// Store `state` with release ordering
    #[inline]
    pub fn publish(&self, state: OpState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn op_type(&self) -> Result<u32> {
        self.region.read_u32(TYPE_OFFSET)
    }

    pub fn key_size(&self) -> Result<usize> {
        Ok(self.region.read_u32(KEY_SIZE_OFFSET)? as usize)
    }

    pub fn data_size(&self) -> Result<usize> {
        Ok(self.region.read_u32(DATA_SIZE_OFFSET)? as usize)
    }

    /// Bytes available after the header
    #[inline]
    pub fn payload_capacity(&self) -> usize {
        self.region.len() - HEADER_SIZE
    }

    /// Copy `len` payload bytes starting at payload offset `offset`
    pub fn read_payload(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.region.read_vec(HEADER_SIZE + offset, len)
    }

    /// Overwrite payload bytes starting at payload offset `offset`
    pub fn write_payload(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.region.write(HEADER_SIZE + offset, data)
    }

    /// The data sub-region: `data_size` bytes after the key
    pub fn data(&self) -> Result<Vec<u8>> {
        self.read_payload(self.key_size()?, self.data_size()?)
    }

    pub fn region(&self) -> &MappedRegion {
        self.region
    }
}
