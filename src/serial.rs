//! Serial allocation: 144-bit random serials prefixed with an
//! instance-configured byte (§3, §4.1).

use rand::RngCore;

use crate::error::{CaError, CaResult};

pub const SERIAL_LEN: usize = 18;

/// An 18-byte serial: byte 0 is the instance prefix, the rest is uniform
/// random. Stringifies as 36 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Serial(pub [u8; SERIAL_LEN]);

impl Serial {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> CaResult<Self> {
        if s.len() != SERIAL_LEN * 2 {
            return Err(CaError::Malformed(format!(
                "serial must be {} hex chars, got {}",
                SERIAL_LEN * 2,
                s.len()
            )));
        }
        let bytes = hex::decode(s).map_err(|e| CaError::Malformed(format!("bad serial hex: {e}")))?;
        let mut arr = [0u8; SERIAL_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn prefix(&self) -> u8 {
        self.0[0]
    }

    pub fn as_bytes(&self) -> &[u8; SERIAL_LEN] {
        &self.0
    }
}

impl std::fmt::Display for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Draws serials from a cryptographically strong RNG. Stateless between
/// calls.
#[derive(Debug, Clone, Copy)]
pub struct SerialAllocator {
    prefix: u8,
}

impl SerialAllocator {
    pub fn new(prefix: u8) -> CaResult<Self> {
        if prefix == 0 {
            return Err(CaError::internal("serial prefix must be in 1..=255"));
        }
        Ok(Self { prefix })
    }

    pub fn allocate(&self) -> CaResult<Serial> {
        let mut bytes = [0u8; SERIAL_LEN];
        bytes[0] = self.prefix;
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes[1..])
            .map_err(|e| CaError::internal(format!("RNG failure allocating serial: {e}")))?;
        Ok(Serial(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_serial_has_configured_prefix_and_length() {
        let allocator = SerialAllocator::new(7).unwrap();
        let serial = allocator.allocate().unwrap();
        assert_eq!(serial.0.len(), SERIAL_LEN);
        assert_eq!(serial.prefix(), 7);
    }

    #[test]
    fn hex_round_trips() {
        let allocator = SerialAllocator::new(3).unwrap();
        let serial = allocator.allocate().unwrap();
        let hex = serial.to_hex();
        assert_eq!(hex.len(), SERIAL_LEN * 2);
        let parsed = Serial::from_hex(&hex).unwrap();
        assert_eq!(parsed, serial);
    }

    #[test]
    fn zero_prefix_is_rejected() {
        assert!(SerialAllocator::new(0).is_err());
    }
}
