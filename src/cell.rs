//! # Cell Wire Format
//!
//! Every byte on a peer link above TLS belongs to a fixed-size cell:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 8    | circuit id, little-endian u64 |
//! | 8      | 1    | cell type (`MSG` = 1, `DIR` = 2) |
//! | 9      | 1015 | body |
//!
//! A `MSG` body carries an onion-layer fragment (see [`crate::circuit`]).
//! A `DIR` body carries a length-prefixed, bincode-serialized [`Directive`]
//! with zero padding to the end of the cell; padding is zeroed before
//! transmission so stale buffer contents never reach the wire.
//!
//! Deserialization is bounded to the body size to prevent memory
//! exhaustion from corrupt length prefixes.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RouterError};

/// Length of a cell on the wire.
pub const CELL_BYTES: usize = 1024;

/// Offset of the circuit-id field.
pub const ID: usize = 0;

/// Offset of the type byte.
pub const TYPE: usize = 8;

/// Offset of the first body byte.
pub const BODY: usize = 9;

/// Usable body bytes per cell.
pub const BODY_BYTES: usize = CELL_BYTES - BODY;

/// Directive length prefix size (u16 little-endian).
const DIR_LEN_SIZE: usize = 2;

/// A whole wire cell. Always exactly [`CELL_BYTES`] long.
pub type Cell = Vec<u8>;

/// Cell payload discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellType {
    Msg = 1,
    Dir = 2,
}

impl TryFrom<u8> for CellType {
    type Error = RouterError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(CellType::Msg),
            2 => Ok(CellType::Dir),
            other => Err(RouterError::BadCellType(other)),
        }
    }
}

/// Control message carried in a `DIR` cell.
///
/// `Create` carries the full path: `addrs[0]` is the originating proxy's
/// tag, the remaining entries are router addresses with the exit last.
/// Unspecified intermediate hops are empty strings filled by the entry
/// router. `key` is the client's ephemeral X25519 public key and
/// `sealed_dest` the onion-sealed final destination, both meaningful to
/// the exit hop only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directive {
    Create {
        addrs: Vec<String>,
        key: Vec<u8>,
        sealed_dest: Vec<u8>,
    },
    Created,
    Destroy,
    Destroyed,
    Error { reason: String },
}

/// Returns bincode options bounded to the cell body.
/// Always use this for directive deserialization.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(BODY_BYTES as u64)
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Read the circuit-id field without validating the rest of the cell.
pub fn circuit_id(cell: &[u8]) -> u64 {
    let mut id = [0u8; 8];
    id.copy_from_slice(&cell[ID..ID + 8]);
    u64::from_le_bytes(id)
}

/// Rewrite the circuit-id field in place.
pub fn set_circuit_id(cell: &mut [u8], id: u64) {
    cell[ID..ID + 8].copy_from_slice(&id.to_le_bytes());
}

/// Build a `MSG` cell from a body fragment. The body is padded with
/// zeros to the fixed cell size.
pub fn encode_msg(id: u64, body: &[u8]) -> Result<Cell> {
    if body.len() > BODY_BYTES {
        return Err(RouterError::MsgTooLarge);
    }
    let mut cell = vec![0u8; CELL_BYTES];
    set_circuit_id(&mut cell, id);
    cell[TYPE] = CellType::Msg as u8;
    cell[BODY..BODY + body.len()].copy_from_slice(body);
    Ok(cell)
}

/// Build a `DIR` cell carrying a serialized directive.
pub fn encode_dir(id: u64, directive: &Directive) -> Result<Cell> {
    let payload = bincode_options()
        .serialize(directive)
        .map_err(|e| RouterError::BadDirective(e.to_string()))?;
    if payload.len() > BODY_BYTES - DIR_LEN_SIZE {
        return Err(RouterError::BadDirective(format!(
            "directive payload of {} bytes exceeds cell body",
            payload.len()
        )));
    }
    let mut cell = vec![0u8; CELL_BYTES];
    set_circuit_id(&mut cell, id);
    cell[TYPE] = CellType::Dir as u8;
    cell[BODY..BODY + DIR_LEN_SIZE].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    cell[BODY + DIR_LEN_SIZE..BODY + DIR_LEN_SIZE + payload.len()].copy_from_slice(&payload);
    Ok(cell)
}

/// Split a cell into its id, type, and body view.
pub fn decode(cell: &[u8]) -> Result<(u64, CellType, &[u8])> {
    if cell.len() != CELL_BYTES {
        return Err(RouterError::ShortCell(cell.len()));
    }
    let kind = CellType::try_from(cell[TYPE])?;
    Ok((circuit_id(cell), kind, &cell[BODY..]))
}

/// Deserialize the directive out of a `DIR` cell body.
pub fn decode_directive(body: &[u8]) -> Result<Directive> {
    if body.len() < DIR_LEN_SIZE {
        return Err(RouterError::BadDirective("truncated body".into()));
    }
    let len = u16::from_le_bytes([body[0], body[1]]) as usize;
    if len > body.len() - DIR_LEN_SIZE {
        return Err(RouterError::BadDirective(format!(
            "length prefix {} exceeds body",
            len
        )));
    }
    bincode_options()
        .deserialize(&body[DIR_LEN_SIZE..DIR_LEN_SIZE + len])
        .map_err(|e| RouterError::BadDirective(e.to_string()))
}
