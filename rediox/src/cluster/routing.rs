//! Key-to-slot routing.
//!
//! The key space is divided into 16384 slots; the slot of a key is the
//! CRC16 (XMODEM) of its routable part modulo the slot count. A `{hash tag}`
//! confines hashing to the tag's content so related keys can be pinned to
//! one slot.

use crate::cmd::Cmd;
use crate::errors::{ErrorKind, RedioxResult};
use crate::pipeline::Pipeline;

/// Number of hash slots a cluster key space is divided into.
pub const SLOT_COUNT: u16 = 16384;

/// Returns the part of the key that participates in hashing: the content of
/// the first non-empty `{...}` tag, or the whole key when there is none.
fn routable_part(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(close) = key[open + 1..].iter().position(|&b| b == b'}') {
            if close > 0 {
                return &key[open + 1..open + 1 + close];
            }
        }
    }
    key
}

/// Computes the slot owning the given key.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(routable_part(key)) % SLOT_COUNT
}

/// Computes the single slot shared by all of a command's keys.
///
/// `Ok(None)` means the command carries no key and may run anywhere. Keys
/// spanning more than one slot are rejected before anything is written.
pub fn route_for_keys<'a, I>(keys: I) -> RedioxResult<Option<u16>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut slot = None;
    for key in keys {
        let key_slot = key_slot(key);
        match slot {
            None => slot = Some(key_slot),
            Some(existing) if existing != key_slot => fail!((
                ErrorKind::CrossSlot,
                "Keys in the command hash to different slots"
            )),
            Some(_) => {}
        }
    }
    Ok(slot)
}

/// Computes the routing slot for one command.
pub fn route_for_cmd(command: &Cmd) -> RedioxResult<Option<u16>> {
    route_for_keys(command.keys())
}

/// Computes the routing slot shared by every command of a pipeline. All
/// member commands must agree on one slot, since the batch is written to a
/// single node.
pub fn route_for_pipeline(pipeline: &Pipeline) -> RedioxResult<Option<u16>> {
    let mut slot = None;
    for command in pipeline.commands() {
        match (slot, route_for_cmd(command)?) {
            (_, None) => {}
            (None, next) => slot = next,
            (Some(existing), Some(next)) if existing != next => fail!((
                ErrorKind::CrossSlot,
                "Pipeline commands hash to different slots"
            )),
            _ => {}
        }
    }
    Ok(slot)
}
