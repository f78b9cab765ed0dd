//! Per-tick batched actor update sent on the unreliable channel.

use crate::codec::{byte_to_rotation, rotation_to_byte, PacketReader, PacketWriter};
use crate::error::DecodeError;
use crate::math::Vector2f;
use crate::ActorId;

/// Upper bound of a decompressed snapshot, checked before allocating.
pub const MAX_SNAPSHOT_SIZE: usize = 1024 * 1024;

const FLAG_FACING_LEFT: u8 = 0x01;
const FLAG_VISIBLE: u8 = 0x02;
const FLAG_ANIM_PAUSED: u8 = 0x04;
const FLAG_JUST_WARPED: u8 = 0x08;

/// Serialized size of one entry without the two varints.
const ENTRY_FIXED_SIZE: usize = 4 + 4 + 1 + 1 + 1;

#[derive(Debug, Clone, PartialEq)]
pub struct ActorUpdate {
    pub actor_id: ActorId,
    pub pos: Vector2f,
    /// Current animation or transition id.
    pub animation: u32,
    /// Radians, quantized to one byte on the wire.
    pub rotation: f32,
    pub facing_left: bool,
    pub visible: bool,
    pub anim_paused: bool,
    /// Position jumped since the last snapshot; receivers must not
    /// interpolate across it.
    pub just_warped: bool,
    pub renderer_type: u8,
}

impl ActorUpdate {
    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.facing_left {
            flags |= FLAG_FACING_LEFT;
        }
        if self.visible {
            flags |= FLAG_VISIBLE;
        }
        if self.anim_paused {
            flags |= FLAG_ANIM_PAUSED;
        }
        if self.just_warped {
            flags |= FLAG_JUST_WARPED;
        }
        flags
    }

    fn write(&self, w: &mut PacketWriter) {
        w.write_var_u32(self.actor_id);
        w.write_position(self.pos);
        w.write_var_u32(self.animation);
        w.write_u8(rotation_to_byte(self.rotation));
        w.write_u8(self.flags());
        w.write_u8(self.renderer_type);
    }

    fn read(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let actor_id = r.read_var_u32()?;
        let pos = r.read_position()?;
        let animation = r.read_var_u32()?;
        let rotation = byte_to_rotation(r.read_u8()?);
        let flags = r.read_u8()?;
        let renderer_type = r.read_u8()?;
        Ok(Self {
            actor_id,
            pos,
            animation,
            rotation,
            facing_left: flags & FLAG_FACING_LEFT != 0,
            visible: flags & FLAG_VISIBLE != 0,
            anim_paused: flags & FLAG_ANIM_PAUSED != 0,
            just_warped: flags & FLAG_JUST_WARPED != 0,
            renderer_type,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub actors: Vec<ActorUpdate>,
}

impl Snapshot {
    pub fn new(actors: Vec<ActorUpdate>) -> Self {
        Self { actors }
    }

    /// Count-prefixed entries, LZ4 compressed with the raw size prepended.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(4 + self.actors.len() * (ENTRY_FIXED_SIZE + 4));
        w.write_var_u32(self.actors.len() as u32);
        for actor in &self.actors {
            actor.write(&mut w);
        }
        lz4_flex::compress_prepend_size(&w.into_inner())
    }

    pub fn decode(compressed: &[u8]) -> Result<Self, DecodeError> {
        let declared = compressed
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or(DecodeError::UnexpectedEnd)?;
        if declared > MAX_SNAPSHOT_SIZE {
            return Err(DecodeError::LengthOutOfRange {
                len: declared,
                min: 0,
                max: MAX_SNAPSHOT_SIZE,
            });
        }
        let raw =
            lz4_flex::decompress_size_prepended(compressed).map_err(|_| DecodeError::Decompress)?;

        let mut r = PacketReader::new(&raw);
        let count = r.read_var_u32()? as usize;
        // Every entry takes at least ENTRY_FIXED_SIZE plus two one-byte varints.
        if count > r.remaining() / (ENTRY_FIXED_SIZE + 2) {
            return Err(DecodeError::LengthOutOfRange {
                len: count,
                min: 0,
                max: r.remaining() / (ENTRY_FIXED_SIZE + 2),
            });
        }
        let mut actors = Vec::with_capacity(count);
        for _ in 0..count {
            actors.push(ActorUpdate::read(&mut r)?);
        }
        Ok(Self { actors })
    }
}
