//! Command framing: every command starts with an 8-byte [`CommandHeader`] whose `size_bytes`
//! covers the header and the payload.

use bytemuck::{Pod, Zeroable};

use crate::error::DecodeError;
use crate::wire::WireWriter;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CommandHeader {
    pub opcode: u32,
    pub size_bytes: u32,
}

impl CommandHeader {
    pub const SIZE_BYTES: usize = core::mem::size_of::<CommandHeader>();

    fn to_le(self) -> Self {
        Self {
            opcode: self.opcode.to_le(),
            size_bytes: self.size_bytes.to_le(),
        }
    }

    fn from_le(self) -> Self {
        Self {
            opcode: u32::from_le(self.opcode),
            size_bytes: u32::from_le(self.size_bytes),
        }
    }
}

/// Append one framed command to `out`. `body` writes the payload.
pub fn write_frame(out: &mut Vec<u8>, opcode: u32, body: impl FnOnce(&mut WireWriter)) {
    let start = out.len();
    out.extend_from_slice(bytemuck::bytes_of(&CommandHeader::default()));

    let mut w = WireWriter::with_buffer(core::mem::take(out));
    body(&mut w);
    *out = w.into_bytes();

    let size_bytes = (out.len() - start) as u32;
    let header = CommandHeader { opcode, size_bytes }.to_le();
    out[start..start + CommandHeader::SIZE_BYTES].copy_from_slice(bytemuck::bytes_of(&header));
}

/// Split the first framed command off `bytes`.
///
/// Returns the opcode, the payload and the total number of bytes consumed.
pub fn read_frame(bytes: &[u8]) -> Result<(u32, &[u8], usize), DecodeError> {
    if bytes.len() < CommandHeader::SIZE_BYTES {
        return Err(DecodeError::UnexpectedEof);
    }
    let header: CommandHeader =
        bytemuck::pod_read_unaligned::<CommandHeader>(&bytes[..CommandHeader::SIZE_BYTES])
            .from_le();
    let size = header.size_bytes as usize;
    if size < CommandHeader::SIZE_BYTES || size > bytes.len() {
        return Err(DecodeError::BadCommandSize {
            size: header.size_bytes,
            remaining: bytes.len(),
        });
    }
    Ok((header.opcode, &bytes[CommandHeader::SIZE_BYTES..size], size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_includes_header() {
        let mut out = vec![0xaa];
        write_frame(&mut out, 9, |w| w.u32(0x1234_5678));
        assert_eq!(out.len(), 1 + 8 + 4);

        let (opcode, payload, consumed) = read_frame(&out[1..]).unwrap();
        assert_eq!(opcode, 9);
        assert_eq!(payload, &0x1234_5678u32.to_le_bytes());
        assert_eq!(consumed, 12);
    }

    #[test]
    fn undersized_and_oversized_frames_are_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        assert_eq!(
            read_frame(&bytes),
            Err(DecodeError::BadCommandSize {
                size: 4,
                remaining: 8
            })
        );

        bytes[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            read_frame(&bytes),
            Err(DecodeError::BadCommandSize { .. })
        ));
    }
}
