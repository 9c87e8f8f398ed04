use binrw::BinRead;
use bitflags::bitflags;

use super::blocks::BlockCursor;
use crate::Result;

bitflags! {
    /// Presence bits of the compressed event header's leading flags byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        const METADATA_ID                 = 1 << 0;
        const CAPTURE_THREAD_AND_SEQUENCE = 1 << 1;
        const THREAD_ID                   = 1 << 2;
        const STACK_ID                    = 1 << 3;
        const ACTIVITY_ID                 = 1 << 4;
        const RELATED_ACTIVITY_ID         = 1 << 5;
        const SORTED                      = 1 << 6;
        const DATA_LENGTH                 = 1 << 7;
    }
}

/// Fully reconstructed event blob header. In compressed blocks this doubles
/// as the carry state: fields absent from a blob's flags byte keep the value
/// of the previous blob in the same block.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventBlobHeader {
    pub metadata_id: u32,
    pub sequence_number: u32,
    pub thread_id: u64,
    pub capture_thread_id: u64,
    pub processor_number: u32,
    pub stack_id: u32,
    pub timestamp: u64,
    pub activity_id: [u8; 16],
    pub related_activity_id: [u8; 16],
    pub is_sorted: bool,
    pub payload_size: u32,
    /// On-wire size of the header itself, in bytes.
    pub header_size: u32,
}

/// The fixed-layout non-compressed variant (format v4). Bit 31 of the
/// metadata id field carries the IsSorted flag.
#[derive(BinRead, Debug, Clone)]
#[br(little)]
pub struct EventBlobHeaderV4 {
    pub event_size: u32,
    pub raw_metadata_id: u32,
    pub sequence_number: u32,
    pub thread_id: u64,
    pub capture_thread_id: u64,
    pub processor_number: u32,
    pub stack_id: u32,
    pub timestamp: u64,
    pub activity_id: [u8; 16],
    pub related_activity_id: [u8; 16],
    pub payload_size: u32,
}

impl EventBlobHeaderV4 {
    pub const WIRE_SIZE: u32 = 80;
}

/// Reconstruct the next blob header, mutating `carried` in place so the next
/// blob in the block starts from this one's values.
pub fn read_blob_header(
    cursor: &mut BlockCursor<'_>,
    carried: &mut EventBlobHeader,
    compressed: bool,
) -> Result<EventBlobHeader> {
    if compressed {
        read_compressed_header(cursor, carried)
    } else {
        let start = cursor.stream_position();
        let wire = cursor.parse_with(|io| EventBlobHeaderV4::read(io))?;
        *carried = EventBlobHeader {
            metadata_id: wire.raw_metadata_id & 0x7fff_ffff,
            sequence_number: wire.sequence_number,
            thread_id: wire.thread_id,
            capture_thread_id: wire.capture_thread_id,
            processor_number: wire.processor_number,
            stack_id: wire.stack_id,
            timestamp: wire.timestamp,
            activity_id: wire.activity_id,
            related_activity_id: wire.related_activity_id,
            is_sorted: wire.raw_metadata_id & 0x8000_0000 != 0,
            payload_size: wire.payload_size,
            header_size: (cursor.stream_position() - start) as u32,
        };
        Ok(carried.clone())
    }
}

fn read_compressed_header(
    cursor: &mut BlockCursor<'_>,
    header: &mut EventBlobHeader,
) -> Result<EventBlobHeader> {
    let start = cursor.stream_position();
    let flags = HeaderFlags::from_bits_retain(cursor.read_u8()?);

    if flags.contains(HeaderFlags::METADATA_ID) {
        header.metadata_id = cursor.read_varint_u32()?;
    }

    if flags.contains(HeaderFlags::CAPTURE_THREAD_AND_SEQUENCE) {
        let delta = cursor.read_varint_u32()?;
        header.sequence_number = header.sequence_number.wrapping_add(delta).wrapping_add(1);
        header.capture_thread_id = cursor.read_varint_u64()?;
        header.processor_number = cursor.read_varint_u32()?;
    } else if header.metadata_id != 0 {
        header.sequence_number = header.sequence_number.wrapping_add(1);
    }

    if flags.contains(HeaderFlags::THREAD_ID) {
        header.thread_id = cursor.read_varint_u64()?;
    }
    if flags.contains(HeaderFlags::STACK_ID) {
        header.stack_id = cursor.read_varint_u32()?;
    }

    // no presence bit: every blob carries a (possibly zero) timestamp delta
    let timestamp_delta = cursor.read_varint_u64()?;
    header.timestamp = header.timestamp.wrapping_add(timestamp_delta);

    if flags.contains(HeaderFlags::ACTIVITY_ID) {
        header.activity_id = cursor.read_array()?;
    }
    if flags.contains(HeaderFlags::RELATED_ACTIVITY_ID) {
        header.related_activity_id = cursor.read_array()?;
    }

    header.is_sorted = flags.contains(HeaderFlags::SORTED);

    if flags.contains(HeaderFlags::DATA_LENGTH) {
        header.payload_size = cursor.read_varint_u32()?;
    }

    header.header_size = (cursor.stream_position() - start) as u32;
    Ok(header.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint(mut value: u64, out: &mut Vec<u8>) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                return;
            }
        }
    }

    #[test]
    fn flags_zero_carries_everything() {
        let mut carried = EventBlobHeader {
            metadata_id: 0,
            sequence_number: 9,
            thread_id: 42,
            capture_thread_id: 42,
            processor_number: 1,
            stack_id: 3,
            timestamp: 1000,
            payload_size: 16,
            ..Default::default()
        };
        // flags 0x00, timestamp delta 7
        let bytes = vec![0x00, 0x07];
        let mut cursor = BlockCursor::new(&bytes, 0);
        let header = read_blob_header(&mut cursor, &mut carried, true).unwrap();
        assert_eq!(header.header_size, 2);
        assert_eq!(header.timestamp, 1007);
        assert_eq!(header.sequence_number, 9);
        assert_eq!(header.payload_size, 16);
        assert_eq!(cursor.position(), 2);
    }

    #[test]
    fn metadata_and_length_bits() {
        // flags 0x81: metadata id 7, timestamp delta 0, payload size 80
        let mut bytes = vec![0x81];
        varint(7, &mut bytes);
        varint(0, &mut bytes);
        varint(80, &mut bytes);
        let mut carried = EventBlobHeader::default();
        let mut cursor = BlockCursor::new(&bytes, 0);
        let header = read_blob_header(&mut cursor, &mut carried, true).unwrap();
        assert_eq!(header.metadata_id, 7);
        assert_eq!(header.payload_size, 80);
        // metadata id is non-zero and bit 1 is absent, so the sequence ticks
        assert_eq!(header.sequence_number, 1);
    }

    #[test]
    fn sequence_delta_then_implicit_increment() {
        // blob A: capture thread + sequence present, delta 4
        let mut bytes = vec![
            (HeaderFlags::METADATA_ID | HeaderFlags::CAPTURE_THREAD_AND_SEQUENCE).bits(),
        ];
        varint(7, &mut bytes); // metadata id
        varint(4, &mut bytes); // sequence delta
        varint(11, &mut bytes); // capture thread id
        varint(2, &mut bytes); // processor number
        varint(0, &mut bytes); // timestamp delta

        // blob B: only an implicit +1 (metadata id carried, non-zero)
        bytes.push(0x00);
        varint(0, &mut bytes); // timestamp delta

        let mut carried = EventBlobHeader::default();
        let mut cursor = BlockCursor::new(&bytes, 0);
        let a = read_blob_header(&mut cursor, &mut carried, true).unwrap();
        assert_eq!(a.sequence_number, 5);
        assert_eq!(a.capture_thread_id, 11);
        assert_eq!(a.processor_number, 2);

        let b = read_blob_header(&mut cursor, &mut carried, true).unwrap();
        assert_eq!(b.sequence_number, 6);
        assert_eq!(b.capture_thread_id, 11);
    }

    #[test]
    fn activity_ids_are_raw_guids() {
        let mut bytes = vec![(HeaderFlags::ACTIVITY_ID | HeaderFlags::SORTED).bits()];
        varint(0, &mut bytes); // timestamp delta precedes the guids
        let guid: [u8; 16] = *b"0123456789abcdef";
        bytes.extend_from_slice(&guid);
        let mut carried = EventBlobHeader::default();
        let mut cursor = BlockCursor::new(&bytes, 0);
        let header = read_blob_header(&mut cursor, &mut carried, true).unwrap();
        assert_eq!(header.activity_id, guid);
        assert!(header.is_sorted);
        assert_eq!(header.header_size, 18);
    }

    #[test]
    fn uncompressed_header_fixed_layout() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&100u32.to_le_bytes()); // event size
        bytes.extend_from_slice(&(0x8000_0007u32).to_le_bytes()); // metadata id | sorted
        bytes.extend_from_slice(&3u32.to_le_bytes()); // sequence number
        bytes.extend_from_slice(&77u64.to_le_bytes()); // thread id
        bytes.extend_from_slice(&78u64.to_le_bytes()); // capture thread id
        bytes.extend_from_slice(&1u32.to_le_bytes()); // processor
        bytes.extend_from_slice(&5u32.to_le_bytes()); // stack id
        bytes.extend_from_slice(&123_456u64.to_le_bytes()); // timestamp
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.extend_from_slice(&12u32.to_le_bytes()); // payload size

        let mut carried = EventBlobHeader::default();
        let mut cursor = BlockCursor::new(&bytes, 0);
        let header = read_blob_header(&mut cursor, &mut carried, false).unwrap();
        assert_eq!(header.metadata_id, 7);
        assert!(header.is_sorted);
        assert_eq!(header.sequence_number, 3);
        assert_eq!(header.thread_id, 77);
        assert_eq!(header.capture_thread_id, 78);
        assert_eq!(header.stack_id, 5);
        assert_eq!(header.payload_size, 12);
        assert_eq!(header.header_size, EventBlobHeaderV4::WIRE_SIZE);
    }
}
