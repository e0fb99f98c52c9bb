//! Segment-table frame header: `u32` segment count minus one, `N` segment
//! word counts, padded to 8 bytes, followed by the segment bodies back to
//! back.

use crate::error::{DecodeError, EncodeError};
use crate::segment::MessageReader;
use bytes::Bytes;

/// Split a raw frame into its per-segment byte slices.
///
/// Returns the segments and the total number of header+body bytes consumed,
/// so callers streaming frames off a byte pipe know where the next frame
/// starts.
pub fn decode_frame(bytes: &Bytes) -> Result<(MessageReader, usize), DecodeError> {
    if bytes.len() < 4 {
        return Err(DecodeError::TruncatedFrame);
    }
    let segment_count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize + 1;
    if segment_count == 0 {
        return Err(DecodeError::ZeroSegmentCount);
    }

    let table_bytes = 4 + segment_count * 4;
    let padded_table_bytes = table_bytes.div_ceil(8) * 8;
    if bytes.len() < padded_table_bytes {
        return Err(DecodeError::TruncatedFrame);
    }

    let mut word_counts = Vec::with_capacity(segment_count);
    for i in 0..segment_count {
        let off = 4 + i * 4;
        word_counts.push(u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as usize);
    }

    let mut segments = Vec::with_capacity(segment_count);
    let mut cursor = padded_table_bytes;
    for words in word_counts {
        let body_bytes = words * 8;
        if bytes.len() < cursor + body_bytes {
            return Err(DecodeError::TruncatedFrame);
        }
        segments.push(bytes.slice(cursor..cursor + body_bytes));
        cursor += body_bytes;
    }

    Ok((MessageReader::new(segments), cursor))
}

/// Encode a list of already-finished segment byte buffers into a frame.
pub fn encode_frame(segments: &[Vec<u8>]) -> Result<Vec<u8>, EncodeError> {
    if segments.len() > u32::MAX as usize {
        return Err(EncodeError::TooManySegments {
            count: segments.len(),
        });
    }

    let table_bytes = 4 + segments.len() * 4;
    let padded_table_bytes = table_bytes.div_ceil(8) * 8;
    let total_body: usize = segments.iter().map(|s| s.len()).sum();
    let mut out = Vec::with_capacity(padded_table_bytes + total_body);

    out.extend_from_slice(&((segments.len() as u32) - 1).to_le_bytes());
    for (id, seg) in segments.iter().enumerate() {
        debug_assert_eq!(seg.len() % 8, 0, "segment {id} is not word-aligned");
        let words = seg.len() / 8;
        if words > u32::MAX as usize {
            return Err(EncodeError::SegmentTooLarge {
                segment_id: id as u32,
                words: words as u64,
            });
        }
        out.extend_from_slice(&(words as u32).to_le_bytes());
    }
    out.resize(padded_table_bytes, 0);
    for seg in segments {
        out.extend_from_slice(seg);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_segment_round_trip() {
        let seg = vec![1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];
        let frame = encode_frame(&[seg.clone()]).unwrap();
        let bytes = Bytes::from(frame);
        let (reader, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(reader.segment(0).unwrap().as_ref(), &seg[..]);
    }

    #[test]
    fn multi_segment_round_trip() {
        let segs = vec![vec![0u8; 8], vec![1u8; 16], vec![2u8; 24]];
        let frame = encode_frame(&segs).unwrap();
        let bytes = Bytes::from(frame);
        let (reader, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        for (i, seg) in segs.iter().enumerate() {
            assert_eq!(reader.segment(i as u32).unwrap().as_ref(), &seg[..]);
        }
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let segs = vec![vec![0u8; 16]];
        let mut frame = encode_frame(&segs).unwrap();
        frame.truncate(frame.len() - 1);
        let bytes = Bytes::from(frame);
        assert_eq!(decode_frame(&bytes), Err(DecodeError::TruncatedFrame));
    }

    #[test]
    fn consumed_allows_reading_next_frame_from_a_stream() {
        let a = encode_frame(&[vec![1u8; 8]]).unwrap();
        let b = encode_frame(&[vec![2u8; 16]]).unwrap();
        let mut combined = a.clone();
        combined.extend_from_slice(&b);
        let bytes = Bytes::from(combined);
        let (first, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(first.segment(0).unwrap().as_ref(), &[1u8; 8][..]);
        let rest = bytes.slice(consumed..);
        let (second, _) = decode_frame(&rest).unwrap();
        assert_eq!(second.segment(0).unwrap().as_ref(), &[2u8; 16][..]);
    }
}
