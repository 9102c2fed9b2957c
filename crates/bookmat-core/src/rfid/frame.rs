//! Serial frame codec for the UHF readers.
//!
//! Both cabinet readers speak the same family of framed serial protocol:
//!
//! ```text
//! [len][addr][cmd][data…][crc_lo][crc_hi]
//! ```
//!
//! `len` covers address, command, data and the two CRC bytes. The CRC is
//! 16 bits, reversed polynomial `0x8408`, initial value `0xFFFF`, sent
//! least-significant byte first. An inventory round answers with status
//! `0x01` (tags found, followed by a count and length-prefixed EPCs) or
//! `0xFB` (field empty).

use bytes::{BufMut, BytesMut};

/// Inventory command code.
pub const CMD_INVENTORY: u8 = 0x01;
/// Response status: at least one tag in the field.
pub const STATUS_TAG_FOUND: u8 = 0x01;
/// Response status: no tags.
pub const STATUS_NO_TAG: u8 = 0xFB;

/// Frame-level protocol errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameError {
    /// Fewer bytes than the smallest legal frame.
    #[error("frame truncated: {actual} bytes, need at least {needed}")]
    Truncated { actual: usize, needed: usize },

    /// The length byte disagrees with the byte count.
    #[error("frame length byte {declared} does not match {actual} bytes")]
    LengthMismatch { declared: u8, actual: usize },

    /// CRC check failed.
    #[error("frame crc mismatch: computed {computed:#06x}, received {received:#06x}")]
    BadCrc { computed: u16, received: u16 },

    /// The reader answered something other than an inventory status.
    #[error("unexpected response status {status:#04x}")]
    UnexpectedStatus { status: u8 },
}

/// CRC-16, polynomial `0x8408` (reversed `0x1021`), init `0xFFFF`.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Builds a command frame for the given reader address.
#[must_use]
pub fn build_frame(addr: u8, cmd: u8, data: &[u8]) -> Vec<u8> {
    // addr + cmd + data + two crc bytes.
    let len = (2 + data.len() + 2) as u8;
    let mut frame = BytesMut::with_capacity(usize::from(len) + 1);
    frame.put_u8(len);
    frame.put_u8(addr);
    frame.put_u8(cmd);
    frame.put_slice(data);
    let crc = crc16(&frame);
    frame.put_u8((crc & 0xFF) as u8);
    frame.put_u8((crc >> 8) as u8);
    frame.to_vec()
}

/// Checks the envelope of a response frame and returns its payload
/// (address, command, data).
pub fn parse_frame(frame: &[u8]) -> Result<(u8, u8, &[u8]), FrameError> {
    if frame.len() < 5 {
        return Err(FrameError::Truncated {
            actual: frame.len(),
            needed: 5,
        });
    }
    let declared = frame[0];
    let expected_total = usize::from(declared) + 1;
    if frame.len() < expected_total {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: frame.len(),
        });
    }
    let frame = &frame[..expected_total];

    let body = &frame[..frame.len() - 2];
    let computed = crc16(body);
    let received = u16::from(frame[frame.len() - 2]) | (u16::from(frame[frame.len() - 1]) << 8);
    if computed != received {
        return Err(FrameError::BadCrc { computed, received });
    }
    Ok((frame[1], frame[2], &frame[3..frame.len() - 2]))
}

/// Parses an inventory response into upper-hex EPC strings.
///
/// Data layout after the status byte: tag count, then per tag one length
/// byte followed by that many EPC bytes. Trailing bytes (PC words, RSSI)
/// past the declared tags are ignored.
pub fn parse_inventory(frame: &[u8]) -> Result<Vec<String>, FrameError> {
    let (_addr, _cmd, data) = parse_frame(frame)?;
    let Some((&status, rest)) = data.split_first() else {
        return Err(FrameError::Truncated {
            actual: frame.len(),
            needed: frame.len() + 1,
        });
    };
    match status {
        STATUS_NO_TAG => Ok(Vec::new()),
        STATUS_TAG_FOUND => {
            let Some((&count, mut rest)) = rest.split_first() else {
                return Ok(Vec::new());
            };
            let mut tags = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                let Some((&epc_len, tail)) = rest.split_first() else {
                    break;
                };
                let epc_len = usize::from(epc_len);
                if tail.len() < epc_len {
                    break;
                }
                let (epc, tail) = tail.split_at(epc_len);
                tags.push(to_upper_hex(epc));
                rest = tail;
            }
            Ok(tags)
        }
        status => Err(FrameError::UnexpectedStatus { status }),
    }
}

fn to_upper_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a syntactically valid response frame around `data`.
    fn response(addr: u8, cmd: u8, data: &[u8]) -> Vec<u8> {
        build_frame(addr, cmd, data)
    }

    #[test]
    fn test_crc_known_vector() {
        // Empty-payload inventory command for address 0.
        let frame = build_frame(0x00, CMD_INVENTORY, &[]);
        assert_eq!(frame.len(), 5);
        assert_eq!(frame[0], 4);
        // Round trip through the checker.
        let (addr, cmd, data) = parse_frame(&frame).unwrap();
        assert_eq!((addr, cmd), (0x00, CMD_INVENTORY));
        assert!(data.is_empty());
    }

    #[test]
    fn test_corrupted_crc_rejected() {
        let mut frame = build_frame(0x00, CMD_INVENTORY, &[0xAA]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(parse_frame(&frame), Err(FrameError::BadCrc { .. })));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        assert!(matches!(
            parse_frame(&[0x04, 0x00]),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn test_inventory_no_tag() {
        let frame = response(0x00, CMD_INVENTORY, &[STATUS_NO_TAG]);
        assert_eq!(parse_inventory(&frame).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_inventory_single_tag() {
        let epc = [0xE2, 0x00, 0x11, 0x22];
        let mut data = vec![STATUS_TAG_FOUND, 1, epc.len() as u8];
        data.extend_from_slice(&epc);
        let frame = response(0x00, CMD_INVENTORY, &data);
        assert_eq!(parse_inventory(&frame).unwrap(), vec!["E2001122".to_string()]);
    }

    #[test]
    fn test_inventory_multiple_tags_per_round() {
        let mut data = vec![STATUS_TAG_FOUND, 2];
        data.extend_from_slice(&[2, 0xAA, 0xBB]);
        data.extend_from_slice(&[3, 0x01, 0x02, 0x03]);
        let frame = response(0x00, CMD_INVENTORY, &data);
        assert_eq!(
            parse_inventory(&frame).unwrap(),
            vec!["AABB".to_string(), "010203".to_string()]
        );
    }

    #[test]
    fn test_inventory_ignores_trailing_rssi() {
        let mut data = vec![STATUS_TAG_FOUND, 1];
        data.extend_from_slice(&[2, 0xAA, 0xBB]);
        data.push(0xC8); // RSSI byte after the declared tag.
        let frame = response(0x00, CMD_INVENTORY, &data);
        assert_eq!(parse_inventory(&frame).unwrap(), vec!["AABB".to_string()]);
    }

    #[test]
    fn test_unexpected_status_is_error() {
        let frame = response(0x00, CMD_INVENTORY, &[0x42]);
        assert_eq!(
            parse_inventory(&frame),
            Err(FrameError::UnexpectedStatus { status: 0x42 })
        );
    }
}
