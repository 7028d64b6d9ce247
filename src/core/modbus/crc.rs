//! CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF), transmitted low byte first.

use crc::{Crc, CRC_16_MODBUS};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Appends the checksum of the current contents of `frame`.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// True when the trailing two bytes of `frame` are the checksum of the rest.
pub fn validate(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }

    let (body, tail) = frame.split_at(frame.len() - 2);
    crc16(body) == u16::from_le_bytes([tail[0], tail[1]])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_vector() {
        // Read holding registers, device 1, address 0, quantity 1.
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(crc16(&frame).to_le_bytes(), [0x84, 0x0A]);
    }

    #[test]
    fn appended_crc_validates() {
        let samples: [&[u8]; 4] = [
            &[0x05, 0x03, 0x02, 0x04, 0xD2],
            &[0xFF],
            &[0x11, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02],
            &[0x00, 0x00, 0x00],
        ];

        for sample in samples {
            let mut frame = sample.to_vec();
            append_crc(&mut frame);
            assert!(validate(&frame), "{frame:02X?}");
        }
    }

    #[test]
    fn single_bit_corruption_is_detected() {
        let mut frame = vec![0x05, 0x03, 0x02, 0x04, 0xD2];
        append_crc(&mut frame);

        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(!validate(&corrupted), "flip byte {byte} bit {bit}");
            }
        }
    }

    /// Bitwise reference: reflected 0xA001, init 0xFFFF.
    fn reference(data: &[u8]) -> u16 {
        let mut crc = 0xFFFFu16;
        for &byte in data {
            crc ^= u16::from(byte);
            for _ in 0..8 {
                crc = match crc & 1 {
                    1 => (crc >> 1) ^ 0xA001,
                    _ => crc >> 1,
                };
            }
        }
        crc
    }

    #[test]
    fn sweep_over_lengths_and_contents() {
        // Deterministic LCG so failures are reproducible.
        let mut seed = 0x1234_5678u32;
        let mut next = move || {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (seed >> 24) as u8
        };

        for len in 1..=254 {
            for _ in 0..4 {
                let body: Vec<u8> = (0..len).map(|_| next()).collect();
                assert_eq!(crc16(&body), reference(&body), "{body:02X?}");

                let mut frame = body.clone();
                append_crc(&mut frame);
                assert!(validate(&frame), "{frame:02X?}");

                let byte = next() as usize % frame.len();
                let bit = next() % 8;
                frame[byte] ^= 1 << bit;
                assert!(!validate(&frame), "flip byte {byte} bit {bit} of {frame:02X?}");
            }
        }
    }

    #[test]
    fn too_short_never_validates() {
        assert!(!validate(&[]));
        assert!(!validate(&[0x01, 0x02]));
    }
}
