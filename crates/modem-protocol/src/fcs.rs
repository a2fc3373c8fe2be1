//! Frame check sequence for TS 27.010 basic mode
//!
//! The FCS is the reflected CRC-8 with polynomial x^8 + x^2 + x + 1,
//! initialized to 0xFF. The transmitted byte is the ones' complement of
//! the register; on receive, running the register over the protected
//! bytes plus the FCS byte must yield the constant 0xCF.

/// Reversed polynomial for x^8 + x^2 + x + 1
const POLY_REFLECTED: u8 = 0xE0;

/// Receive-side check constant
const GOOD_FCS: u8 = 0xCF;

const TABLE: [u8; 256] = build_table();

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

fn accumulate(init: u8, data: &[u8]) -> u8 {
    let mut crc = init;
    for &byte in data {
        crc = TABLE[(crc ^ byte) as usize];
    }
    crc
}

/// Compute the FCS byte to transmit for the given protected bytes
pub fn compute(data: &[u8]) -> u8 {
    !accumulate(0xFF, data)
}

/// Verify a received FCS byte against the protected bytes
pub fn verify(data: &[u8], fcs: u8) -> bool {
    accumulate(accumulate(0xFF, data), &[fcs]) == GOOD_FCS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_verifies() {
        let data = [0x07, 0x3F, 0x01];
        let fcs = compute(&data);
        assert!(verify(&data, fcs));
    }

    #[test]
    fn corrupted_fcs_fails() {
        let data = [0x07, 0x3F, 0x01];
        let fcs = compute(&data);
        assert!(!verify(&data, fcs ^ 0x01));
    }

    #[test]
    fn corrupted_data_fails() {
        let data = [0x0B, 0xEF, 0x05];
        let fcs = compute(&data);
        let mut bad = data;
        bad[1] ^= 0x40;
        assert!(!verify(&bad, fcs));
    }

    #[test]
    fn empty_input_round_trips() {
        let fcs = compute(&[]);
        assert!(verify(&[], fcs));
    }

    #[test]
    fn known_sabm_header() {
        // SABM on DLCI 0 with P set: address 0x03, control 0x3F, length 0x01.
        // Well-known vector from TS 27.010 interop traces.
        let header = [0x03, 0x3F, 0x01];
        assert_eq!(compute(&header), 0x1C);
    }
}
