//! Table-driven CRC-8 (frame headers) and CRC-16 (whole frames)
//!
//! Both are MSB-first with a zero initial value: CRC-8 uses polynomial
//! `x^8 + x^2 + x + 1` (0x07), CRC-16 uses `x^16 + x^15 + x^2 + 1` (0x8005).

pub const CRC8_TABLE: [u8; 256] = build_crc8_table();
pub const CRC16_TABLE: [u16; 256] = build_crc16_table();

const fn build_crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[inline]
pub fn crc8_update(crc: u8, byte: u8) -> u8 {
    CRC8_TABLE[(crc ^ byte) as usize]
}

#[inline]
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    (crc << 8) ^ CRC16_TABLE[((crc >> 8) as u8 ^ byte) as usize]
}

/// CRC-8 of `data`
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0, |crc, &b| crc8_update(crc, b))
}

/// CRC-16 of `data`
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update_block(0, data)
}

/// Continue a CRC-16 over more bytes
pub fn crc16_update_block(crc: u16, data: &[u8]) -> u16 {
    data.iter().fold(crc, |crc, &b| crc16_update(crc, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_values() {
        assert_eq!(crc8(b"123456789"), 0xF4);
        assert_eq!(crc16(b"123456789"), 0xFEE8);
        assert_eq!(crc8(&[]), 0);
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn test_tables() {
        assert_eq!(CRC8_TABLE[1], 0x07);
        assert_eq!(CRC16_TABLE[1], 0x8005);
    }

    #[test]
    fn test_incremental() {
        let data = b"fLaC frame bytes";
        let (head, tail) = data.split_at(5);
        assert_eq!(crc16_update_block(crc16(head), tail), crc16(data));
    }

    #[test]
    fn test_residue_is_zero() {
        // Appending the CRC makes the CRC of the whole message zero
        let mut data = b"header".to_vec();
        data.push(crc8(&data));
        assert_eq!(crc8(&data), 0);

        let mut frame = b"frame".to_vec();
        frame.extend_from_slice(&crc16(&frame).to_be_bytes());
        assert_eq!(crc16(&frame), 0);
    }
}
