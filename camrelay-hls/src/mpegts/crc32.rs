// CRC-32/MPEG-2 (poly 0x04c11db7, init 0xffffffff, no reflection, no final xor)

const fn make_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04c1_1db7
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

static CRC_TABLE: [u32; 256] = make_table();

#[must_use]
pub fn gen_crc32(data: &[u8]) -> u32 {
    data.iter().fold(0xffff_ffff, |crc, &byte| {
        (crc << 8) ^ CRC_TABLE[usize::from(((crc >> 24) as u8) ^ byte)]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(gen_crc32(b"123456789"), 0x0376_e6e7);
    }

    #[test]
    fn test_crc32_of_section_with_trailer_is_zero() {
        let mut section = vec![0x00, 0xb0, 0x0d, 0x00, 0x01, 0xc1, 0x00, 0x00, 0x00, 0x01, 0xf0, 0x00];
        let crc = gen_crc32(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(gen_crc32(&section), 0);
    }
}
