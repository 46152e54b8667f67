//! CRC-32 (IEEE) over the resource table.
//!
//! The lookup table is built at compile time.

use super::layout::ResourceRecord;

const POLYNOMIAL: u32 = 0xEDB8_8320;

static TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { POLYNOMIAL ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

/// CRC-32 of `bytes`.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &b in bytes {
        crc = TABLE[((crc ^ u32::from(b)) & 0xff) as usize] ^ (crc >> 8);
    }
    !crc
}

/// Checksum stored in the header for `records`.
pub fn resource_checksum(records: &[ResourceRecord]) -> u32 {
    // SAFETY: ResourceRecord is repr(C) with only u32/i32 fields, so every
    // byte is initialized.
    let bytes = unsafe {
        std::slice::from_raw_parts(records.as_ptr().cast::<u8>(), std::mem::size_of_val(records))
    };
    crc32(bytes)
}
