// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::io::Monitor;

/// Per-step left-rotation amounts, grouped by round.
const S: [u32; 64] = [
    7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, //
    5, 9, 14, 20, 5, 9, 14, 20, 5, 9, 14, 20, 5, 9, 14, 20, //
    4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, //
    6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21,
];

/// The binary integer part of the sines of integers (radians) as constants, `floor(2^32 ×
/// abs(sin(i + 1)))`.
const K: [u32; 64] = [
    0xd76a_a478, 0xe8c7_b756, 0x2420_70db, 0xc1bd_ceee, 0xf57c_0faf, 0x4787_c62a, 0xa830_4613,
    0xfd46_9501, 0x6980_98d8, 0x8b44_f7af, 0xffff_5bb1, 0x895c_d7be, 0x6b90_1122, 0xfd98_7193,
    0xa679_438e, 0x49b4_0821, 0xf61e_2562, 0xc040_b340, 0x265e_5a51, 0xe9b6_c7aa, 0xd62f_105d,
    0x0244_1453, 0xd8a1_e681, 0xe7d3_fbc8, 0x21e1_cde6, 0xc337_07d6, 0xf4d5_0d87, 0x455a_14ed,
    0xa9e3_e905, 0xfcef_a3f8, 0x676f_02d9, 0x8d2a_4c8a, 0xfffa_3942, 0x8771_f681, 0x6d9d_6122,
    0xfde5_380c, 0xa4be_ea44, 0x4bde_cfa9, 0xf6bb_4b60, 0xbebf_bc70, 0x289b_7ec6, 0xeaa1_27fa,
    0xd4ef_3085, 0x0488_1d05, 0xd9d4_d039, 0xe6db_99e5, 0x1fa2_7cf8, 0xc4ac_5665, 0xf429_2244,
    0x432a_ff97, 0xab94_23a7, 0xfc93_a039, 0x655b_59c3, 0x8f0c_cc92, 0xffef_f47d, 0x8584_5dd1,
    0x6fa8_7e4f, 0xfe2c_e6e0, 0xa301_4314, 0x4e08_11a1, 0xf753_7e82, 0xbd3a_f235, 0x2ad7_d2bb,
    0xeb86_d391,
];

const INIT_STATE: [u32; 4] = [0x6745_2301, 0xefcd_ab89, 0x98ba_dcfe, 0x1032_5476];

fn transform(state: &mut [u32; 4], block: &[u8]) {
    // Assert to hopefully force the compiler to elide bounds checks on block.
    assert!(block.len() == 64);

    let mut m = [0u32; 16];

    for (word, bytes) in m.iter_mut().zip(block.chunks_exact(4)) {
        // Input bytes are considered little-endian for MD5.
        *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }

    let mut a = state[0];
    let mut b = state[1];
    let mut c = state[2];
    let mut d = state[3];

    for i in 0..64 {
        let (f, g) = match i {
            0..=15 => (d ^ (b & (c ^ d)), i),
            16..=31 => (c ^ (d & (b ^ c)), (5 * i + 1) & 0xf),
            32..=47 => (b ^ c ^ d, (3 * i + 5) & 0xf),
            _ => (c ^ (b | !d), (7 * i) & 0xf),
        };

        let tmp = d;
        d = c;
        c = b;
        b = b.wrapping_add(
            a.wrapping_add(f).wrapping_add(K[i]).wrapping_add(m[g]).rotate_left(S[i]),
        );
        a = tmp;
    }

    state[0] = state[0].wrapping_add(a);
    state[1] = state[1].wrapping_add(b);
    state[2] = state[2].wrapping_add(c);
    state[3] = state[3].wrapping_add(d);
}

/// `Md5` computes the MD5 hash of all processed bytes.
#[derive(Clone)]
pub struct Md5 {
    state: [u32; 4],
    /// Total number of bytes processed.
    len: u64,
    /// Partial input block. Only the first `len % 64` bytes are valid.
    block: [u8; 64],
}

impl Default for Md5 {
    fn default() -> Self {
        Md5 { state: INIT_STATE, len: 0, block: [0; 64] }
    }
}

impl Md5 {
    /// Get the computed hash. The hash is for all the data processed up to this call; more data
    /// may be processed afterwards.
    pub fn md5(&self) -> [u8; 16] {
        // Finalization appends padding and the message length, which would prevent further
        // updates. Operate on a copy so the running state stays usable.
        let mut ctx = self.clone();

        let bit_len = ctx.len.wrapping_mul(8);

        // Pad with a 1 bit then 0 bits until 8 bytes remain in the block, then append the message
        // length in bits as a little-endian 64-bit integer.
        ctx.process_byte(0x80);

        while ctx.len % 64 != 56 {
            ctx.process_byte(0x00);
        }

        ctx.process_buf_bytes(&bit_len.to_le_bytes());

        debug_assert!(ctx.len % 64 == 0);

        let mut hash = [0u8; 16];

        for (out, word) in hash.chunks_exact_mut(4).zip(&ctx.state) {
            out.copy_from_slice(&word.to_le_bytes());
        }

        hash
    }
}

impl Monitor for Md5 {
    fn process_byte(&mut self, byte: u8) {
        let fill = (self.len % 64) as usize;

        self.block[fill] = byte;
        self.len += 1;

        if fill == 63 {
            let block = self.block;
            transform(&mut self.state, &block);
        }
    }

    fn process_buf_bytes(&mut self, buf: &[u8]) {
        let mut rem = buf;
        let fill = (self.len % 64) as usize;

        self.len += buf.len() as u64;

        // Top-up a partially filled block first.
        if fill > 0 {
            let n = rem.len().min(64 - fill);
            self.block[fill..fill + n].copy_from_slice(&rem[..n]);
            rem = &rem[n..];

            if fill + n < 64 {
                return;
            }

            let block = self.block;
            transform(&mut self.state, &block);
        }

        // Process whole blocks directly from the input.
        let mut blocks = rem.chunks_exact(64);

        for block in &mut blocks {
            transform(&mut self.state, block);
        }

        // Stash the remainder.
        let tail = blocks.remainder();
        self.block[..tail.len()].copy_from_slice(tail);
    }
}

#[cfg(test)]
mod tests {
    use super::Md5;
    use crate::io::Monitor;

    fn md5_of(buf: &[u8]) -> [u8; 16] {
        let mut md5 = Md5::default();
        md5.process_buf_bytes(buf);
        md5.md5()
    }

    fn hex(hash: &[u8; 16]) -> String {
        hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn verify_md5_rfc1321_vectors() {
        assert_eq!(hex(&md5_of(b"")), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(hex(&md5_of(b"a")), "0cc175b9c0f1b6a831c399e269772661");
        assert_eq!(hex(&md5_of(b"abc")), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(hex(&md5_of(b"message digest")), "f96b697d7cb7938d525a2f31aaf161d0");
        assert_eq!(
            hex(&md5_of(b"abcdefghijklmnopqrstuvwxyz")),
            "c3fcd3d76192e4007dfb496cca67e13b"
        );
    }

    #[test]
    fn verify_md5_incremental() {
        let mut md5 = Md5::default();

        // Process in awkwardly sized chunks to exercise the block top-up paths.
        let data = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

        md5.process_buf_bytes(&data[..1]);
        md5.process_buf_bytes(&data[1..7]);
        md5.process_buf_bytes(&data[7..]);

        assert_eq!(hex(&md5.md5()), "d174ab98d277d9f5a5611c2c9f419d9f");

        // A query must not disturb the running state.
        md5.process_buf_bytes(b"!");
        assert_ne!(hex(&md5.md5()), "d174ab98d277d9f5a5611c2c9f419d9f");
    }

    #[test]
    fn verify_md5_chunking_invariance() {
        // Hashing the same bytes in different chunkings must produce the same digest.
        let data: Vec<u8> = (0..16384u32).map(|i| (i * 7 + 3) as u8).collect();

        let one_shot = md5_of(&data);

        let mut md5 = Md5::default();
        for chunk in data.chunks(61) {
            md5.process_buf_bytes(chunk);
        }
        assert_eq!(md5.md5(), one_shot);

        let mut md5 = Md5::default();
        for byte in &data {
            md5.process_byte(*byte);
        }
        assert_eq!(md5.md5(), one_shot);
    }
}
