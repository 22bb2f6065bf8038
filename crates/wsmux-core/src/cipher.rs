//! XOR mask cipher (RFC 6455 Section 5.3) with rolling-offset support.
//!
//! Client-to-server payloads are XORed with a 4-byte key indexed by the byte's
//! position within the payload. The gateway reads payloads in pieces (a 2-byte
//! channel index, then the body, possibly across several `read` calls), so
//! both operations here take the position into account:
//!
//! - [`apply`] deciphers a chunk that starts at a known payload offset.
//! - [`shift`] rotates the key so a downstream reader can start over at
//!   offset 0 after a prefix of `n` bytes has been consumed.

/// XOR `buf` in place with `mask`, where `buf[0]` sits at payload position
/// `offset`. Applying twice with the same arguments restores the input.
pub fn apply(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[(offset + i) & 0x3];
    }
}

/// Rotate `mask` left by `n mod 4` positions.
///
/// After `n` payload bytes have been consumed, masking the remainder from
/// offset 0 with the shifted key is equivalent to masking it from offset `n`
/// with the original key.
pub fn shift(mask: [u8; 4], n: usize) -> [u8; 4] {
    match n & 0x3 {
        1 => [mask[1], mask[2], mask[3], mask[0]],
        2 => [mask[2], mask[3], mask[0], mask[1]],
        3 => [mask[3], mask[0], mask[1], mask[2]],
        _ => mask,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn apply_is_involutive() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let original = b"Hello, multiplexed world".to_vec();
        let mut buf = original.clone();
        apply(&mut buf, mask, 0);
        assert_ne!(buf, original);
        apply(&mut buf, mask, 0);
        assert_eq!(buf, original);
    }

    #[test]
    fn apply_honors_offset() {
        let mask = [1, 2, 3, 4];
        let mut whole = vec![0u8; 8];
        apply(&mut whole, mask, 0);

        // Masking the two halves separately with the right offsets must agree.
        let mut split = vec![0u8; 8];
        apply(&mut split[..3], mask, 0);
        apply(&mut split[3..], mask, 3);
        assert_eq!(whole, split);
    }

    #[test]
    fn shift_matches_offset_masking() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let mask: [u8; 4] = rng.gen();
            let len = rng.gen_range(4..64);
            let original: Vec<u8> = (0..len).map(|_| rng.gen()).collect();

            let mut masked = original.clone();
            apply(&mut masked, mask, 0);

            for n in 0..4 {
                // Strip the first n bytes, then decipher the rest with the
                // shifted key starting at offset 0.
                let mut rest = masked[n..].to_vec();
                apply(&mut rest, shift(mask, n), 0);
                assert_eq!(rest, &original[n..], "shift by {n}");
            }
        }
    }

    #[test]
    fn shift_by_multiple_of_four_is_identity() {
        let mask = [9, 8, 7, 6];
        assert_eq!(shift(mask, 0), mask);
        assert_eq!(shift(mask, 4), mask);
        assert_eq!(shift(mask, 8), mask);
    }
}
