use sha1::{Digest, Sha1};

/// per-frame xor keystream, selected by protocol revision
///
/// frames before revision 4 arrive in the clear, revisions 5 and 6 and
/// the v7+ client frames xor against a 4 byte key, and revision 4 uses
/// a 20 byte sha1-derived key that recirculates over the frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keystream {
    /// no masking, bytes pass through unchanged
    Identity,
    /// 4 byte key, index wraps modulo 4
    Nonce {
        /// the frame nonce or collected mask key
        key: [u8; 4],
        /// next key byte to consume
        idx: usize,
    },
    /// 20 byte rolling key, index wraps modulo 20
    Rolling {
        /// the sha1-derived frame key
        key: [u8; 20],
        /// next key byte to consume
        idx: usize,
    },
}

impl Keystream {
    /// xor one byte against the stream, advancing it
    pub fn apply(&mut self, c: u8) -> u8 {
        match self {
            Keystream::Identity => c,
            Keystream::Nonce { key, idx } => {
                let b = c ^ key[*idx];
                *idx = (*idx + 1) & 3;
                b
            }
            Keystream::Rolling { key, idx } => {
                let b = c ^ key[*idx];
                *idx += 1;
                if *idx == 20 {
                    *idx = 0;
                }
                b
            }
        }
    }

    /// restart the stream at the first key byte
    pub fn rewind(&mut self) {
        match self {
            Keystream::Identity => {}
            Keystream::Nonce { idx, .. } => *idx = 0,
            Keystream::Rolling { idx, .. } => *idx = 0,
        }
    }
}

/// derive the revision 4 rolling frame key
///
/// every incoming frame carries a 4 byte nonce; its sha1 together with
/// the connection masking key agreed at handshake time yields the 20
/// byte xor key for that frame
pub fn derive_rolling_key(nonce: &[u8; 4], session_key: &[u8; 20]) -> [u8; 20] {
    let mut sha1 = Sha1::new();
    sha1.update(nonce);
    sha1.update(session_key);
    sha1.finalize().into()
}

/// xor a whole buffer against a 4 byte mask key
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= key[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_round_trip() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut data = b"Hello, masking".to_vec();
        apply_mask(&mut data, key);
        assert_ne!(&data, b"Hello, masking");
        apply_mask(&mut data, key);
        assert_eq!(&data, b"Hello, masking");
    }

    #[test]
    fn nonce_stream_matches_bulk_apply() {
        let key = [1, 2, 3, 4];
        let mut stream = Keystream::Nonce { key, idx: 0 };
        let mut bulk = (0u8..32).collect::<Vec<_>>();
        let streamed: Vec<u8> = bulk.iter().map(|&c| stream.apply(c)).collect();
        apply_mask(&mut bulk, key);
        assert_eq!(streamed, bulk);
    }

    #[test]
    fn rolling_stream_wraps_at_twenty() {
        let key: [u8; 20] = std::array::from_fn(|i| i as u8 + 1);
        let mut stream = Keystream::Rolling { key, idx: 0 };
        for _ in 0..20 {
            stream.apply(0);
        }
        // after a full cycle the stream starts over at the first byte
        assert_eq!(stream.apply(0), key[0]);
    }

    #[test]
    fn rewind_restarts_the_key() {
        let mut stream = Keystream::Nonce {
            key: [9, 8, 7, 6],
            idx: 0,
        };
        stream.apply(0);
        stream.apply(0);
        stream.rewind();
        assert_eq!(stream.apply(0), 9);
    }

    #[test]
    fn rolling_key_derivation_matches_sha1() {
        let nonce = [0xde, 0xad, 0xbe, 0xef];
        let session_key: [u8; 20] = std::array::from_fn(|i| i as u8);
        let derived = derive_rolling_key(&nonce, &session_key);

        let mut sha1 = Sha1::new();
        sha1.update(nonce);
        sha1.update(session_key);
        let expect: [u8; 20] = sha1.finalize().into();
        assert_eq!(derived, expect);
    }
}
