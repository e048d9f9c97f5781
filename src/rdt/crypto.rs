//! Datagram encryption.
//!
//! A 32-byte key is derived from the configured key and salt with
//! PBKDF2-HMAC-SHA1 (4096 iterations); each cipher consumes a prefix of
//! it — 16 bytes for aes-128/cast5/tea/xtea/sm4, 24 for aes-192/3des,
//! the full 32 otherwise. Block ciphers run in CFB with a fresh random IV
//! prepended to every datagram; Salsa20 prepends its 8-byte nonce; `xor`
//! is a repeating-key mask and `none` a passthrough.
//!
//! Peers configured with mismatched ciphers or keys produce garbage on
//! open, which fails the first segment decode — the required fail-fast.

use cipher::consts::{U1, U16, U8};
use cipher::inout::InOut;
use cipher::{
    AsyncStreamCipher, Block, BlockBackend, BlockCipher, BlockClosure, BlockEncrypt,
    BlockEncryptMut, BlockSizeUser, Key, KeyInit, KeyIvInit, KeySizeUser, ParBlocksSizeUser,
    StreamCipher,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// PBKDF2 iteration count.
const PBKDF2_ROUNDS: u32 = 4096;

/// Largest per-datagram overhead any cipher adds (the 16-byte CFB IV).
pub const MAX_OVERHEAD: usize = 16;

/// Datagram cipher selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crypt {
    Aes256,
    Aes128,
    Aes192,
    Salsa20,
    Blowfish,
    Twofish,
    Cast5,
    TripleDes,
    Tea,
    Xtea,
    Xor,
    Sm4,
    None,
}

impl Crypt {
    /// Parse a config value. `aes` is the 256-bit default spelling.
    pub fn parse(s: &str) -> Option<Crypt> {
        match s {
            "aes" => Some(Crypt::Aes256),
            "aes-128" => Some(Crypt::Aes128),
            "aes-192" => Some(Crypt::Aes192),
            "salsa20" => Some(Crypt::Salsa20),
            "blowfish" => Some(Crypt::Blowfish),
            "twofish" => Some(Crypt::Twofish),
            "cast5" => Some(Crypt::Cast5),
            "3des" => Some(Crypt::TripleDes),
            "tea" => Some(Crypt::Tea),
            "xtea" => Some(Crypt::Xtea),
            "xor" => Some(Crypt::Xor),
            "sm4" => Some(Crypt::Sm4),
            "none" => Some(Crypt::None),
            _ => None,
        }
    }

    /// How much of the derived 32-byte key this cipher consumes.
    pub fn key_len(self) -> usize {
        match self {
            Crypt::Aes128 | Crypt::Cast5 | Crypt::Tea | Crypt::Xtea | Crypt::Sm4 => 16,
            Crypt::Aes192 | Crypt::TripleDes => 24,
            Crypt::Aes256
            | Crypt::Salsa20
            | Crypt::Blowfish
            | Crypt::Twofish
            | Crypt::Xor
            | Crypt::None => 32,
        }
    }

    /// Per-datagram prefix length (IV or nonce).
    fn iv_len(self) -> usize {
        match self {
            Crypt::Aes256 | Crypt::Aes128 | Crypt::Aes192 | Crypt::Twofish | Crypt::Sm4 => 16,
            Crypt::Blowfish | Crypt::Cast5 | Crypt::TripleDes | Crypt::Tea | Crypt::Xtea => 8,
            Crypt::Salsa20 => 8,
            Crypt::Xor | Crypt::None => 0,
        }
    }
}

/// Derive the 32-byte session key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; 32]);

impl DerivedKey {
    pub fn derive(key: &str, salt: &str) -> DerivedKey {
        let mut out = [0u8; 32];
        pbkdf2_hmac::<Sha1>(key.as_bytes(), salt.as_bytes(), PBKDF2_ROUNDS, &mut out);
        DerivedKey(out)
    }

    fn prefix(&self, len: usize) -> &[u8] {
        &self.0[..len]
    }
}

/// A configured datagram cipher: seal on send, open on receive.
#[derive(Clone)]
pub struct BlockCrypt {
    crypt: Crypt,
    key: DerivedKey,
}

impl BlockCrypt {
    pub fn new(crypt: Crypt, key: &str, salt: &str) -> BlockCrypt {
        BlockCrypt {
            crypt,
            key: DerivedKey::derive(key, salt),
        }
    }

    /// Encrypt one datagram, prepending the IV/nonce.
    pub fn seal(&self, plain: &[u8]) -> Vec<u8> {
        let key = self.key.prefix(self.crypt.key_len());
        match self.crypt {
            Crypt::Aes256 => cfb_seal::<aes::Aes256>(key, plain),
            Crypt::Aes128 => cfb_seal::<aes::Aes128>(key, plain),
            Crypt::Aes192 => cfb_seal::<aes::Aes192>(key, plain),
            Crypt::Twofish => cfb_seal::<twofish::Twofish>(key, plain),
            Crypt::Sm4 => cfb_seal::<sm4::Sm4>(key, plain),
            Crypt::Blowfish => cfb_seal::<blowfish::Blowfish>(key, plain),
            Crypt::Cast5 => cfb_seal::<cast5::Cast5>(key, plain),
            Crypt::TripleDes => cfb_seal::<des::TdesEde3>(key, plain),
            Crypt::Tea => cfb_seal::<Tea>(key, plain),
            Crypt::Xtea => cfb_seal::<Xtea>(key, plain),
            Crypt::Salsa20 => {
                let mut nonce = [0u8; 8];
                rand::thread_rng().fill_bytes(&mut nonce);
                let mut out = Vec::with_capacity(8 + plain.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(plain);
                let mut cipher = salsa20::Salsa20::new_from_slices(key, &nonce)
                    .expect("salsa20 key and nonce sizes are static");
                cipher.apply_keystream(&mut out[8..]);
                out
            }
            Crypt::Xor => {
                let mut out = plain.to_vec();
                for (i, byte) in out.iter_mut().enumerate() {
                    *byte ^= key[i % key.len()];
                }
                out
            }
            Crypt::None => plain.to_vec(),
        }
    }

    /// Decrypt one datagram, stripping the IV/nonce.
    pub fn open(&self, wire: &[u8]) -> Result<Vec<u8>> {
        let iv_len = self.crypt.iv_len();
        if wire.len() < iv_len {
            return Err(Error::protocol(format!(
                "datagram shorter than its {iv_len}-byte IV"
            )));
        }
        let key = self.key.prefix(self.crypt.key_len());
        let (iv, body) = wire.split_at(iv_len);

        Ok(match self.crypt {
            Crypt::Aes256 => cfb_open::<aes::Aes256>(key, iv, body),
            Crypt::Aes128 => cfb_open::<aes::Aes128>(key, iv, body),
            Crypt::Aes192 => cfb_open::<aes::Aes192>(key, iv, body),
            Crypt::Twofish => cfb_open::<twofish::Twofish>(key, iv, body),
            Crypt::Sm4 => cfb_open::<sm4::Sm4>(key, iv, body),
            Crypt::Blowfish => cfb_open::<blowfish::Blowfish>(key, iv, body),
            Crypt::Cast5 => cfb_open::<cast5::Cast5>(key, iv, body),
            Crypt::TripleDes => cfb_open::<des::TdesEde3>(key, iv, body),
            Crypt::Tea => cfb_open::<Tea>(key, iv, body),
            Crypt::Xtea => cfb_open::<Xtea>(key, iv, body),
            Crypt::Salsa20 => {
                let mut out = body.to_vec();
                let mut cipher = salsa20::Salsa20::new_from_slices(key, iv)
                    .expect("salsa20 key and nonce sizes are static");
                cipher.apply_keystream(&mut out);
                out
            }
            Crypt::Xor => {
                let mut out = body.to_vec();
                for (i, byte) in out.iter_mut().enumerate() {
                    *byte ^= key[i % key.len()];
                }
                out
            }
            Crypt::None => body.to_vec(),
        })
    }
}

fn cfb_seal<C>(key: &[u8], plain: &[u8]) -> Vec<u8>
where
    C: BlockEncryptMut + BlockCipher + KeyInit,
    cfb_mode::Encryptor<C>: KeyIvInit,
{
    let iv_len = C::block_size();
    let mut iv = vec![0u8; iv_len];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut data = plain.to_vec();
    cfb_mode::Encryptor::<C>::new_from_slices(key, &iv)
        .expect("cipher key and IV sizes are static")
        .encrypt(&mut data);

    let mut out = iv;
    out.extend_from_slice(&data);
    out
}

fn cfb_open<C>(key: &[u8], iv: &[u8], body: &[u8]) -> Vec<u8>
where
    C: BlockEncryptMut + BlockCipher + KeyInit,
    cfb_mode::Decryptor<C>: KeyIvInit,
{
    let mut data = body.to_vec();
    cfb_mode::Decryptor::<C>::new_from_slices(key, iv)
        .expect("cipher key and IV sizes are static")
        .decrypt(&mut data);
    data
}

/// TEA block cipher (64-bit blocks, 128-bit key, 32 cycles). Not published
/// under the RustCrypto umbrella, so implemented here against the `cipher`
/// traits; only the encrypt direction is needed for CFB.
pub struct Tea {
    key: [u32; 4],
}

impl KeySizeUser for Tea {
    type KeySize = U16;
}

impl KeyInit for Tea {
    fn new(key: &Key<Self>) -> Self {
        Tea {
            key: key_words(key),
        }
    }
}

impl BlockSizeUser for Tea {
    type BlockSize = U8;
}

impl BlockCipher for Tea {}

impl BlockEncrypt for Tea {
    fn encrypt_with_backend(&self, f: impl BlockClosure<BlockSize = Self::BlockSize>) {
        f.call(&mut TeaEncrypt(self))
    }
}

struct TeaEncrypt<'a>(&'a Tea);

impl BlockSizeUser for TeaEncrypt<'_> {
    type BlockSize = U8;
}

impl ParBlocksSizeUser for TeaEncrypt<'_> {
    type ParBlocksSize = U1;
}

impl BlockBackend for TeaEncrypt<'_> {
    fn proc_block(&mut self, mut block: InOut<'_, '_, Block<Self>>) {
        const DELTA: u32 = 0x9E37_79B9;
        let (mut v0, mut v1) = block_words(block.get_in());
        let [k0, k1, k2, k3] = self.0.key;

        let mut sum = 0u32;
        for _ in 0..32 {
            sum = sum.wrapping_add(DELTA);
            v0 = v0.wrapping_add(
                (v1 << 4).wrapping_add(k0) ^ v1.wrapping_add(sum) ^ (v1 >> 5).wrapping_add(k1),
            );
            v1 = v1.wrapping_add(
                (v0 << 4).wrapping_add(k2) ^ v0.wrapping_add(sum) ^ (v0 >> 5).wrapping_add(k3),
            );
        }

        write_block_words(block.get_out(), v0, v1);
    }
}

/// XTEA block cipher (64-bit blocks, 128-bit key, 32 cycles).
pub struct Xtea {
    key: [u32; 4],
}

impl KeySizeUser for Xtea {
    type KeySize = U16;
}

impl KeyInit for Xtea {
    fn new(key: &Key<Self>) -> Self {
        Xtea {
            key: key_words(key),
        }
    }
}

impl BlockSizeUser for Xtea {
    type BlockSize = U8;
}

impl BlockCipher for Xtea {}

impl BlockEncrypt for Xtea {
    fn encrypt_with_backend(&self, f: impl BlockClosure<BlockSize = Self::BlockSize>) {
        f.call(&mut XteaEncrypt(self))
    }
}

struct XteaEncrypt<'a>(&'a Xtea);

impl BlockSizeUser for XteaEncrypt<'_> {
    type BlockSize = U8;
}

impl ParBlocksSizeUser for XteaEncrypt<'_> {
    type ParBlocksSize = U1;
}

impl BlockBackend for XteaEncrypt<'_> {
    fn proc_block(&mut self, mut block: InOut<'_, '_, Block<Self>>) {
        const DELTA: u32 = 0x9E37_79B9;
        let (mut v0, mut v1) = block_words(block.get_in());
        let key = self.0.key;

        let mut sum = 0u32;
        for _ in 0..32 {
            v0 = v0.wrapping_add(
                ((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1)
                    ^ sum.wrapping_add(key[(sum & 3) as usize]),
            );
            sum = sum.wrapping_add(DELTA);
            v1 = v1.wrapping_add(
                ((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0)
                    ^ sum.wrapping_add(key[((sum >> 11) & 3) as usize]),
            );
        }

        write_block_words(block.get_out(), v0, v1);
    }
}

fn key_words(key: &[u8]) -> [u32; 4] {
    let mut words = [0u32; 4];
    for (word, chunk) in words.iter_mut().zip(key.chunks_exact(4)) {
        *word = u32::from_be_bytes(chunk.try_into().expect("4-byte chunk"));
    }
    words
}

fn block_words(block: &[u8]) -> (u32, u32) {
    (
        u32::from_be_bytes(block[..4].try_into().expect("block half")),
        u32::from_be_bytes(block[4..].try_into().expect("block half")),
    )
}

fn write_block_words(block: &mut [u8], v0: u32, v1: u32) {
    block[..4].copy_from_slice(&v0.to_be_bytes());
    block[4..].copy_from_slice(&v1.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_is_deterministic() {
        let a = DerivedKey::derive("creeper", "awman");
        let b = DerivedKey::derive("creeper", "awman");
        let c = DerivedKey::derive("creeper", "different");

        assert_eq!(a.0, b.0);
        assert_ne!(a.0, c.0);
    }

    #[test]
    fn test_crypt_parse() {
        assert_eq!(Crypt::parse("aes"), Some(Crypt::Aes256));
        assert_eq!(Crypt::parse("aes-128"), Some(Crypt::Aes128));
        assert_eq!(Crypt::parse("3des"), Some(Crypt::TripleDes));
        assert_eq!(Crypt::parse("none"), Some(Crypt::None));
        assert_eq!(Crypt::parse("rot13"), None);
    }

    #[test]
    fn test_key_width_prefixes() {
        assert_eq!(Crypt::Aes128.key_len(), 16);
        assert_eq!(Crypt::Sm4.key_len(), 16);
        assert_eq!(Crypt::Aes192.key_len(), 24);
        assert_eq!(Crypt::TripleDes.key_len(), 24);
        assert_eq!(Crypt::Aes256.key_len(), 32);
        assert_eq!(Crypt::Blowfish.key_len(), 32);
    }

    #[test]
    fn test_seal_open_roundtrip_every_cipher() {
        let plain = b"the quick brown fox jumps over the lazy dog";
        for crypt in [
            Crypt::Aes256,
            Crypt::Aes128,
            Crypt::Aes192,
            Crypt::Salsa20,
            Crypt::Blowfish,
            Crypt::Twofish,
            Crypt::Cast5,
            Crypt::TripleDes,
            Crypt::Tea,
            Crypt::Xtea,
            Crypt::Xor,
            Crypt::Sm4,
            Crypt::None,
        ] {
            let bc = BlockCrypt::new(crypt, "key", "salt");
            let wire = bc.seal(plain);
            let opened = bc.open(&wire).unwrap();
            assert_eq!(opened, plain, "roundtrip failed for {crypt:?}");
        }
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext() {
        let plain = vec![0u8; 64];
        let bc = BlockCrypt::new(Crypt::Aes256, "key", "salt");
        let wire = bc.seal(&plain);
        assert_ne!(&wire[16..], plain.as_slice());
    }

    #[test]
    fn test_fresh_iv_per_datagram() {
        let bc = BlockCrypt::new(Crypt::Aes256, "key", "salt");
        let a = bc.seal(b"same plaintext");
        let b = bc.seal(b"same plaintext");
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_garbles() {
        let plain = b"settlement check";
        let good = BlockCrypt::new(Crypt::Aes128, "key", "salt");
        let bad = BlockCrypt::new(Crypt::Aes128, "key", "other-salt");

        let opened = bad.open(&good.seal(plain)).unwrap();
        assert_ne!(opened, plain);
    }

    #[test]
    fn test_truncated_datagram_rejected() {
        let bc = BlockCrypt::new(Crypt::Aes256, "key", "salt");
        assert!(bc.open(&[0u8; 7]).is_err());
    }
}
