//! Block-level RSA operations and the chunked wire framing
//!
//! RSA with PKCS#1 v1.5 padding can only process `key_bits / 8 - 11` bytes
//! per operation, so every message is split into blocks. Encrypted blocks
//! are joined with [`BLOCK_DELIMITER`] before base64 encoding; signature
//! blocks are fixed-width and concatenated directly.

use base64::{engine::general_purpose, Engine as _};
use rand::rngs::OsRng;
use rsa::{
    hazmat::rsa_encrypt,
    pkcs1::DecodeRsaPublicKey,
    pkcs8::DecodePublicKey,
    traits::PublicKeyParts,
    BigUint, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};

use crate::error::{SecRestError, SecRestResult};

/// Separator placed between ciphertext blocks before base64 encoding
pub const BLOCK_DELIMITER: &[u8] = b"_-_SKINA_-_";

/// PKCS#1 v1.5 padding overhead in bytes
pub const PKCS1_OVERHEAD: usize = 11;

/// Key size used when the caller does not say otherwise
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Largest plaintext that fits in one block for a key of `key_bits`
pub fn plaintext_block_size(key_bits: usize) -> usize {
    (key_bits / 8).saturating_sub(PKCS1_OVERHEAD)
}

/// Size of one ciphertext (or signature) block for a key of `key_bits`
pub fn ciphertext_block_size(key_bits: usize) -> usize {
    key_bits / 8
}

/// Parse a PEM public key, accepting SubjectPublicKeyInfo or PKCS#1
pub fn parse_public_key(pem: &str) -> SecRestResult<RsaPublicKey> {
    let pem = pem.trim();
    match RsaPublicKey::from_public_key_pem(pem) {
        Ok(key) => Ok(key),
        Err(spki_err) => RsaPublicKey::from_pkcs1_pem(pem)
            .map_err(|_| SecRestError::InvalidPublicKey(spki_err.to_string())),
    }
}

/// Modulus size in bits of a PEM public key, if it parses
pub fn public_key_bits(pem: &str) -> Option<usize> {
    parse_public_key(pem).ok().map(|key| key.size() * 8)
}

/// Split `message` into plaintext blocks. An empty message still yields one
/// (empty) block so that it survives a round trip.
fn plaintext_blocks(message: &[u8], key_bits: usize) -> Option<Vec<&[u8]>> {
    let block_size = plaintext_block_size(key_bits);
    if block_size == 0 {
        return None;
    }
    if message.is_empty() {
        return Some(vec![message]);
    }
    Some(message.chunks(block_size).collect())
}

/// Encrypt `message` for the holder of `recipient` and frame the result.
///
/// Returns `None` if any block fails to encrypt.
pub fn encrypt_framed(message: &[u8], recipient: &RsaPublicKey, key_bits: usize) -> Option<String> {
    let mut rng = OsRng;
    let mut framed = Vec::new();

    for (index, block) in plaintext_blocks(message, key_bits)?.into_iter().enumerate() {
        let encrypted = recipient.encrypt(&mut rng, Pkcs1v15Encrypt, block).ok()?;
        if index > 0 {
            framed.extend_from_slice(BLOCK_DELIMITER);
        }
        framed.extend_from_slice(&encrypted);
    }

    Some(general_purpose::STANDARD.encode(framed))
}

/// Base64-decode a framed ciphertext and split it into its blocks
pub fn unframe(ciphertext: &str) -> Option<Vec<Vec<u8>>> {
    let raw = general_purpose::STANDARD.decode(ciphertext.trim()).ok()?;
    Some(split_on_delimiter(&raw).into_iter().map(<[u8]>::to_vec).collect())
}

fn split_on_delimiter(raw: &[u8]) -> Vec<&[u8]> {
    let mut blocks = Vec::new();
    let mut start = 0;
    let mut cursor = 0;

    while cursor + BLOCK_DELIMITER.len() <= raw.len() {
        if &raw[cursor..cursor + BLOCK_DELIMITER.len()] == BLOCK_DELIMITER {
            blocks.push(&raw[start..cursor]);
            cursor += BLOCK_DELIMITER.len();
            start = cursor;
        } else {
            cursor += 1;
        }
    }
    blocks.push(&raw[start..]);
    blocks
}

/// Decrypt one ciphertext block with a private key
pub fn decrypt_block(key: &RsaPrivateKey, block: &[u8]) -> Option<Vec<u8>> {
    key.decrypt(Pkcs1v15Encrypt, block).ok()
}

/// Seal a set of plaintext bytes with the private key (PKCS#1 v1.5 type 1,
/// no digest prefix). Blocks are fixed-width, concatenated, base64-encoded.
pub fn seal_framed(payload: &[u8], key: &RsaPrivateKey) -> Option<String> {
    let key_bits = key.size() * 8;
    let mut sealed = Vec::new();

    for block in plaintext_blocks(payload, key_bits)? {
        let signature = key.sign(Pkcs1v15Sign::new_unprefixed(), block).ok()?;
        sealed.extend_from_slice(&signature);
    }

    Some(general_purpose::STANDARD.encode(sealed))
}

/// Recover the bytes sealed by [`seal_framed`] using the matching public key.
///
/// Every block must open, otherwise the whole seal is rejected.
pub fn open_sealed(sealed: &str, key: &RsaPublicKey, key_bits: usize) -> Option<Vec<u8>> {
    let raw = general_purpose::STANDARD.decode(sealed.trim()).ok()?;
    let block_size = ciphertext_block_size(key_bits);
    if block_size == 0 || raw.is_empty() || raw.len() % block_size != 0 {
        return None;
    }

    let mut recovered = Vec::new();
    for block in raw.chunks(block_size) {
        recovered.extend_from_slice(&open_block(key, block)?);
    }
    Some(recovered)
}

/// Raw public-key operation on one sealed block followed by removal of the
/// type 1 padding (`00 01 FF.. 00 data`).
fn open_block(key: &RsaPublicKey, block: &[u8]) -> Option<Vec<u8>> {
    let k = key.size();
    if block.len() != k {
        return None;
    }

    let c = BigUint::from_bytes_be(block);
    if &c >= key.n() {
        return None;
    }
    let m = rsa_encrypt(key, &c).ok()?.to_bytes_be();
    if m.len() > k {
        return None;
    }

    let mut em = vec![0u8; k - m.len()];
    em.extend_from_slice(&m);
    strip_signature_padding(&em)
}

fn strip_signature_padding(em: &[u8]) -> Option<Vec<u8>> {
    if em.len() < PKCS1_OVERHEAD || em[0] != 0x00 || em[1] != 0x01 {
        return None;
    }
    let padded = &em[2..];
    let separator = padded.iter().position(|&b| b != 0xff)?;
    if separator < 8 || padded[separator] != 0x00 {
        return None;
    }
    Some(padded[separator + 1..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut OsRng, 1024).unwrap()
    }

    #[test]
    fn test_block_sizes() {
        assert_eq!(plaintext_block_size(2048), 245);
        assert_eq!(ciphertext_block_size(2048), 256);
        assert_eq!(plaintext_block_size(1024), 117);
    }

    #[test]
    fn test_long_message_is_chunked() {
        let key = test_key();
        let public = RsaPublicKey::from(&key);
        let message = "This message needs more than one RSA block to travel. ".repeat(6);

        let framed = encrypt_framed(message.as_bytes(), &public, 1024).unwrap();
        let blocks = unframe(&framed).unwrap();
        let expected = (message.len() + 116) / 117;
        assert_eq!(blocks.len(), expected);

        let mut decrypted = Vec::new();
        for block in &blocks {
            assert_eq!(block.len(), 128);
            decrypted.extend(decrypt_block(&key, block).unwrap());
        }
        assert_eq!(decrypted, message.as_bytes());
    }

    #[test]
    fn test_roundtrip_for_each_key_size() {
        let message = "request parameters that span a few blocks at any key size ".repeat(10);
        for bits in [1024, 2048] {
            let key = RsaPrivateKey::new(&mut OsRng, bits).unwrap();
            let public = RsaPublicKey::from(&key);

            let framed = encrypt_framed(message.as_bytes(), &public, bits).unwrap();
            let blocks = unframe(&framed).unwrap();
            let block_size = plaintext_block_size(bits);
            assert_eq!(blocks.len(), (message.len() + block_size - 1) / block_size);

            let decrypted: Vec<u8> = blocks
                .iter()
                .flat_map(|block| decrypt_block(&key, block).unwrap())
                .collect();
            assert_eq!(decrypted, message.as_bytes(), "{} bit key", bits);
        }
    }

    #[test]
    fn test_oversized_block_fails() {
        let key = test_key();
        let public = RsaPublicKey::from(&key);
        // Claiming a 2048-bit key produces 245-byte blocks, too big for 1024 bits.
        let message = vec![b'x'; 300];
        assert!(encrypt_framed(&message, &public, 2048).is_none());
    }

    #[test]
    fn test_seal_and_open() {
        let key = test_key();
        let public = RsaPublicKey::from(&key);
        let payload = b"anyone can read this, only one key could have written it".repeat(4);

        let sealed = seal_framed(&payload, &key).unwrap();
        assert_eq!(open_sealed(&sealed, &public, 1024).unwrap(), payload);

        let other = RsaPublicKey::from(&test_key());
        assert!(open_sealed(&sealed, &other, 1024).is_none());
    }

    #[test]
    fn test_split_keeps_empty_segments() {
        let mut raw = b"abc".to_vec();
        raw.extend_from_slice(BLOCK_DELIMITER);
        raw.extend_from_slice(b"def");
        assert_eq!(split_on_delimiter(&raw), vec![&b"abc"[..], &b"def"[..]]);
        assert_eq!(split_on_delimiter(b"plain"), vec![&b"plain"[..]]);
    }

    #[test]
    fn test_parse_public_key_formats() {
        use rsa::pkcs1::{EncodeRsaPublicKey, LineEnding};
        use rsa::pkcs8::EncodePublicKey;

        let public = RsaPublicKey::from(&test_key());
        let spki = public.to_public_key_pem(LineEnding::LF).unwrap();
        let pkcs1 = public.to_pkcs1_pem(LineEnding::LF).unwrap();

        assert_eq!(parse_public_key(&spki).unwrap(), public);
        assert_eq!(parse_public_key(&pkcs1).unwrap(), public);
        assert!(parse_public_key("not a key").is_err());
        assert_eq!(public_key_bits(&spki), Some(1024));
    }
}
