//! Cipher helpers behind the script `aes` and `rsa` host functions.
//!
//! Both take JCA-style transformation strings (`AES/CBC/PKCS7Padding`,
//! `RSA/ECB/OAEPWithSHA-1AndMGF1Padding`) and text in, text out: input is
//! UTF-8 or base64, output is base64 or UTF-8 (lossy).

use aes::cipher::block_padding::{NoPadding, Pkcs7, UnpadError};
use aes::cipher::{
    BlockCipher, BlockDecryptMut, BlockEncryptMut, InvalidLength, KeyInit, KeyIvInit,
};
use aes::{Aes128, Aes192, Aes256};
use base64::{engine::general_purpose::STANDARD, Engine};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

use crate::error::SpiderError;

const AES_BLOCK: usize = 16;

/// PKCS#1 v1.5 padding overhead per RSA block.
const PKCS1_OVERHEAD: usize = 11;

/// OAEP (SHA-1) padding overhead per RSA block.
const OAEP_SHA1_OVERHEAD: usize = 2 * 20 + 2;

fn crypto_err(msg: impl Into<String>) -> SpiderError {
    SpiderError::Crypto(msg.into())
}

/// Decode script input: base64 (URL-safe alphabet tolerated) or UTF-8.
fn decode_input(input: &str, base64: bool) -> Result<Vec<u8>, SpiderError> {
    if !base64 {
        return Ok(input.as_bytes().to_vec());
    }
    let normalized: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    STANDARD
        .decode(normalized)
        .map_err(|e| crypto_err(format!("bad base64 input: {e}")))
}

fn encode_output(bytes: &[u8], base64: bool) -> String {
    if base64 {
        STANDARD.encode(bytes)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

// ─── AES ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chaining {
    Ecb,
    Cbc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Padding {
    Pkcs7,
    None,
}

fn parse_aes_mode(mode: &str) -> Result<(Chaining, Padding), SpiderError> {
    let parts: Vec<String> = mode
        .split('/')
        .map(|p| p.trim().to_ascii_uppercase())
        .collect();
    if parts.first().map(String::as_str) != Some("AES") {
        return Err(crypto_err(format!("unsupported cipher '{mode}'")));
    }
    let chaining = match parts.get(1).map(String::as_str) {
        None | Some("ECB") => Chaining::Ecb,
        Some("CBC") => Chaining::Cbc,
        Some(other) => return Err(crypto_err(format!("unsupported AES mode {other}"))),
    };
    let padding = match parts.get(2).map(String::as_str) {
        None => Padding::Pkcs7,
        Some(p) if p.starts_with("PKCS5") || p.starts_with("PKCS7") => Padding::Pkcs7,
        Some("NOPADDING") => Padding::None,
        Some(other) => return Err(crypto_err(format!("unsupported AES padding {other}"))),
    };
    Ok((chaining, padding))
}

/// Zero-pad (or cut) a key to the nearest AES key size.
fn fit_key(key: &[u8]) -> Vec<u8> {
    let size = match key.len() {
        0..=16 => 16,
        17..=24 => 24,
        _ => 32,
    };
    let mut fitted = key.to_vec();
    fitted.resize(size, 0);
    fitted
}

fn fit_iv(iv: &[u8]) -> Vec<u8> {
    let mut fitted = iv.to_vec();
    fitted.resize(AES_BLOCK, 0);
    fitted
}

/// Arguments of the script `aes(mode, encrypt, input, inBase64, key, iv, outBase64)`.
#[derive(Debug, Clone)]
pub struct AesRequest<'a> {
    pub mode: &'a str,
    pub encrypt: bool,
    pub input: &'a str,
    pub in_base64: bool,
    pub key: &'a str,
    pub iv: Option<&'a str>,
    pub out_base64: bool,
}

pub fn aes(request: &AesRequest<'_>) -> Result<String, SpiderError> {
    let (chaining, padding) = parse_aes_mode(request.mode)?;
    let data = decode_input(request.input, request.in_base64)?;
    let key = fit_key(request.key.as_bytes());
    let iv = fit_iv(request.iv.unwrap_or_default().as_bytes());

    let output = match key.len() {
        16 => run_block_cipher::<Aes128>(chaining, padding, request.encrypt, &key, &iv, &data),
        24 => run_block_cipher::<Aes192>(chaining, padding, request.encrypt, &key, &iv, &data),
        _ => run_block_cipher::<Aes256>(chaining, padding, request.encrypt, &key, &iv, &data),
    }?;
    Ok(encode_output(&output, request.out_base64))
}

fn run_block_cipher<C>(
    chaining: Chaining,
    padding: Padding,
    encrypt: bool,
    key: &[u8],
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, SpiderError>
where
    C: BlockCipher + BlockEncryptMut + BlockDecryptMut + KeyInit,
{
    let bad_key = |e: InvalidLength| crypto_err(format!("invalid key or iv: {e}"));
    let unpad = |_: UnpadError| crypto_err("decryption failed: bad padding");

    if padding == Padding::None && data.len() % AES_BLOCK != 0 {
        return Err(crypto_err(format!(
            "input length {} is not a multiple of {AES_BLOCK} without padding",
            data.len()
        )));
    }

    match (chaining, encrypt) {
        (Chaining::Cbc, true) => {
            let cipher = cbc::Encryptor::<C>::new_from_slices(key, iv).map_err(bad_key)?;
            Ok(match padding {
                Padding::Pkcs7 => cipher.encrypt_padded_vec_mut::<Pkcs7>(data),
                Padding::None => cipher.encrypt_padded_vec_mut::<NoPadding>(data),
            })
        }
        (Chaining::Cbc, false) => {
            let cipher = cbc::Decryptor::<C>::new_from_slices(key, iv).map_err(bad_key)?;
            match padding {
                Padding::Pkcs7 => cipher.decrypt_padded_vec_mut::<Pkcs7>(data),
                Padding::None => cipher.decrypt_padded_vec_mut::<NoPadding>(data),
            }
            .map_err(unpad)
        }
        (Chaining::Ecb, true) => {
            let cipher = ecb::Encryptor::<C>::new_from_slice(key).map_err(bad_key)?;
            Ok(match padding {
                Padding::Pkcs7 => cipher.encrypt_padded_vec_mut::<Pkcs7>(data),
                Padding::None => cipher.encrypt_padded_vec_mut::<NoPadding>(data),
            })
        }
        (Chaining::Ecb, false) => {
            let cipher = ecb::Decryptor::<C>::new_from_slice(key).map_err(bad_key)?;
            match padding {
                Padding::Pkcs7 => cipher.decrypt_padded_vec_mut::<Pkcs7>(data),
                Padding::None => cipher.decrypt_padded_vec_mut::<NoPadding>(data),
            }
            .map_err(unpad)
        }
    }
}

// ─── RSA ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RsaPadding {
    Pkcs1,
    OaepSha1,
}

fn parse_rsa_mode(mode: &str) -> RsaPadding {
    if mode.to_ascii_uppercase().contains("OAEP") {
        RsaPadding::OaepSha1
    } else {
        RsaPadding::Pkcs1
    }
}

/// Strip PEM armor and whitespace, then base64-decode the DER body.
fn pem_body(key: &str) -> Result<Vec<u8>, SpiderError> {
    let body: String = key
        .lines()
        .filter(|line| !line.trim_start().starts_with("-----"))
        .flat_map(|line| line.chars())
        .filter(|c| !c.is_whitespace())
        .collect();
    STANDARD
        .decode(body)
        .map_err(|e| crypto_err(format!("bad key encoding: {e}")))
}

fn public_key(key: &str) -> Result<RsaPublicKey, SpiderError> {
    let der = pem_body(key)?;
    RsaPublicKey::from_public_key_der(&der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
        .map_err(|e| crypto_err(format!("bad public key: {e}")))
}

fn private_key(key: &str) -> Result<RsaPrivateKey, SpiderError> {
    let der = pem_body(key)?;
    RsaPrivateKey::from_pkcs8_der(&der)
        .or_else(|_| RsaPrivateKey::from_pkcs1_der(&der))
        .map_err(|e| crypto_err(format!("bad private key: {e}")))
}

/// Arguments of the script `rsa(mode, pub, encrypt, input, inBase64, key, outBase64)`.
#[derive(Debug, Clone)]
pub struct RsaRequest<'a> {
    pub mode: &'a str,
    pub public: bool,
    pub encrypt: bool,
    pub input: &'a str,
    pub in_base64: bool,
    pub key: &'a str,
    pub out_base64: bool,
}

/// RSA over arbitrarily long input, processed block by block.
///
/// Private-key encryption produces PKCS#1 type-1 blocks and public-key
/// decryption reverses them; OAEP is only defined for the usual direction.
pub fn rsa(request: &RsaRequest<'_>) -> Result<String, SpiderError> {
    let padding = parse_rsa_mode(request.mode);
    let data = decode_input(request.input, request.in_base64)?;

    let output = match (request.public, request.encrypt) {
        (true, true) => {
            let key = public_key(request.key)?;
            let size = key.size();
            let chunk = block_payload(size, padding)?;
            let mut out = Vec::with_capacity(data.len().div_ceil(chunk) * size);
            for block in data.chunks(chunk) {
                let encrypted = match padding {
                    RsaPadding::Pkcs1 => key.encrypt(&mut OsRng, Pkcs1v15Encrypt, block),
                    RsaPadding::OaepSha1 => key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), block),
                }
                .map_err(|e| crypto_err(format!("encryption failed: {e}")))?;
                out.extend_from_slice(&encrypted);
            }
            out
        }
        (false, false) => {
            let key = private_key(request.key)?;
            let mut out = Vec::with_capacity(data.len());
            for block in data.chunks(key.size()) {
                let decrypted = match padding {
                    RsaPadding::Pkcs1 => key.decrypt(Pkcs1v15Encrypt, block),
                    RsaPadding::OaepSha1 => key.decrypt(Oaep::new::<Sha1>(), block),
                }
                .map_err(|e| crypto_err(format!("decryption failed: {e}")))?;
                out.extend_from_slice(&decrypted);
            }
            out
        }
        (false, true) => {
            if padding == RsaPadding::OaepSha1 {
                return Err(crypto_err("OAEP is not defined for private-key encryption"));
            }
            let key = private_key(request.key)?;
            let chunk = block_payload(key.size(), padding)?;
            let mut out = Vec::new();
            for block in data.chunks(chunk) {
                let signed = key
                    .sign(Pkcs1v15Sign::new_unprefixed(), block)
                    .map_err(|e| crypto_err(format!("encryption failed: {e}")))?;
                out.extend_from_slice(&signed);
            }
            out
        }
        (true, false) => {
            if padding == RsaPadding::OaepSha1 {
                return Err(crypto_err("OAEP is not defined for public-key decryption"));
            }
            let key = public_key(request.key)?;
            let mut out = Vec::new();
            for block in data.chunks(key.size()) {
                out.extend_from_slice(&public_decrypt_block(&key, block)?);
            }
            out
        }
    };

    Ok(encode_output(&output, request.out_base64))
}

fn block_payload(key_size: usize, padding: RsaPadding) -> Result<usize, SpiderError> {
    let overhead = match padding {
        RsaPadding::Pkcs1 => PKCS1_OVERHEAD,
        RsaPadding::OaepSha1 => OAEP_SHA1_OVERHEAD,
    };
    key_size
        .checked_sub(overhead)
        .filter(|n| *n > 0)
        .ok_or_else(|| crypto_err(format!("key of {key_size} bytes is too small")))
}

/// Raw `c^e mod n`, then strip the `00 01 FF.. 00` type-1 padding.
fn public_decrypt_block(key: &RsaPublicKey, block: &[u8]) -> Result<Vec<u8>, SpiderError> {
    let size = key.size();
    let c = BigUint::from_bytes_be(block);
    if &c >= key.n() {
        return Err(crypto_err("ciphertext block out of range"));
    }
    let m = c.modpow(key.e(), key.n()).to_bytes_be();
    let mut em = vec![0u8; size.saturating_sub(m.len())];
    em.extend_from_slice(&m);

    if em.len() < PKCS1_OVERHEAD || em[0] != 0 || em[1] != 1 {
        return Err(crypto_err("decryption failed: bad block type"));
    }
    let separator = em[2..]
        .iter()
        .position(|b| *b != 0xFF)
        .map(|i| i + 2)
        .filter(|i| em[*i] == 0)
        .ok_or_else(|| crypto_err("decryption failed: bad padding"))?;
    Ok(em[separator + 1..].to_vec())
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    fn aes_request<'a>(mode: &'a str, encrypt: bool, input: &'a str, iv: Option<&'a str>) -> AesRequest<'a> {
        AesRequest {
            mode,
            encrypt,
            input,
            in_base64: !encrypt,
            key: "0123456789abcdef",
            iv,
            out_base64: encrypt,
        }
    }

    #[test]
    fn test_aes_ecb_round_trip() {
        let out = aes(&aes_request("AES/ECB/PKCS5Padding", true, "hello", None)).unwrap();
        let back = aes(&aes_request("AES/ECB/PKCS5Padding", false, &out, None)).unwrap();
        assert_eq!(back, "hello");
        assert_eq!(STANDARD.decode(&out).unwrap().len(), 16);
    }

    #[test]
    fn test_aes_cbc_uses_iv() {
        let a = aes(&aes_request("AES/CBC/PKCS7Padding", true, "payload", Some("iv-one"))).unwrap();
        let b = aes(&aes_request("AES/CBC/PKCS7Padding", true, "payload", Some("iv-two"))).unwrap();
        assert_ne!(a, b);
        let back = aes(&aes_request("AES/CBC/PKCS7Padding", false, &a, Some("iv-one"))).unwrap();
        assert_eq!(back, "payload");
    }

    #[test]
    fn test_aes_short_key_is_zero_padded() {
        let request = AesRequest {
            key: "abc",
            ..aes_request("AES", true, "x", None)
        };
        let padded = AesRequest {
            key: "abc\0\0\0\0\0\0\0\0\0\0\0\0\0",
            ..aes_request("AES", true, "x", None)
        };
        assert_eq!(aes(&request).unwrap(), aes(&padded).unwrap());
    }

    #[test]
    fn test_aes_url_safe_base64_input() {
        let out = aes(&aes_request("AES/ECB/PKCS5Padding", true, "???>>>", None)).unwrap();
        let url_safe = out.replace('+', "-").replace('/', "_");
        let back = aes(&aes_request("AES/ECB/PKCS5Padding", false, &url_safe, None)).unwrap();
        assert_eq!(back, "???>>>");
    }

    #[test]
    fn test_aes_no_padding_requires_full_blocks() {
        assert!(aes(&aes_request("AES/ECB/NoPadding", true, "short", None)).is_err());
        assert!(aes(&aes_request("AES/ECB/NoPadding", true, "exactly16bytes!!", None)).is_ok());
    }

    #[test]
    fn test_aes_rejects_unknown_mode() {
        assert!(aes(&aes_request("AES/GCM/NoPadding", true, "x", None)).is_err());
        assert!(aes(&aes_request("DES", true, "x", None)).is_err());
    }

    fn keypair() -> (String, String) {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        (
            public.to_public_key_pem(LineEnding::LF).unwrap(),
            private.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
        )
    }

    fn rsa_request<'a>(mode: &'a str, public: bool, encrypt: bool, input: &'a str, key: &'a str) -> RsaRequest<'a> {
        RsaRequest {
            mode,
            public,
            encrypt,
            input,
            in_base64: !encrypt,
            key,
            out_base64: encrypt,
        }
    }

    #[test]
    fn test_rsa_public_encrypt_private_decrypt() {
        let (public, private) = keypair();
        let long = "x".repeat(300);
        for mode in ["RSA/ECB/PKCS1Padding", "RSA/ECB/OAEPWithSHA-1AndMGF1Padding"] {
            let sealed = rsa(&rsa_request(mode, true, true, &long, &public)).unwrap();
            let opened = rsa(&rsa_request(mode, false, false, &sealed, &private)).unwrap();
            assert_eq!(opened, long, "mode {mode}");
        }
    }

    #[test]
    fn test_rsa_private_encrypt_public_decrypt() {
        let (public, private) = keypair();
        let sealed = rsa(&rsa_request("RSA", false, true, "signed text", &private)).unwrap();
        let opened = rsa(&rsa_request("RSA", true, false, &sealed, &public)).unwrap();
        assert_eq!(opened, "signed text");
    }

    #[test]
    fn test_rsa_bad_key() {
        assert!(matches!(
            rsa(&rsa_request("RSA", true, true, "x", "not a key")),
            Err(SpiderError::Crypto(_))
        ));
    }
}
