use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use base64::engine::general_purpose::URL_SAFE as BASE64_URL;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type HmacSha256 = Hmac<Sha256>;

const SALT_LENGTH: usize = 16;
const IV_LENGTH: usize = 16;
const BLOCK_LENGTH: usize = 16;
const KEY_LENGTH: usize = 32;
const MAC_LENGTH: usize = 32;
const ITER_LENGTH: usize = 4;
const TOKEN_VERSION: u8 = 0x80;
// version || timestamp || iv || one ciphertext block || mac
const MIN_TOKEN_LENGTH: usize = 1 + 8 + IV_LENGTH + BLOCK_LENGTH + MAC_LENGTH;

/// Default PBKDF2 round count for newly encrypted frames. Decryption accepts
/// whatever count the frame itself carries.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Errors produced by the common-codec transforms.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("inflate failure: {0}")]
    Inflate(#[from] std::io::Error),
    #[error("encrypted frame too short")]
    TruncatedFrame,
    #[error("unsupported token version")]
    TokenVersion,
    #[error("signature verification failed")]
    SignatureMismatch,
    #[error("invalid ciphertext padding")]
    Padding,
}

/// Compact (not confidential) encoding: zlib deflate at level 9, then
/// url-safe base64.
pub fn obscure(input: &[u8]) -> String {
    let mut deflater = ZlibEncoder::new(Vec::new(), Compression::new(9));
    deflater
        .write_all(input)
        .expect("deflate into memory cannot fail");
    let compressed = deflater.finish().expect("deflate into memory cannot fail");
    BASE64_URL.encode(compressed)
}

/// Inverse of [`obscure`].
pub fn unobscure(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let compressed = BASE64_URL.decode(input)?;
    let mut inflater = ZlibDecoder::new(compressed.as_slice());
    let mut output = Vec::new();
    inflater.read_to_end(&mut output)?;
    Ok(output)
}

/// Password-based authenticated encryption with the default round count.
///
/// The wire form is `b64url( salt(16) || iterations(4, BE) || token )` where
/// `token` is a Fernet-style AES-128-CBC + HMAC-SHA256 blob keyed by
/// `PBKDF2-HMAC-SHA256(password, salt, iterations, 32)`.
pub fn password_encrypt(message: &[u8], password: &str) -> String {
    password_encrypt_with_iterations(message, password, DEFAULT_ITERATIONS)
}

/// Same as [`password_encrypt`] with an explicit PBKDF2 round count.
pub fn password_encrypt_with_iterations(
    message: &[u8],
    password: &str,
    iterations: u32,
) -> String {
    let mut salt = [0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    let key = derive_key(password, &salt, iterations);
    let token = seal_token(&key, message);

    let mut frame = Vec::with_capacity(SALT_LENGTH + ITER_LENGTH + token.len());
    frame.extend_from_slice(&salt);
    frame.extend_from_slice(&iterations.to_be_bytes());
    frame.extend_from_slice(&token);
    BASE64_URL.encode(frame)
}

/// Decrypt and authenticate a [`password_encrypt`] frame. The salt and round
/// count are read from the frame itself.
pub fn password_decrypt(data: &[u8], password: &str) -> Result<Vec<u8>, CodecError> {
    let decoded = BASE64_URL.decode(data)?;
    if decoded.len() < SALT_LENGTH + ITER_LENGTH + MIN_TOKEN_LENGTH {
        return Err(CodecError::TruncatedFrame);
    }
    let (salt, rest) = decoded.split_at(SALT_LENGTH);
    let (iter_bytes, token) = rest.split_at(ITER_LENGTH);
    let mut iterations = [0u8; ITER_LENGTH];
    iterations.copy_from_slice(iter_bytes);
    let key = derive_key(password, salt, u32::from_be_bytes(iterations));
    open_token(&key, token)
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    key
}

fn seal_token(key: &[u8; KEY_LENGTH], message: &[u8]) -> Vec<u8> {
    let (sign_key, enc_key) = key.split_at(KEY_LENGTH / 2);
    let mut iv = [0u8; IV_LENGTH];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes128CbcEnc::new(
        GenericArray::from_slice(enc_key),
        GenericArray::from_slice(&iv),
    );
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(message);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);

    let mut token = Vec::with_capacity(MIN_TOKEN_LENGTH + ciphertext.len());
    token.push(TOKEN_VERSION);
    token.extend_from_slice(&timestamp.to_be_bytes());
    token.extend_from_slice(&iv);
    token.extend_from_slice(&ciphertext);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(sign_key)
        .expect("hmac accepts any key length");
    mac.update(&token);
    token.extend_from_slice(&mac.finalize().into_bytes());
    token
}

fn open_token(key: &[u8; KEY_LENGTH], token: &[u8]) -> Result<Vec<u8>, CodecError> {
    if token.len() < MIN_TOKEN_LENGTH {
        return Err(CodecError::TruncatedFrame);
    }
    let (sign_key, enc_key) = key.split_at(KEY_LENGTH / 2);
    let (body, tag) = token.split_at(token.len() - MAC_LENGTH);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(sign_key)
        .expect("hmac accepts any key length");
    mac.update(body);
    mac.verify_slice(tag)
        .map_err(|_| CodecError::SignatureMismatch)?;

    if body[0] != TOKEN_VERSION {
        return Err(CodecError::TokenVersion);
    }
    let iv = &body[1 + 8..1 + 8 + IV_LENGTH];
    let ciphertext = &body[1 + 8 + IV_LENGTH..];
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LENGTH != 0 {
        return Err(CodecError::Padding);
    }

    let cipher = Aes128CbcDec::new(
        GenericArray::from_slice(enc_key),
        GenericArray::from_slice(iv),
    );
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CodecError::Padding)
}
