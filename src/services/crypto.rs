use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use ring::{aead, pbkdf2, rand::{SecureRandom, SystemRandom}};
use std::num::NonZeroU32;

// At-rest encryption for the extraction service API key kept in the
// settings table. Payload layout: enc:<salt>:<nonce>:<ciphertext+tag>.

const APP_SECRET: &[u8] = b"ordersnap-secret-v1";
const PBKDF2_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;

pub fn encrypt(plaintext: &str) -> Result<String> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| anyhow!("failed to generate salt"))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| anyhow!("failed to generate nonce"))?;

    let key = derive_key(&salt)?;
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);
    let mut in_out = plaintext.as_bytes().to_vec();
    key.seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| anyhow!("encryption failed"))?;

    Ok(format!(
        "enc:{}:{}:{}",
        general_purpose::STANDARD.encode(salt),
        general_purpose::STANDARD.encode(nonce_bytes),
        general_purpose::STANDARD.encode(in_out)
    ))
}

pub fn decrypt(payload: &str) -> Result<String> {
    let parts: Vec<&str> = payload.split(':').collect();
    if parts.len() != 4 || parts[0] != "enc" {
        return Err(anyhow!("unknown encrypted format"));
    }

    let salt = general_purpose::STANDARD
        .decode(parts[1])
        .map_err(|e| anyhow!("decode salt: {}", e))?;
    let nonce_bytes = general_purpose::STANDARD
        .decode(parts[2])
        .map_err(|e| anyhow!("decode nonce: {}", e))?;
    let mut data = general_purpose::STANDARD
        .decode(parts[3])
        .map_err(|e| anyhow!("decode ciphertext: {}", e))?;

    let key = derive_key(&salt)?;
    let nonce = aead::Nonce::assume_unique_for_key(
        nonce_bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("invalid nonce length"))?,
    );

    let decrypted = key
        .open_in_place(nonce, aead::Aad::empty(), &mut data)
        .map_err(|_| anyhow!("decryption failed"))?;
    Ok(String::from_utf8(decrypted.to_vec())?)
}

fn derive_key(salt: &[u8]) -> Result<aead::LessSafeKey> {
    let mut key_bytes = [0u8; 32];
    let iterations =
        NonZeroU32::new(PBKDF2_ITERATIONS).ok_or_else(|| anyhow!("invalid iterations"))?;
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        APP_SECRET,
        &mut key_bytes,
    );
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
        .map_err(|_| anyhow!("invalid key material"))?;
    Ok(aead::LessSafeKey::new(unbound))
}
