use std::str;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use data_encoding::BASE64;
use url::Url;

use crate::error::Error;
use crate::model::{BucketRange, Namespace};

const INIT32: u32 = 0x811c9dc5;
const PRIME32: u32 = 0x01000193;

fn fnv1a32(data: &str) -> u32 {
    data.as_bytes()
        .iter()
        .fold(INIT32, |hash, &byte| (hash ^ (byte as u32)).wrapping_mul(PRIME32))
}

/// Deterministic bucketing hash in `[0, 1)`. Unknown versions hash nothing.
pub fn hash(seed: &str, value: &str, version: i32) -> Option<f32> {
    match version {
        1 => {
            let n = fnv1a32(&format!("{}{}", value, seed));
            Some((n % 1000) as f32 / 1000.0)
        }
        2 => {
            let n = fnv1a32(&fnv1a32(&format!("{}{}", seed, value)).to_string());
            Some((n % 10000) as f32 / 10000.0)
        }
        _ => None,
    }
}

pub fn in_range(n: f32, range: &BucketRange) -> bool {
    (n >= range.range_start) && (n < range.range_end)
}

pub fn in_namespace(user_id: &str, namespace: &Namespace) -> bool {
    match hash(&format!("__{}", namespace.id), user_id, 1) {
        Some(n) => (n >= namespace.range_start) && (n < namespace.range_end),
        None => false,
    }
}

pub fn get_equal_weights(num_variations: i32) -> Vec<f32> {
    if num_variations < 1 {
        vec![]
    } else {
        vec![1.0 / num_variations as f32; num_variations as usize]
    }
}

/// Builds one half-open range per variation. Coverage trims each range's end
/// but the untrimmed cumulative weight is carried forward, so later ranges
/// keep their natural starting offsets under partial coverage.
pub fn get_bucket_ranges(
    num_variations: i32,
    coverage: f32,
    weights: Option<Vec<f32>>,
) -> Vec<BucketRange> {
    let cov = coverage.clamp(0.0, 1.0);
    let equalized_weights = weights
        .filter(|w| num_variations as usize == w.len() && (w.iter().sum::<f32>() - 1.0).abs() <= 0.01)
        .unwrap_or_else(|| get_equal_weights(num_variations));

    let mut cumulative = 0.0;
    equalized_weights
        .into_iter()
        .map(|w| {
            let start = cumulative;
            cumulative += w;
            BucketRange {
                range_start: start,
                range_end: start + cov * w,
            }
        })
        .collect()
}

pub fn choose_variation(n: f32, ranges: &[BucketRange]) -> i32 {
    ranges
        .iter()
        .position(|range| in_range(n, range))
        .map(|i| i as i32)
        .unwrap_or(-1)
}

/// Parses `?<id>=<variation>` out of the page URL; only indices within
/// `[0, num_variations)` count as an override.
pub fn get_query_string_override(id: &str, url: &str, num_variations: i32) -> Option<i32> {
    let parsed_url = Url::parse(url).ok()?;

    for (key, value) in parsed_url.query_pairs() {
        if key == id {
            let variation = value.parse::<i32>().ok()?;
            if variation >= 0 && variation < num_variations {
                return Some(variation);
            } else {
                break;
            }
        }
    }

    None
}

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Decrypts an `<iv>.<ciphertext>` payload (both halves base64) with a
/// base64 AES-CBC key of 16 or 32 bytes, PKCS7 padded.
pub fn decrypt_string(encrypted_string: &str, decryption_key: &str) -> Result<String, Error> {
    let split: Vec<&str> = encrypted_string.splitn(2, '.').collect();
    if split.len() != 2 {
        return Err(Error::Decryption(
            "payload is not of the form <iv>.<ciphertext>".to_string(),
        ));
    }

    let iv = BASE64
        .decode(split[0].as_bytes())
        .map_err(|e| Error::Decryption(format!("invalid iv base64: {}", e)))?;
    let mut encrypted_data = BASE64
        .decode(split[1].as_bytes())
        .map_err(|e| Error::Decryption(format!("invalid ciphertext base64: {}", e)))?;
    let key = BASE64
        .decode(decryption_key.as_bytes())
        .map_err(|e| Error::Decryption(format!("invalid key base64: {}", e)))?;

    let decrypted = match key.len() {
        16 => Aes128CbcDec::new_from_slices(&key, &iv)
            .map_err(|e| Error::Decryption(format!("invalid key/iv length: {}", e)))?
            .decrypt_padded_mut::<Pkcs7>(&mut encrypted_data)
            .map_err(|e| Error::Decryption(format!("unpadding failed: {}", e)))?,
        32 => Aes256CbcDec::new_from_slices(&key, &iv)
            .map_err(|e| Error::Decryption(format!("invalid key/iv length: {}", e)))?
            .decrypt_padded_mut::<Pkcs7>(&mut encrypted_data)
            .map_err(|e| Error::Decryption(format!("unpadding failed: {}", e)))?,
        other => {
            return Err(Error::Decryption(format!(
                "unsupported key length {} (expected 16 or 32 bytes)",
                other
            )))
        }
    };

    let plaintext = str::from_utf8(decrypted)
        .map_err(|e| Error::Decryption(format!("plaintext is not utf-8: {}", e)))?;
    Ok(plaintext.to_string())
}
