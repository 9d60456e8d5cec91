//! Bit-plane steganography for RGBA pixel buffers
//!
//! Hides a text payload in the least-significant bits of an image's color
//! channels. The payload is obfuscated with a repeating XOR key, terminated
//! with a fixed sentinel, and written one bit per R/G/B channel (alpha is
//! never touched), most-significant bit first.
//!
//! The XOR pass is a reversible transform, not a security primitive: anyone
//! who knows the key (or tries enough keys) can recover the text. It exists
//! so the raw bit stream does not spell the message out in plain ASCII.
//!
//! This module works on raw `width × height × 4` byte buffers only. Decoding
//! a PNG into pixels and re-encoding the result is the caller's concern.
//!
//! # Example
//!
//! ```rust
//! use ghostdrop::stego;
//!
//! let mut pixels = vec![0xABu8; 64 * 64 * 4];
//! stego::encode(&mut pixels, "meet at dawn", "orchid").unwrap();
//! assert_eq!(stego::decode(&pixels, "orchid").unwrap(), "meet at dawn");
//! ```

use thiserror::Error;

/// Marks the end of the embedded payload.
///
/// A single NUL is not enough once the payload is XOR-obfuscated: any message
/// byte equal to its key byte produces a NUL. Three in a row is not expected
/// in obfuscated text, though a crafted message can still contain it; see
/// [`decode`] for the resulting (deterministic) truncation.
pub const SENTINEL: [u8; 3] = [0x00, 0x00, 0x00];

/// R, G, B, A: one pixel per four buffer bytes.
const CHANNELS_PER_PIXEL: usize = 4;

/// Only R, G and B carry payload bits.
const USABLE_CHANNELS: usize = 3;

/// Errors produced by the codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StegoError {
    /// The payload does not fit in the image
    #[error("payload needs {required} bits but the image holds {capacity}")]
    PayloadTooLarge {
        /// Bits needed for the obfuscated payload plus sentinel
        required: usize,
        /// Bits the pixel buffer can carry
        capacity: usize,
    },

    /// No recognizable payload was embedded in the image
    #[error("no embedded payload found")]
    PayloadNotFound,
}

/// Returns how many payload bits a pixel buffer can carry.
///
/// Capacity is computed from the pixel *count* (`len / 4`), not the raw byte
/// length; the alpha channel contributes bytes but never carries bits.
#[inline]
pub fn capacity_bits(pixels: &[u8]) -> usize {
    (pixels.len() / CHANNELS_PER_PIXEL) * USABLE_CHANNELS
}

/// XOR `data` against a cycling `key` in place.
///
/// Symmetric: applying it twice restores the input. An empty key leaves the
/// data unchanged.
fn obfuscate(data: &mut [u8], key: &[u8]) {
    if key.is_empty() {
        return;
    }
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % key.len()];
    }
}

/// Embeds `message` into the pixel buffer.
///
/// The message is XOR-obfuscated with `key`, suffixed with [`SENTINEL`], and
/// written MSB-first into the least-significant bit of each R, G and B
/// channel in buffer order. Channels beyond the payload keep their original
/// bytes, and the alpha channel is skipped entirely.
///
/// # Errors
///
/// Returns [`StegoError::PayloadTooLarge`] if the payload's bit count exceeds
/// [`capacity_bits`]. The check runs before any write: on failure the buffer
/// is byte-identical to its input.
pub fn encode(pixels: &mut [u8], message: &str, key: &str) -> Result<(), StegoError> {
    let mut payload = message.as_bytes().to_vec();
    obfuscate(&mut payload, key.as_bytes());
    payload.extend_from_slice(&SENTINEL);

    let required = payload.len() * 8;
    let capacity = capacity_bits(pixels);
    if required > capacity {
        return Err(StegoError::PayloadTooLarge { required, capacity });
    }

    let mut bits = payload
        .iter()
        .flat_map(|byte| (0..8).map(move |i| (byte >> (7 - i)) & 1));

    'pixels: for pixel in pixels.chunks_mut(CHANNELS_PER_PIXEL) {
        for channel in pixel.iter_mut().take(USABLE_CHANNELS) {
            match bits.next() {
                Some(bit) => *channel = (*channel & 0xFE) | bit,
                None => break 'pixels,
            }
        }
    }

    Ok(())
}

/// Extracts a message previously embedded with [`encode`].
///
/// Reads the least-significant bit of every R, G and B channel in the same
/// order used for encoding, regroups them into MSB-first bytes, and stops at
/// the *first* occurrence of [`SENTINEL`] in the byte stream. A message whose
/// obfuscated bytes happen to contain the sentinel therefore decodes to a
/// truncated (but deterministic) prefix, an inherent limit of a fixed
/// sentinel scheme.
///
/// # Errors
///
/// Returns [`StegoError::PayloadNotFound`] when no sentinel appears before
/// the bit stream is exhausted, or when the de-obfuscated bytes are not
/// plausible text (invalid UTF-8, or control characters other than tab,
/// newline and carriage return), the usual signs of an image with no
/// payload or a wrong key.
pub fn decode(pixels: &[u8], key: &str) -> Result<String, StegoError> {
    let mut raw = Vec::new();
    let mut acc = 0u8;
    let mut filled = 0u8;
    let mut terminated = false;

    'pixels: for pixel in pixels.chunks(CHANNELS_PER_PIXEL) {
        if pixel.len() < CHANNELS_PER_PIXEL {
            break;
        }
        for channel in pixel.iter().take(USABLE_CHANNELS) {
            acc = (acc << 1) | (channel & 1);
            filled += 1;
            if filled == 8 {
                raw.push(acc);
                acc = 0;
                filled = 0;
                if raw.ends_with(&SENTINEL) {
                    terminated = true;
                    break 'pixels;
                }
            }
        }
    }

    if !terminated {
        return Err(StegoError::PayloadNotFound);
    }
    raw.truncate(raw.len() - SENTINEL.len());

    obfuscate(&mut raw, key.as_bytes());

    let text = String::from_utf8(raw).map_err(|_| StegoError::PayloadNotFound)?;
    if text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
    {
        return Err(StegoError::PayloadNotFound);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An opaque gray test image.
    fn blank_image(pixel_count: usize) -> Vec<u8> {
        let mut pixels = Vec::with_capacity(pixel_count * CHANNELS_PER_PIXEL);
        for _ in 0..pixel_count {
            pixels.extend_from_slice(&[0x7F, 0x80, 0x81, 0xFF]);
        }
        pixels
    }

    // ==================== Round-trip Tests ====================

    #[test]
    fn test_round_trip() {
        let mut pixels = blank_image(256);
        encode(&mut pixels, "the drop is live", "skeleton-key").unwrap();
        assert_eq!(
            decode(&pixels, "skeleton-key").unwrap(),
            "the drop is live"
        );
    }

    #[test]
    fn test_round_trip_empty_message() {
        let mut pixels = blank_image(16);
        encode(&mut pixels, "", "key").unwrap();
        assert_eq!(decode(&pixels, "key").unwrap(), "");
    }

    #[test]
    fn test_round_trip_empty_key() {
        let mut pixels = blank_image(64);
        encode(&mut pixels, "no key at all", "").unwrap();
        assert_eq!(decode(&pixels, "").unwrap(), "no key at all");
    }

    #[test]
    fn test_round_trip_multibyte_utf8() {
        let mut pixels = blank_image(256);
        encode(&mut pixels, "φαντασμα 👻", "clé").unwrap();
        assert_eq!(decode(&pixels, "clé").unwrap(), "φαντασμα 👻");
    }

    #[test]
    fn test_round_trip_key_longer_than_message() {
        let mut pixels = blank_image(64);
        encode(&mut pixels, "hi", "a-key-much-longer-than-the-message").unwrap();
        assert_eq!(
            decode(&pixels, "a-key-much-longer-than-the-message").unwrap(),
            "hi"
        );
    }

    #[test]
    fn test_alpha_channel_untouched() {
        let mut pixels = blank_image(128);
        encode(&mut pixels, "alpha stays put", "k").unwrap();
        for pixel in pixels.chunks(CHANNELS_PER_PIXEL) {
            assert_eq!(pixel[3], 0xFF);
        }
    }

    #[test]
    fn test_high_bits_untouched() {
        let original = blank_image(128);
        let mut pixels = original.clone();
        encode(&mut pixels, "only the low bit moves", "k").unwrap();
        for (before, after) in original.iter().zip(&pixels) {
            assert_eq!(before & 0xFE, after & 0xFE);
        }
    }

    // ==================== Capacity Tests ====================

    #[test]
    fn test_capacity_from_pixel_count_not_byte_length() {
        // 16 pixels = 64 bytes, but only 3 bits per pixel are usable.
        let pixels = blank_image(16);
        assert_eq!(pixels.len(), 64);
        assert_eq!(capacity_bits(&pixels), 48);
    }

    #[test]
    fn test_exact_capacity_fit_succeeds() {
        // 3 message bytes + 3 sentinel bytes = 48 bits = exactly 16 pixels.
        let mut pixels = blank_image(16);
        encode(&mut pixels, "abc", "key").unwrap();
        assert_eq!(decode(&pixels, "key").unwrap(), "abc");
    }

    #[test]
    fn test_over_capacity_fails_without_mutation() {
        // 15 pixels hold 45 bits; "abc" plus the sentinel needs 48.
        let original = blank_image(15);
        let mut pixels = original.clone();
        let err = encode(&mut pixels, "abc", "key").unwrap_err();
        assert_eq!(
            err,
            StegoError::PayloadTooLarge {
                required: 48,
                capacity: 45,
            }
        );
        assert_eq!(pixels, original);
    }

    #[test]
    fn test_one_byte_over_exact_fit_fails() {
        let original = blank_image(16);
        let mut pixels = original.clone();
        let err = encode(&mut pixels, "abcd", "key").unwrap_err();
        assert!(matches!(err, StegoError::PayloadTooLarge { .. }));
        assert_eq!(pixels, original);
    }

    // ==================== Sentinel Tests ====================

    #[test]
    fn test_sentinel_in_obfuscated_payload_truncates_deterministically() {
        // 'a' ^ 'a' == 0, so the message's own bytes produce the sentinel
        // before the appended one. Decode must stop at the first occurrence
        // and return the (empty) prefix, not crash or run past the end.
        let mut pixels = blank_image(256);
        encode(&mut pixels, "aaa then more text", "a").unwrap();
        assert_eq!(decode(&pixels, "a").unwrap(), "");

        let mut again = blank_image(256);
        encode(&mut again, "aaa then more text", "a").unwrap();
        assert_eq!(decode(&again, "a").unwrap(), "");
    }

    #[test]
    fn test_no_sentinel_reports_payload_not_found() {
        // All LSBs set: a stream of 0xFF bytes never matches the sentinel.
        let pixels = vec![0xFFu8; 64 * 4];
        assert_eq!(decode(&pixels, "key").unwrap_err(), StegoError::PayloadNotFound);
    }

    #[test]
    fn test_wrong_key_fails_plausibility_check() {
        let mut pixels = blank_image(256);
        encode(&mut pixels, "classified cargo", "right-key").unwrap();
        // De-obfuscating with the wrong key yields byte salad that trips
        // either the UTF-8 or the control-character heuristic.
        assert_eq!(
            decode(&pixels, "\u{1}\u{2}\u{3}").unwrap_err(),
            StegoError::PayloadNotFound
        );
    }

    #[test]
    fn test_blank_image_has_no_payload() {
        // All-zero LSBs hit the sentinel immediately and decode as empty;
        // that is the encoding of an empty message, so accept it; a buffer
        // with no zero run at all must report PayloadNotFound instead.
        let pixels = blank_image(64);
        // blank_image uses 0x7F/0x80/0x81: LSBs are 1,0,1, so there is no NUL run.
        assert_eq!(decode(&pixels, "key").unwrap_err(), StegoError::PayloadNotFound);
    }

    #[test]
    fn test_whitespace_survives_plausibility_check() {
        let mut pixels = blank_image(256);
        encode(&mut pixels, "line one\nline two\ttabbed", "k").unwrap();
        assert_eq!(decode(&pixels, "k").unwrap(), "line one\nline two\ttabbed");
    }
}
