//! Fuzz target for note envelope parsing and decryption
//!
//! Arbitrary bytes must never panic the decoder, and a tampered envelope
//! must never open to anything.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use notevault_core::fs::envelope::{EnvelopeCipher, HEADER_PREFIX, NoteContent, Opened};

const KEY: [u8; 32] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
    0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f,
];

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    mode: FuzzMode,
    data: Vec<u8>,
    aad: Option<Vec<u8>>,
}

#[derive(Arbitrary, Debug)]
enum FuzzMode {
    /// Arbitrary bytes straight into the decoder
    Raw,
    /// Arbitrary body behind a well-formed header line
    HeaderPrefixed,
    /// Seal, flip one body bit, reopen
    RoundtripCorrupt { flip: u16 },
}

fuzz_target!(|input: FuzzInput| {
    if input.data.len() > 1024 * 1024 {
        return;
    }
    let cipher = EnvelopeCipher::new(&KEY).unwrap();
    let aad = input.aad.as_deref();

    match input.mode {
        FuzzMode::Raw => {
            let is_envelope = NoteContent::classify(&input.data).is_envelope();
            match cipher.open(&input.data, aad) {
                Ok(Opened::Plaintext(bytes)) => {
                    assert!(!is_envelope);
                    assert_eq!(bytes, input.data);
                }
                Ok(Opened::Decrypted(_)) | Err(_) => assert!(is_envelope),
            }
        }

        FuzzMode::HeaderPrefixed => {
            let mut bytes = HEADER_PREFIX.to_vec();
            bytes.extend_from_slice(b"1\n");
            bytes.extend_from_slice(&input.data);
            // Forging a tag without the key is not expected
            assert!(cipher.decrypt(&bytes, aad).is_err());
        }

        FuzzMode::RoundtripCorrupt { flip } => {
            let envelope = cipher.encrypt(&input.data, aad).unwrap();
            assert_eq!(cipher.decrypt(&envelope, aad).unwrap(), input.data);

            let body = envelope.iter().position(|b| *b == b'\n').unwrap() + 1;
            let mut corrupted = envelope.clone();
            let at = body + usize::from(flip) % (corrupted.len() - body);
            corrupted[at] ^= 0x01;
            assert!(cipher.decrypt(&corrupted, aad).is_err());
        }
    }
});
