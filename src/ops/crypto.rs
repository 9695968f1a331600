//! Crypto Operations (Ops)
//!
//! Backs the bootstrap's `crypto` global: v4 UUIDs, CSPRNG bytes and
//! `SubtleCrypto.digest` over the four SHA algorithms.

use rand::RngCore;
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha384, Sha512};
use v8;

use crate::ops::bindings::{extract_bytes_arg, extract_string_arg, throw_error, throw_type_error};

/// crypto.randomUUID(): RFC 4122 v4 from a cryptographic RNG
pub fn op_random_uuid(
    scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let uuid = uuid::Uuid::new_v4().to_string();
    if let Some(value) = v8::String::new(scope, &uuid) {
        rv.set(value.into());
    }
}

/// crypto.getRandomValues(): fill the given byte view in place
pub fn op_get_random_values(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let view = match v8::Local::<v8::Uint8Array>::try_from(args.get(0)) {
        Ok(view) => view,
        Err(_) => {
            throw_type_error(scope, "getRandomValues requires a Uint8Array");
            return;
        }
    };

    let length = view.byte_length() as usize;
    let mut bytes = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut bytes);

    let offset = view.byte_offset() as usize;
    if let Some(buffer) = view.buffer(scope) {
        let backing_store = buffer.get_backing_store();
        for (i, byte) in bytes.iter().enumerate() {
            backing_store[offset + i].set(*byte);
        }
    }

    rv.set(args.get(0));
}

/// crypto.subtle.digest(): raw digest bytes for SHA-1/256/384/512
///
/// The algorithm name is matched case-insensitively with the dash optional.
pub fn op_digest(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let algorithm = match extract_string_arg(scope, &args, 0) {
        Some(algorithm) => algorithm,
        None => {
            throw_type_error(scope, "digest requires an algorithm name");
            return;
        }
    };

    let bytes = match extract_bytes_arg(scope, &args, 1) {
        Some(bytes) => bytes,
        None => {
            throw_type_error(scope, "digest requires Uint8Array or ArrayBuffer data");
            return;
        }
    };

    let digest = match normalize_algorithm(&algorithm).as_str() {
        "SHA1" => Sha1::digest(&bytes).to_vec(),
        "SHA256" => Sha256::digest(&bytes).to_vec(),
        "SHA384" => Sha384::digest(&bytes).to_vec(),
        "SHA512" => Sha512::digest(&bytes).to_vec(),
        _ => {
            throw_error(scope, &format!("unsupported digest algorithm '{}'", algorithm));
            return;
        }
    };

    let buffer = v8::ArrayBuffer::new(scope, digest.len());
    {
        let backing_store = buffer.get_backing_store();
        for (i, byte) in digest.iter().enumerate() {
            backing_store[i].set(*byte);
        }
    }
    if let Some(array) = v8::Uint8Array::new(scope, buffer, 0, digest.len()) {
        rv.set(array.into());
    }
}

fn normalize_algorithm(algorithm: &str) -> String {
    algorithm.to_ascii_uppercase().replace('-', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_algorithm() {
        assert_eq!(normalize_algorithm("SHA-256"), "SHA256");
        assert_eq!(normalize_algorithm("sha-1"), "SHA1");
        assert_eq!(normalize_algorithm("sha512"), "SHA512");
        assert_eq!(normalize_algorithm("Sha-384"), "SHA384");
    }

    #[test]
    fn test_sha256_known_answer() {
        // SHA-256("abc")
        let digest = Sha256::digest(b"abc");
        assert_eq!(
            format!("{:x}", digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha1_known_answer() {
        // SHA-1("abc")
        let digest = Sha1::digest(b"abc");
        assert_eq!(format!("{:x}", digest), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
