//! Base64 Operations (Ops)
//!
//! Implements `btoa` and `atob` with the browser's error semantics: `btoa`
//! rejects input outside latin-1 and `atob` performs a forgiving decode,
//! both raising `InvalidCharacterError`.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use v8;

use crate::ops::bindings::{extract_string_arg, throw_error, throw_type_error};

/// Forgiving decoder: padding optional, trailing bits tolerated. Whitespace
/// is stripped before decoding, per the WHATWG forgiving-base64 algorithm.
const FORGIVING: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// btoa(): encode a latin-1 string to base64
pub fn op_btoa(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let input = match extract_string_arg(scope, &args, 0) {
        Some(input) => input,
        None => {
            throw_type_error(scope, "btoa requires a string argument");
            return;
        }
    };

    let bytes = match latin1_bytes(&input) {
        Some(bytes) => bytes,
        None => {
            throw_error(
                scope,
                "InvalidCharacterError: btoa input contains characters outside the latin1 range",
            );
            return;
        }
    };

    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    if let Some(value) = v8::String::new(scope, &encoded) {
        rv.set(value.into());
    }
}

/// atob(): decode base64 to a latin-1 string
pub fn op_atob(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let input = match extract_string_arg(scope, &args, 0) {
        Some(input) => input,
        None => {
            throw_type_error(scope, "atob requires a string argument");
            return;
        }
    };

    let decoded = match forgiving_decode(&input) {
        Some(decoded) => decoded,
        None => {
            throw_error(scope, "InvalidCharacterError: atob input is not valid base64");
            return;
        }
    };

    let output: String = decoded.iter().map(|byte| *byte as char).collect();
    if let Some(value) = v8::String::new(scope, &output) {
        rv.set(value.into());
    }
}

/// Map a JS string to its latin-1 byte values, or `None` when any code
/// point is above U+00FF.
fn latin1_bytes(input: &str) -> Option<Vec<u8>> {
    input
        .chars()
        .map(|c| u8::try_from(c as u32).ok())
        .collect()
}

fn forgiving_decode(input: &str) -> Option<Vec<u8>> {
    let stripped: String = input.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    FORGIVING.decode(stripped).ok()
}
