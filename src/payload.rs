//! Helpers over the msgpack payload bytes carried inside frames.
//!
//! The dispatcher depends on exactly one structural property of the
//! encoding: the first byte of a payload identifies its top-level
//! container kind. Everything else is decoded with `rmp_serde`.

use std::collections::HashMap;

use rmp::Marker;

use crate::diag::WorkerError;
use crate::error::Result;

/// True if the payload's top-level container is a map. Workers reply
/// with a map only to carry an in-band error.
pub(crate) fn is_map(payload: &[u8]) -> bool {
    match payload.first() {
        Some(&b) => matches!(
            Marker::from_u8(b),
            Marker::FixMap(_) | Marker::Map16 | Marker::Map32
        ),
        None => false,
    }
}

/// Decodes the function catalog payload: an array of strings.
pub(crate) fn decode_funcs(payload: &[u8]) -> Result<Vec<String>> {
    Ok(rmp_serde::from_slice(payload)?)
}

/// Decodes an error-map reply. The `err` key is required by the
/// protocol; a missing key decodes to an empty message rather than a
/// second error.
pub(crate) fn decode_error_map(payload: &[u8]) -> Result<WorkerError> {
    let mut map: HashMap<String, String> = rmp_serde::from_slice(payload)?;

    Ok(WorkerError {
        msg: map.remove("err").unwrap_or_default(),
        debug: map.remove("dbg").unwrap_or_default(),
        panic: false,
    })
}

/// Encodes a single-string argument list, the shape expected by
/// `swe_set_ephe_path`.
pub(crate) fn encode_str_args(arg: &str) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(&[arg])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_map_fixmap() {
        assert!(is_map(&[0x80]));
        assert!(is_map(&[0x82, 0xa3]));
        assert!(is_map(&[0x8f]));
    }

    #[test]
    fn test_is_map_wide_maps() {
        assert!(is_map(&[0xde, 0x00, 0x10]));
        assert!(is_map(&[0xdf, 0x00, 0x00, 0x00, 0x10]));
    }

    #[test]
    fn test_is_map_rejects_other_kinds() {
        assert!(!is_map(&[0x90])); // empty array
        assert!(!is_map(&[0x91, 0xc0])); // array of nil
        assert!(!is_map(&[0xa3, b'a', b'b', b'c'])); // str
        assert!(!is_map(&[0xc0])); // nil
        assert!(!is_map(&[0x07])); // positive fixint
        assert!(!is_map(&[0xc4, 0x01, 0xff])); // bin
        assert!(!is_map(&[]));
    }

    #[test]
    fn test_decode_funcs() {
        // ["rpc_funcs", "swe_version"]
        let mut payload = vec![0x92u8, 0xa9];
        payload.extend_from_slice(b"rpc_funcs");
        payload.push(0xab);
        payload.extend_from_slice(b"swe_version");

        let funcs = decode_funcs(&payload).unwrap();
        assert_eq!(funcs, ["rpc_funcs", "swe_version"]);
    }

    #[test]
    fn test_decode_funcs_rejects_non_array() {
        assert!(decode_funcs(&[0xc0]).is_err());
        assert!(decode_funcs(b"not msgpack at all").is_err());
    }

    #[test]
    fn test_decode_error_map() {
        // {"err": "test_error called", "dbg": "func=test_error"}
        let mut payload = vec![0x82u8, 0xa3];
        payload.extend_from_slice(b"err");
        payload.push(0xb1);
        payload.extend_from_slice(b"test_error called");
        payload.push(0xa3);
        payload.extend_from_slice(b"dbg");
        payload.push(0xaf);
        payload.extend_from_slice(b"func=test_error");

        let err = decode_error_map(&payload).unwrap();
        assert_eq!(
            err,
            WorkerError {
                msg: "test_error called".to_string(),
                debug: "func=test_error".to_string(),
                panic: false,
            }
        );
    }

    #[test]
    fn test_decode_error_map_without_debug() {
        let mut payload = vec![0x81u8, 0xa3];
        payload.extend_from_slice(b"err");
        payload.push(0xa4);
        payload.extend_from_slice(b"oops");

        let err = decode_error_map(&payload).unwrap();
        assert_eq!(err.msg, "oops");
        assert_eq!(err.debug, "");
        assert!(!err.panic);
    }

    #[test]
    fn test_encode_str_args() {
        let data = encode_str_args("/path/to/ephe/").unwrap();

        // fixarray(1) + str of the path
        assert_eq!(data[0], 0x91);
        assert_eq!(data[1], 0xa0 | 14);
        assert_eq!(&data[2..], b"/path/to/ephe/");
    }

    #[test]
    fn test_encoded_args_roundtrip() {
        let data = encode_str_args("/ephe/").unwrap();
        let back: Vec<String> = rmp_serde::from_slice(&data).unwrap();
        assert_eq!(back, ["/ephe/"]);
    }
}
