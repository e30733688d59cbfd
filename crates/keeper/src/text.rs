//! Decoding stored bytes back into text by their recorded encoding.

use crate::error::{KeeperError, KeeperResult};

/// Encoding recorded for text payloads.
pub const UTF8: &str = "utf-8";

/// Canonical spelling of an encoding label, e.g. `UTF_8` -> `utf-8`.
pub fn canonical_encoding(label: &str) -> String {
    let lower = label.trim().to_ascii_lowercase().replace('_', "-");
    match lower.as_str() {
        "utf8" => UTF8.to_owned(),
        "utf16" => "utf-16".to_owned(),
        "utf-16-le" | "utf16le" => "utf-16le".to_owned(),
        "utf-16-be" | "utf16be" => "utf-16be".to_owned(),
        "us-ascii" => "ascii".to_owned(),
        "latin1" | "iso-8859-1" | "iso8859-1" | "l1" => "latin-1".to_owned(),
        _ => lower,
    }
}

pub fn is_utf8(label: &str) -> bool {
    canonical_encoding(label) == UTF8
}

/// Decode `bytes` as `encoding`.
pub fn decode(bytes: &[u8], encoding: &str) -> KeeperResult<String> {
    let canonical = canonical_encoding(encoding);
    let decode_err = |reason: String| KeeperError::Decode {
        encoding: canonical.clone(),
        reason,
    };
    match canonical.as_str() {
        "utf-8" => String::from_utf8(bytes.to_vec()).map_err(|e| decode_err(e.to_string())),
        "utf-16" => match bytes {
            [0xff, 0xfe, rest @ ..] => decode_utf16(rest, false).map_err(decode_err),
            [0xfe, 0xff, rest @ ..] => decode_utf16(rest, true).map_err(decode_err),
            _ => decode_utf16(bytes, false).map_err(decode_err),
        },
        "utf-16le" => decode_utf16(bytes, false).map_err(decode_err),
        "utf-16be" => decode_utf16(bytes, true).map_err(decode_err),
        "ascii" => match bytes.iter().position(|b| !b.is_ascii()) {
            None => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            Some(at) => Err(decode_err(format!("non-ascii byte at offset {at}"))),
        },
        "latin-1" => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        _ => Err(KeeperError::UnsupportedEncoding(encoding.to_owned())),
    }
}

fn decode_utf16(bytes: &[u8], big_endian: bool) -> Result<String, String> {
    if bytes.len() % 2 != 0 {
        return Err(format!("odd byte count {}", bytes.len()));
    }
    let units = bytes.chunks_exact(2).map(|pair| {
        let pair = [pair[0], pair[1]];
        if big_endian {
            u16::from_be_bytes(pair)
        } else {
            u16::from_le_bytes(pair)
        }
    });
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_canonicalized() {
        assert_eq!(canonical_encoding("UTF8"), "utf-8");
        assert_eq!(canonical_encoding("utf_16_le"), "utf-16le");
        assert_eq!(canonical_encoding("Latin1"), "latin-1");
        assert!(is_utf8("UTF-8"));
        assert!(!is_utf8("utf-16"));
    }

    #[test]
    fn utf8_round_trip_and_failure() {
        assert_eq!(decode("héllo".as_bytes(), "utf-8").unwrap(), "héllo");
        assert!(matches!(decode(&[0xff, 0x00], "utf-8"), Err(KeeperError::Decode { .. })));
    }

    #[test]
    fn utf16_variants() {
        let le: Vec<u8> = "hi✓".encode_utf16().flat_map(u16::to_le_bytes).collect();
        let be: Vec<u8> = "hi✓".encode_utf16().flat_map(u16::to_be_bytes).collect();
        assert_eq!(decode(&le, "utf-16le").unwrap(), "hi✓");
        assert_eq!(decode(&be, "utf-16be").unwrap(), "hi✓");

        let mut with_bom = vec![0xfe, 0xff];
        with_bom.extend_from_slice(&be);
        assert_eq!(decode(&with_bom, "utf-16").unwrap(), "hi✓");

        let mut with_bom = vec![0xff, 0xfe];
        with_bom.extend_from_slice(&le);
        assert_eq!(decode(&with_bom, "utf-16").unwrap(), "hi✓");

        assert!(decode(&[0x61], "utf-16le").is_err());
    }

    #[test]
    fn single_byte_encodings() {
        assert_eq!(decode(b"plain", "ascii").unwrap(), "plain");
        assert!(decode(&[0x80], "ascii").is_err());
        assert_eq!(decode(&[0x63, 0x61, 0x66, 0xe9], "latin-1").unwrap(), "café");
    }

    #[test]
    fn unknown_encoding() {
        assert!(matches!(
            decode(b"x", "ebcdic"),
            Err(KeeperError::UnsupportedEncoding(e)) if e == "ebcdic"
        ));
    }
}
