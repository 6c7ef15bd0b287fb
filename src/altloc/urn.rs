//! SHA1 content urns, `urn:sha1:<base32>`.

use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

const PREFIX: &str = "urn:sha1:";
const SHA1_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Identifies a file by the SHA1 of its content.
pub struct Urn([u8; SHA1_SIZE]);

impl Urn {
    pub fn from_sha1(digest: [u8; SHA1_SIZE]) -> Urn {
        Urn(digest)
    }

    /// The urn of a file with this content.
    pub fn from_content(content: &[u8]) -> Urn {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(content);

        Urn(hasher.digest().bytes())
    }

    pub fn as_bytes(&self) -> &[u8; SHA1_SIZE] {
        &self.0
    }
}

impl FromStr for Urn {
    type Err = Error;

    /// Parses `urn:sha1:` followed by 32 base32 characters, case insensitive.
    fn from_str(s: &str) -> Result<Urn> {
        let invalid = || Error::InvalidUrn(s.to_string());

        let trimmed = s.trim();
        if trimmed.len() < PREFIX.len() || !trimmed.is_char_boundary(PREFIX.len()) {
            return Err(invalid());
        }

        let (prefix, encoded) = trimmed.split_at(PREFIX.len());
        if !prefix.eq_ignore_ascii_case(PREFIX) {
            return Err(invalid());
        }

        let bytes = base32::decode(encoded).ok_or_else(invalid)?;
        let digest: [u8; SHA1_SIZE] = bytes.try_into().map_err(|_| invalid())?;

        Ok(Urn(digest))
    }
}

impl Display for Urn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", base32::encode(&self.0))
    }
}

impl Debug for Urn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Urn({self})")
    }
}

/// RFC 4648 base32 without padding.
mod base32 {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    pub fn encode(input: &[u8]) -> String {
        let mut output = String::with_capacity((input.len() * 8).div_ceil(5));
        let mut buffer: u16 = 0;
        let mut bits = 0;

        for byte in input {
            buffer = (buffer << 8) | *byte as u16;
            bits += 8;

            while bits >= 5 {
                bits -= 5;
                output.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
            }
        }

        if bits > 0 {
            output.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
        }

        output
    }

    /// Returns `None` on characters outside the alphabet or non zero
    /// trailing bits.
    pub fn decode(input: &str) -> Option<Vec<u8>> {
        let mut output = Vec::with_capacity(input.len() * 5 / 8);
        let mut buffer: u16 = 0;
        let mut bits = 0;

        for c in input.bytes() {
            let value = match c.to_ascii_uppercase() {
                c @ b'A'..=b'Z' => c - b'A',
                c @ b'2'..=b'7' => c - b'2' + 26,
                _ => return None,
            };

            buffer = ((buffer << 5) | value as u16) & 0x0fff;
            bits += 5;

            if bits >= 8 {
                bits -= 8;
                output.push((buffer >> bits) as u8);
            }
        }

        if buffer & ((1 << bits) - 1) != 0 {
            return None;
        }

        Some(output)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const EMPTY_FILE: &str = "urn:sha1:3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBYJ";

    #[test]
    fn empty_file_urn() {
        let urn = Urn::from_content(b"");

        assert_eq!(urn.to_string(), EMPTY_FILE);
        assert_eq!(EMPTY_FILE.parse::<Urn>().unwrap(), urn);
    }

    #[test]
    fn parse_is_case_insensitive() {
        let lower = EMPTY_FILE.to_lowercase();
        let mixed = "URN:SHA1:3i42h3s6nnfq2msvx7xzkyayscx5qbyj";

        assert_eq!(lower.parse::<Urn>().unwrap(), Urn::from_content(b""));
        assert_eq!(mixed.parse::<Urn>().unwrap(), Urn::from_content(b""));
    }

    #[test]
    fn reject_invalid() {
        for invalid in [
            "",
            "urn:sha1:",
            "urn:md5:3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBYJ",
            "urn:sha1:3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBY",
            "urn:sha1:3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBYJAA",
            "urn:sha1:3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBY1",
        ] {
            assert!(
                matches!(invalid.parse::<Urn>(), Err(Error::InvalidUrn(_))),
                "{invalid}"
            );
        }
    }
}
