use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;
use tb_shared::{ClientError, Result};

/// Digest algorithms the server may announce in `fw_checksum_algorithm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha384,
    Sha512,
    Md5,
    Crc32,
}

impl FromStr for ChecksumAlgorithm {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "SHA256" => Ok(ChecksumAlgorithm::Sha256),
            "SHA384" => Ok(ChecksumAlgorithm::Sha384),
            "SHA512" => Ok(ChecksumAlgorithm::Sha512),
            "MD5" => Ok(ChecksumAlgorithm::Md5),
            "CRC32" => Ok(ChecksumAlgorithm::Crc32),
            _ => Err(ClientError::UnsupportedChecksumAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChecksumAlgorithm::Sha256 => "SHA256",
            ChecksumAlgorithm::Sha384 => "SHA384",
            ChecksumAlgorithm::Sha512 => "SHA512",
            ChecksumAlgorithm::Md5 => "MD5",
            ChecksumAlgorithm::Crc32 => "CRC32",
        };
        f.write_str(name)
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl ChecksumAlgorithm {
    /// Lowercase hex digest of `data`. CRC32 is rendered without padding.
    pub fn digest(&self, data: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Sha256 => to_hex(&Sha256::digest(data)),
            ChecksumAlgorithm::Sha384 => to_hex(&Sha384::digest(data)),
            ChecksumAlgorithm::Sha512 => to_hex(&Sha512::digest(data)),
            ChecksumAlgorithm::Md5 => format!("{:x}", md5::compute(data)),
            ChecksumAlgorithm::Crc32 => format!("{:x}", crc32fast::hash(data)),
        }
    }

    fn matches(&self, data: &[u8], expected: &str) -> bool {
        let expected = expected.trim().to_ascii_lowercase();
        match self {
            ChecksumAlgorithm::Crc32 => {
                let crc = crc32fast::hash(data);
                // hex, zero-padded hex or decimal
                u32::from_str_radix(&expected, 16).map(|v| v == crc).unwrap_or(false)
                    || expected.parse::<u32>().map(|v| v == crc).unwrap_or(false)
            }
            _ => self.digest(data) == expected,
        }
    }
}

/// Checks `data` against the announced checksum.
pub fn verify_checksum(data: &[u8], algorithm: &str, expected: &str) -> Result<()> {
    let algorithm: ChecksumAlgorithm = algorithm.parse()?;

    if algorithm.matches(data, expected) {
        Ok(())
    } else {
        Err(ClientError::ChecksumMismatch {
            expected: expected.to_string(),
            actual: algorithm.digest(data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_sha256() {
        assert!(verify_checksum(b"hello", "SHA256", HELLO_SHA256).is_ok());
        assert!(verify_checksum(b"hello", "sha256", &HELLO_SHA256.to_uppercase()).is_ok());
    }

    #[test]
    fn test_flipped_byte_fails() {
        let result = verify_checksum(b"hellp", "SHA256", HELLO_SHA256);
        assert!(matches!(result, Err(ClientError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_md5_and_crc32() {
        assert!(verify_checksum(b"hello", "MD5", "5d41402abc4b2a76b9719d911017c592").is_ok());
        // crc32("hello") = 0x3610a686
        assert!(verify_checksum(b"hello", "CRC32", "3610a686").is_ok());
        assert!(verify_checksum(b"hello", "crc32", "907060870").is_ok());
        assert!(verify_checksum(b"hellp", "CRC32", "3610a686").is_err());
    }

    #[test]
    fn test_sha384_and_sha512_digest_lengths() {
        assert_eq!(ChecksumAlgorithm::Sha384.digest(b"x").len(), 96);
        assert_eq!(ChecksumAlgorithm::Sha512.digest(b"x").len(), 128);
        let digest = ChecksumAlgorithm::Sha512.digest(b"firmware");
        assert!(verify_checksum(b"firmware", "SHA-512", &digest).is_ok());
    }

    #[test]
    fn test_unknown_algorithm() {
        let result = verify_checksum(b"hello", "murmur3_128", "abc");
        assert!(matches!(result, Err(ClientError::UnsupportedChecksumAlgorithm(_))));
    }
}
