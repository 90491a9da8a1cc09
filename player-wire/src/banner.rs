/// Length, in bytes, of the identification banner written on accept.
pub const BANNER_LEN: usize = 32;

/// Builds the fixed-length ASCII banner: `<product-name><version>`,
/// zero-padded to `BANNER_LEN`. Writing it is the first thing the
/// frontend does on accept, before any message framing; it may be
/// suppressed entirely for internal connections (the remote-driver
/// bridge's loopback socket).
pub fn encode(product: &str, version: &str) -> [u8; BANNER_LEN] {
    let mut out = [0u8; BANNER_LEN];
    let text = format!("{product} {version}");
    let bytes = text.as_bytes();
    let n = bytes.len().min(BANNER_LEN);

    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Strips trailing NULs from a received banner for logging/display.
pub fn trim(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_fixed_length_and_padded() {
        let b = encode("Player", "4.0");
        assert_eq!(b.len(), BANNER_LEN);
        assert!(b.iter().skip(b"Player 4.0".len()).all(|&x| x == 0));
    }

    #[test]
    fn trim_drops_padding() {
        let b = encode("Player", "4.0");
        assert_eq!(trim(&b), "Player 4.0");
    }

    #[test]
    fn long_identity_is_clipped_not_panicking() {
        let b = encode(&"x".repeat(100), "1");
        assert_eq!(b.len(), BANNER_LEN);
    }
}
