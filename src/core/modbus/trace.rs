use std::fmt::Write;

/// Bytes rendered per traced frame before the remainder is elided.
pub const TRACE_MAX_BYTES: usize = 64;

/// Renders `data` as space separated hex, truncated after
/// [`TRACE_MAX_BYTES`] with a `...(+N)` marker.
pub fn hex_dump(data: &[u8]) -> String {
    let shown = data.len().min(TRACE_MAX_BYTES);
    let mut out = String::with_capacity(shown * 3 + 8);

    for byte in &data[..shown] {
        let _ = write!(out, "{byte:02X} ");
    }

    if data.len() > TRACE_MAX_BYTES {
        let _ = write!(out, "...(+{})", data.len() - TRACE_MAX_BYTES);
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn short_frames_are_dumped_whole() {
        assert_eq!(hex_dump(&[0x01, 0x03, 0xAB]), "01 03 AB ");
        assert_eq!(hex_dump(&[]), "");
    }

    #[test]
    fn long_frames_are_truncated() {
        let data = vec![0xEE; 70];
        let dump = hex_dump(&data);
        assert!(dump.ends_with("...(+6)"));
        assert_eq!(dump.matches("EE").count(), TRACE_MAX_BYTES);
    }
}
