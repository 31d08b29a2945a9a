//! Physical frame content helpers

pub use pod_api::PAGE_SIZE;

/// Contents of one physical frame
pub type FrameBuf = [u8; PAGE_SIZE];

/// Full-page compare against zero
///
/// Scans eight bytes at a time and stops at the first non-zero word.
pub fn is_zero_page(frame: &FrameBuf) -> bool {
    frame.chunks_exact(8).all(|word| word == [0u8; 8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_page_detection() {
        let mut frame = [0u8; PAGE_SIZE];
        assert!(is_zero_page(&frame));
        frame[PAGE_SIZE - 1] = 1;
        assert!(!is_zero_page(&frame));
        frame[PAGE_SIZE - 1] = 0;
        frame[0] = 0x80;
        assert!(!is_zero_page(&frame));
        frame[0] = 0;
        frame[2049] = 7;
        assert!(!is_zero_page(&frame));
    }
}
