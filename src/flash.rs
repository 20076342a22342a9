//! Page programming sequence.

use crate::port::SelfProgram;

/// Erase, fill and write one page, then re-enable application reads
///
/// `address` must be page aligned and below the bootloader section; callers
/// check this. Data shorter than the page is padded with erased words.
///
/// Once the erase has been issued the sequence always runs through to
/// [`SelfProgram::enable_rww`], even if a step reports an error, so the
/// application section is never left unreadable. The first error seen is
/// returned.
pub fn commit_page<F>(
    flash: &mut F,
    address: u32,
    data: &[u8],
    page_size: u16,
) -> Result<(), F::Error>
where
    F: SelfProgram,
{
    debug_assert!(address % page_size as u32 == 0);
    debug_assert!(data.len() <= page_size as usize);

    trace!("Committing page 0x{:05x} ({} bytes)", address, data.len());

    flash.erase_page(address)?;

    let mut res = block!(flash.poll());

    for offset in (0..page_size as usize).step_by(2) {
        let lo = data.get(offset).copied().unwrap_or(0xFF);
        let hi = data.get(offset + 1).copied().unwrap_or(0xFF);
        let r = flash.fill_word(address + offset as u32, u16::from_le_bytes([lo, hi]));
        res = res.and(r);
    }

    res = res.and(flash.write_page(address));
    res = res.and(block!(flash.poll()));
    res.and(flash.enable_rww())
}

/// Compare flash at `address` against `data`
pub fn verify<F: SelfProgram>(flash: &mut F, address: u32, data: &[u8]) -> bool {
    data.iter()
        .enumerate()
        .all(|(i, b)| flash.read(address + i as u32) == *b)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::sim::SimFlash;

    #[test]
    fn page_is_erased_filled_and_readable() {
        let mut f = SimFlash::new(0x1000, 128);
        let data: Vec<u8> = (0..128u8).collect();

        commit_page(&mut f, 0x100, &data, 128).unwrap();

        assert!(verify(&mut f, 0x100, &data));
        assert_eq!(f.erase_count(), 1);
        assert_eq!(f.write_count(), 1);
        assert!(f.rww_enabled());
    }

    #[test]
    fn short_data_is_padded_with_erased_words() {
        let mut f = SimFlash::new(0x1000, 128);
        commit_page(&mut f, 0, &[0u8; 128], 128).unwrap();

        commit_page(&mut f, 0, &[0xAA, 0x55, 0x01], 128).unwrap();

        assert!(verify(&mut f, 0, &[0xAA, 0x55, 0x01, 0xFF]));
        assert_eq!(f.read(127), 0xFF);
    }

    #[test]
    fn neighbouring_pages_are_untouched() {
        let mut f = SimFlash::new(0x1000, 128);
        commit_page(&mut f, 0x80, &[0x11; 128], 128).unwrap();
        commit_page(&mut f, 0x100, &[0x22; 128], 128).unwrap();

        assert!(verify(&mut f, 0x80, &[0x11; 128]));
        assert_eq!(f.read(0x7F), 0xFF);
        assert_eq!(f.read(0x180), 0xFF);
    }

    #[test]
    fn failed_write_still_reenables_reads() {
        let mut f = SimFlash::new(0x1000, 128);
        f.fail_writes(true);

        assert!(commit_page(&mut f, 0, &[0x33; 128], 128).is_err());
        assert!(f.rww_enabled());
        assert!(!verify(&mut f, 0, &[0x33; 128]));
    }
}
