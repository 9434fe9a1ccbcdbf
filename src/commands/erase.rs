//! Erase command implementation

use gnwflash_core::ops::{EraseSize, FlashApp};
use gnwflash_core::poll::Clock;
use gnwflash_core::target::TargetMemory;

use super::{format_size, spinner, CmdResult};

/// Run the erase command
///
/// With neither `offset` nor `size` the whole chip is erased.
pub fn run_erase<T: TargetMemory, C: Clock>(
    app: &mut FlashApp<T, C>,
    offset: Option<u32>,
    size: Option<u32>,
) -> CmdResult {
    match (offset, size) {
        (None, None) => {
            let pb = spinner("Erasing the whole chip (this may take a while)...");
            app.erase(0, EraseSize::WholeChip)?;
            pb.finish_with_message("Chip erase complete");
        }
        (offset, Some(size)) => {
            let offset = offset.unwrap_or(0);
            let pb = spinner(&format!(
                "Erasing {} at 0x{:08X}...",
                format_size(size as usize),
                offset
            ));
            app.erase(offset, EraseSize::Bytes(size))?;
            pb.finish_with_message(format!(
                "Erased {} starting at 0x{:08X}",
                format_size(size as usize),
                offset
            ));
        }
        (Some(_), None) => {
            return Err("--offset needs --size for a partial erase".into());
        }
    }
    Ok(())
}

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use gnwflash_core::layout::ProtocolLayout;
    use gnwflash_core::ops::EngineConfig;
    use gnwflash_core::poll::FakeClock;
    use gnwflash_dummy::DummyFlashApp;

    fn app() -> FlashApp<DummyFlashApp, FakeClock> {
        let mut target = DummyFlashApp::new_default().unwrap();
        target.extflash_mut().fill(0x00);
        let mut app = FlashApp::with_layout_and_clock(
            target,
            ProtocolLayout::dual_context().unwrap(),
            EngineConfig::default(),
            FakeClock::new(),
        );
        app.start().unwrap();
        app
    }

    #[test]
    fn test_partial_erase() {
        let mut app = app();
        run_erase(&mut app, Some(0x1000), Some(0x2000)).unwrap();
        let flash = app.into_target();
        assert!(flash.extflash()[0x1000..0x3000].iter().all(|b| *b == 0xFF));
        assert_eq!(flash.extflash()[0x0FFF], 0x00);
        assert_eq!(flash.extflash()[0x3000], 0x00);
    }

    #[test]
    fn test_whole_chip_erase() {
        let mut app = app();
        run_erase(&mut app, None, None).unwrap();
        assert!(app.into_target().extflash().iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn test_misaligned_erase_rejected() {
        let mut app = app();
        assert!(run_erase(&mut app, Some(0x1001), Some(0x1000)).is_err());
        assert!(app.into_target().submissions().is_empty());
    }
}
