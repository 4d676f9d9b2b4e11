//! Command set of the UC8176 controller used by 4.2" monochrome panels

/// Display commands
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum Command {
    /// Panel Setting
    PSR = 0x00,
    /// Power Setting
    PWR = 0x01,
    /// Power Off
    POF = 0x02,
    /// Power On
    PON = 0x04,
    /// Booster Soft Start
    BTST = 0x06,
    /// Deep Sleep
    DSLP = 0x07,
    /// Display Refresh
    DRF = 0x12,
    /// Data Start Transmission 2 (new frame; DTM1 is only used for partial refresh)
    DTM2 = 0x13,
    /// PLL Control
    PLL = 0x30,
    /// VCOM and Data Interval Setting
    CDI = 0x50,
    /// Resolution Setting
    TRES = 0x61,
    /// VCOM DC Setting
    VDCS = 0x82,
}

impl Command {
    /// Get the command address byte
    #[inline]
    pub fn addr(self) -> u8 {
        self as u8
    }
}
