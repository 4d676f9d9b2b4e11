//! Battery voltage interpretation
//!
//! The cell is measured through a 2:1 divider on a 12-bit ADC with a 3.3 V
//! reference. Readings are kept in millivolts.

use paperdink_client::config::{CRITICAL_BATTERY_MV, LOW_BATTERY_MV};

/// Full-scale reading of the 12-bit ADC
const ADC_MAX: u32 = 4095;
/// ADC reference in millivolts
const ADC_REF_MV: u32 = 3300;
/// Divider between the cell and the ADC pin
const DIVIDER: u32 = 2;

/// Lower bound of each 10% step, highest first
const CURVE: [(u32, u8); 10] = [
    (4100, 100),
    (4000, 90),
    (3900, 80),
    (3800, 70),
    (3700, 60),
    (3600, 50),
    (3500, 40),
    (3400, 30),
    (3300, 20),
    (3200, 10),
];

/// Battery condition used to gate the network cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Normal,
    /// Below the low threshold; warn the user
    Low,
    /// Below the critical threshold; skip the network
    Critical,
}

/// Convert a raw ADC sample to cell millivolts
pub fn adc_to_millivolts(raw: u16) -> u32 {
    raw as u32 * ADC_REF_MV * DIVIDER / ADC_MAX
}

/// Step-wise charge estimate for a single Li-ion cell
pub fn percentage(millivolts: u32) -> u8 {
    CURVE
        .iter()
        .find(|(floor, _)| millivolts >= *floor)
        .map_or(0, |(_, percent)| *percent)
}

pub fn level(millivolts: u32) -> Level {
    if millivolts < CRITICAL_BATTERY_MV {
        Level::Critical
    } else if millivolts < LOW_BATTERY_MV {
        Level::Low
    } else {
        Level::Normal
    }
}

/// One battery measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub millivolts: u32,
    pub percent: u8,
    pub level: Level,
    pub charging: bool,
}

impl Reading {
    pub fn from_adc(raw: u16, charging: bool) -> Self {
        let millivolts = adc_to_millivolts(raw);
        Self {
            millivolts,
            percent: percentage(millivolts),
            level: level(millivolts),
            charging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adc_conversion() {
        assert_eq!(adc_to_millivolts(0), 0);
        assert_eq!(adc_to_millivolts(4095), 6600);
        assert_eq!(adc_to_millivolts(2482), 4000);
    }

    #[test]
    fn test_percentage_steps() {
        assert_eq!(percentage(4200), 100);
        assert_eq!(percentage(4100), 100);
        assert_eq!(percentage(4099), 90);
        assert_eq!(percentage(3650), 50);
        assert_eq!(percentage(3200), 10);
        assert_eq!(percentage(3199), 0);
    }

    #[test]
    fn test_levels() {
        assert_eq!(level(3700), Level::Normal);
        assert_eq!(level(3100), Level::Low);
        assert_eq!(level(2950), Level::Critical);
    }
}
