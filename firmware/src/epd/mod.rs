//! Driver for 4.2" 400x300 monochrome e-paper panels on the UC8176
//! controller (Good Display GDEW042T2 / Waveshare 4.2inch e-Paper).
//!
//! Uses the waveform stored in the controller OTP, so a full refresh needs
//! only the new frame in DTM2. Frame data can be streamed in row bands.

mod command;

use command::Command;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiDevice;
use log::{debug, warn};

/// Display width in pixels
pub const WIDTH: u32 = 400;
/// Display height in pixels
pub const HEIGHT: u32 = 300;
/// Bytes per row: 1 bit per pixel, MSB first, set bit is white
pub const ROW_BYTES: usize = WIDTH as usize / 8;

/// Longest a refresh may keep BUSY asserted
const BUSY_TIMEOUT_MS: u32 = 30_000;

/// Driver for the 4.2" panel
pub struct Epd4in2<SPI, BUSY, DC, RST> {
    spi: SPI,
    busy: BUSY,
    dc: DC,
    rst: RST,
    asleep: bool,
}

impl<SPI, BUSY, DC, RST> Epd4in2<SPI, BUSY, DC, RST>
where
    SPI: SpiDevice,
    BUSY: InputPin,
    DC: OutputPin,
    RST: OutputPin,
{
    /// Create a new driver. The panel stays asleep until the first frame.
    pub fn new(spi: SPI, busy: BUSY, dc: DC, rst: RST) -> Self {
        Self {
            spi,
            busy,
            dc,
            rst,
            asleep: true,
        }
    }

    /// Hardware reset sequence
    fn hardware_reset<DELAY: DelayNs>(&mut self, delay: &mut DELAY) {
        let _ = self.rst.set_high();
        delay.delay_ms(10);
        let _ = self.rst.set_low();
        delay.delay_ms(10);
        let _ = self.rst.set_high();
        delay.delay_ms(10);
    }

    /// Wait for the controller to release BUSY (active low)
    pub fn wait_until_idle<DELAY: DelayNs>(&mut self, delay: &mut DELAY) {
        let mut waited = 0;
        while self.busy.is_low().unwrap_or(true) {
            if waited >= BUSY_TIMEOUT_MS {
                warn!("epd: busy timeout");
                return;
            }
            delay.delay_ms(10);
            waited += 10;
        }
    }

    fn send_command(&mut self, command: Command) -> Result<(), SPI::Error> {
        let _ = self.dc.set_low();
        self.spi.write(&[command.addr()])
    }

    fn send_data(&mut self, data: &[u8]) -> Result<(), SPI::Error> {
        let _ = self.dc.set_high();
        self.spi.write(data)
    }

    fn cmd_with_data(&mut self, command: Command, data: &[u8]) -> Result<(), SPI::Error> {
        self.send_command(command)?;
        self.send_data(data)
    }

    fn init<DELAY: DelayNs>(&mut self, delay: &mut DELAY) -> Result<(), SPI::Error> {
        // VDS_EN, VDG_EN, VDH/VDL +-11 V, VDHR 11 V
        self.cmd_with_data(Command::PWR, &[0x03, 0x00, 0x2B, 0x2B])?;
        self.cmd_with_data(Command::BTST, &[0x17, 0x17, 0x17])?;
        self.send_command(Command::PON)?;
        self.wait_until_idle(delay);

        // KW mode, LUT from OTP
        self.cmd_with_data(Command::PSR, &[0x1F])?;
        self.cmd_with_data(Command::PLL, &[0x3C])?;
        // 400 x 300
        self.cmd_with_data(Command::TRES, &[0x01, 0x90, 0x01, 0x2C])?;
        self.cmd_with_data(Command::VDCS, &[0x12])?;
        self.cmd_with_data(Command::CDI, &[0x97])?;
        Ok(())
    }

    /// Reset and initialise the controller if it is asleep
    pub fn wake_up<DELAY: DelayNs>(&mut self, delay: &mut DELAY) -> Result<(), SPI::Error> {
        if self.asleep {
            debug!("epd: wake");
            self.hardware_reset(delay);
            self.wait_until_idle(delay);
            self.init(delay)?;
            self.asleep = false;
        }
        Ok(())
    }

    /// Start a new frame. Follow with [`Self::write_rows`] for every row,
    /// top to bottom, then [`Self::refresh`].
    pub fn begin_frame(&mut self) -> Result<(), SPI::Error> {
        self.send_command(Command::DTM2)
    }

    /// Stream whole rows of the current frame
    pub fn write_rows(&mut self, rows: &[u8]) -> Result<(), SPI::Error> {
        self.send_data(rows)
    }

    /// Show the transmitted frame and wait for the waveform to finish
    pub fn refresh<DELAY: DelayNs>(&mut self, delay: &mut DELAY) -> Result<(), SPI::Error> {
        self.send_command(Command::DRF)?;
        delay.delay_ms(1);
        self.wait_until_idle(delay);
        Ok(())
    }

    /// Power off and enter deep sleep. The image stays on the panel.
    pub fn sleep<DELAY: DelayNs>(&mut self, delay: &mut DELAY) -> Result<(), SPI::Error> {
        if self.asleep {
            return Ok(());
        }
        // Floating border so it keeps its colour while unpowered
        self.cmd_with_data(Command::CDI, &[0xF7])?;
        self.send_command(Command::POF)?;
        self.wait_until_idle(delay);
        self.cmd_with_data(Command::DSLP, &[0xA5])?;
        self.asleep = true;
        Ok(())
    }

    pub fn is_asleep(&self) -> bool {
        self.asleep
    }
}
