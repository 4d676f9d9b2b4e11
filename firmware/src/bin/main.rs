//! Paperd.ink TRMNL Firmware - ESP32 4.2" E-Paper Dashboard
//!
//! Every boot is one wake cycle: read the buttons and the battery, bring up
//! the panel, SD card, settings and WiFi, let the client fetch and draw the
//! current screen, then deep sleep until the refresh timer or the top button.
//!
//! Optional build-time environment variables:
//! - TRMNL_BASE_URL: server URL (default https://usetrmnl.com)
//! - WIFI_SSID / WIFI_PASSWORD: WiFi network, overrides stored credentials
//! - TRMNL_API_KEY / TRMNL_FRIENDLY_ID: pre-provisioned registration

#![no_std]
#![no_main]

extern crate alloc;

use alloc::string::ToString;
use core::cell::RefCell;
use core::time::Duration as CoreDuration;

use embassy_executor::Spawner;
use embassy_net::{Runner, StackResources};
use embassy_time::{Delay, Duration, Instant, Timer};
use embedded_hal::delay::DelayNs;
use embedded_hal_bus::spi::RefCellDevice;
use esp_alloc as _;
use esp_backtrace as _;
use esp_hal::{
    Blocking,
    analog::adc::{Adc, AdcConfig, Attenuation},
    clock::CpuClock,
    delay::Delay as HalDelay,
    gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull},
    ram,
    rng::Rng,
    rtc_cntl::{
        Rtc,
        sleep::{Ext0WakeupSource, TimerWakeupSource, WakeupLevel},
    },
    spi::{
        Mode,
        master::{Config as SpiConfig, Spi},
    },
    system::SleepSource,
    time::Rate,
    timer::timg::TimerGroup,
};
use esp_println::println;
use esp_radio::{
    Controller,
    wifi::{Config as WifiConfig, WifiDevice},
};
use paperdink_client::config::{ERROR_HOLD_MS, FIRMWARE_VERSION, MIN_SLEEP_SECS};
use paperdink_client::identity::DeviceId;
use paperdink_client::render::RenderSink;
use paperdink_client::screens::{self, StatusInfo, TextBlock};
use paperdink_client::{Client, Config, Refresh, Step};
use paperdink_firmware::battery::{self, Reading};
use paperdink_firmware::cache::SdCache;
use paperdink_firmware::epd::Epd4in2;
use paperdink_firmware::framebuffer::EpdFrame;
use paperdink_firmware::heap::EspHeap;
use paperdink_firmware::net::WifiTransport;
use paperdink_firmware::settings::FlashKvStore;

esp_bootloader_esp_idf::esp_app_desc!();

// When you are okay with using a nightly compiler it's better to use https://docs.rs/static_cell/2.1.0/static_cell/macro.make_static.html
macro_rules! mk_static {
    ($t:ty,$val:expr) => {{
        static STATIC_CELL: static_cell::StaticCell<$t> = static_cell::StaticCell::new();
        #[deny(unused_attributes)]
        let x = STATIC_CELL.uninit().write(($val));
        x
    }};
}

/// Hold time on button 3 that opens the status screen
const STATUS_HOLD_MS: u32 = 2000;
/// Hold time on button 4 at boot that wipes the device
const FACTORY_RESET_HOLD_MS: u32 = 5000;
/// Upper bound on client steps per wake
const MAX_STEPS: usize = 4;

/// Magic number to validate RTC memory state
const SLEEP_STATE_MAGIC: u32 = 0x7E41_D00D;
const LAST_ERROR_LEN: usize = 64;

/// Error counter carried across deep sleep in RTC memory
#[repr(C)]
struct SleepState {
    magic: u32,
    errors: u32,
    last_error_len: u8,
    last_error: [u8; LAST_ERROR_LEN],
}

impl SleepState {
    const fn new() -> Self {
        Self {
            magic: 0,
            errors: 0,
            last_error_len: 0,
            last_error: [0; LAST_ERROR_LEN],
        }
    }

    fn is_valid(&self) -> bool {
        self.magic == SLEEP_STATE_MAGIC && self.last_error_len as usize <= LAST_ERROR_LEN
    }

    fn last_error(&self) -> &str {
        core::str::from_utf8(&self.last_error[..self.last_error_len as usize]).unwrap_or("")
    }

    fn save(&mut self, errors: u32, last_error: &str) {
        let mut len = last_error.len().min(LAST_ERROR_LEN);
        while !last_error.is_char_boundary(len) {
            len -= 1;
        }
        self.magic = SLEEP_STATE_MAGIC;
        self.errors = errors;
        self.last_error_len = len as u8;
        self.last_error[..len].copy_from_slice(&last_error.as_bytes()[..len]);
    }
}

/// RTC fast memory state - persists across deep sleep
#[esp_hal::ram(unstable(rtc_fast))]
static mut SLEEP_STATE: SleepState = SleepState::new();

/// What the buttons asked for at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ButtonAction {
    None,
    Status,
    Sleep,
    FactoryReset,
}

/// Poll an active-low button every 50ms until release or `limit_ms`
fn held_ms(button: &Input<'_>, delay: &mut HalDelay, limit_ms: u32) -> u32 {
    let mut held = 0;
    while button.is_low() && held < limit_ms {
        delay.delay_ms(50);
        held += 50;
    }
    held
}

/// Draw a text screen; display errors are logged and otherwise ignored
fn show<S: RenderSink>(sink: &mut S, screen: &[TextBlock]) {
    if let Err(e) = screens::show(sink, screen) {
        println!("Display error: {:?}", e);
    }
}

#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    // Init logger first so we can see any early crashes
    esp_println::logger::init_logger_from_env();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    let wake_reason = esp_hal::rtc_cntl::wakeup_cause();
    let timer_wake = matches!(wake_reason, SleepSource::Timer);
    // Blocking delay; the embassy time driver is not running yet
    let mut delay = HalDelay::new();

    // ==================== Early Button Check (before heavy init) ====================
    // Buttons pull to ground; button 1 (GPIO14) is also the wake source
    let button_cfg = || InputConfig::default().with_pull(Pull::Up);
    let button1 = Input::new(peripherals.GPIO14, button_cfg());
    let _button2 = Input::new(peripherals.GPIO27, button_cfg());
    let button3 = Input::new(peripherals.GPIO4, button_cfg());
    let button4 = Input::new(peripherals.GPIO2, button_cfg());

    let action = if button4.is_low() {
        if held_ms(&button4, &mut delay, FACTORY_RESET_HOLD_MS) >= FACTORY_RESET_HOLD_MS {
            ButtonAction::FactoryReset
        } else {
            ButtonAction::Sleep
        }
    } else if button3.is_low() && held_ms(&button3, &mut delay, STATUS_HOLD_MS) >= STATUS_HOLD_MS
    {
        ButtonAction::Status
    } else {
        ButtonAction::None
    };

    println!("Boot! Wake reason: {:?}, buttons: {:?}", wake_reason, action);
    if button1.is_low() {
        println!("Refresh button held");
    }

    // Initialize internal RAM heap
    println!("Initializing heap...");
    esp_alloc::heap_allocator!(#[ram(reclaimed)] size: 64 * 1024);
    esp_alloc::heap_allocator!(size: 96 * 1024);

    println!("Starting RTOS...");
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(
        timg0.timer0,
        #[cfg(target_arch = "riscv32")]
        esp_hal::interrupt::software::SoftwareInterruptControl::new(peripherals.SW_INTERRUPT)
            .software_interrupt0,
    );
    println!("RTOS started");

    // ==================== Power Rails ====================
    // Panel and SD card supplies are switched by active-low enables
    let mut epd_power = Output::new(peripherals.GPIO12, Level::Low, OutputConfig::default());
    let mut sd_power = Output::new(peripherals.GPIO5, Level::Low, OutputConfig::default());
    delay.delay_ms(10);

    // ==================== Battery ====================
    // Cell voltage on GPIO39 through a divider gated by GPIO25
    let mut battery_enable = Output::new(peripherals.GPIO25, Level::High, OutputConfig::default());
    let charging = Input::new(peripherals.GPIO36, InputConfig::default());
    delay.delay_ms(10);
    let mut adc_config = AdcConfig::new();
    let mut battery_pin = adc_config.enable_pin(peripherals.GPIO39, Attenuation::_11dB);
    let mut adc = Adc::new(peripherals.ADC1, adc_config);
    let raw = nb::block!(adc.read_oneshot(&mut battery_pin)).unwrap_or(0);
    battery_enable.set_low();
    let battery = Reading::from_adc(raw, charging.is_low());
    println!(
        "Battery: {} mV ({}%), {:?}{}",
        battery.millivolts,
        battery.percent,
        battery.level,
        if battery.charging { ", charging" } else { "" }
    );

    // ==================== Shared SPI Bus ====================
    // SCK=GPIO18, MOSI=GPIO23, MISO=GPIO19; panel CS=GPIO22, SD CS=GPIO21
    let spi = Spi::new(
        peripherals.SPI3,
        SpiConfig::default()
            .with_frequency(Rate::from_mhz(4))
            .with_mode(Mode::_0),
    )
    .expect("SPI init failed")
    .with_sck(peripherals.GPIO18)
    .with_mosi(peripherals.GPIO23)
    .with_miso(peripherals.GPIO19);
    let spi_bus: &'static RefCell<Spi<'static, Blocking>> =
        mk_static!(RefCell<Spi<'static, Blocking>>, RefCell::new(spi));

    let epd_cs = Output::new(peripherals.GPIO22, Level::High, OutputConfig::default());
    let sd_cs = Output::new(peripherals.GPIO21, Level::High, OutputConfig::default());
    let Ok(epd_spi) = RefCellDevice::new_no_delay(spi_bus, epd_cs);
    let Ok(sd_spi) = RefCellDevice::new_no_delay(spi_bus, sd_cs);

    // ==================== E-Paper Display Setup ====================
    // DC=GPIO15, RST=GPIO13, BUSY=GPIO34
    let busy = Input::new(peripherals.GPIO34, InputConfig::default());
    let dc = Output::new(peripherals.GPIO15, Level::Low, OutputConfig::default());
    let rst = Output::new(peripherals.GPIO13, Level::High, OutputConfig::default());
    let mut frame = EpdFrame::new(Epd4in2::new(epd_spi, busy, dc, rst), Delay);

    // ==================== SD Card Cache ====================
    println!("Initializing SD card cache...");
    let sd_cache = SdCache::new(sd_spi, Delay);

    // ==================== RTC for Deep Sleep ====================
    let mut rtc = Rtc::new(peripherals.LPWR);

    // ==================== Settings ====================
    let kv = match FlashKvStore::new() {
        Ok(kv) => kv,
        Err(e) => {
            println!("Settings storage unavailable: {:?}", e);
            show(&mut frame, &screens::error("Settings storage unavailable"));
            enter_deep_sleep(&mut rtc, &mut delay, MIN_SLEEP_SECS);
        }
    };

    // ==================== WiFi Setup ====================
    println!("Initializing WiFi...");
    let radio = mk_static!(
        Controller<'static>,
        esp_radio::init().expect("radio init failed")
    );
    let (wifi_controller, ifaces) =
        esp_radio::wifi::new(radio, peripherals.WIFI, WifiConfig::default())
            .expect("WiFi init failed");
    let device = DeviceId::from_mac(ifaces.sta.mac_address());
    println!("Device: {}", device.as_str());

    let rng = Rng::new();
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;
    let (stack, runner) = embassy_net::new(
        ifaces.sta,
        embassy_net::Config::dhcpv4(Default::default()),
        mk_static!(StackResources<3>, StackResources::<3>::new()),
        seed,
    );
    spawner.spawn(net_task(runner)).ok();
    let transport = WifiTransport::new(stack, wifi_controller, rng);

    // ==================== Client ====================
    let config = Config::default().with_overrides(
        option_env!("TRMNL_BASE_URL"),
        option_env!("WIFI_SSID").map(|ssid| (ssid, option_env!("WIFI_PASSWORD").unwrap_or(""))),
        option_env!("TRMNL_API_KEY"),
        option_env!("TRMNL_FRIENDLY_ID"),
    );
    println!("Server: {}", config.base_url);

    let mut client = Client::new(config, device, transport, kv, sd_cache, Delay, EspHeap);
    client.begin();

    unsafe {
        let state = &raw const SLEEP_STATE;
        if timer_wake && (*state).is_valid() {
            client.restore_errors((*state).errors, (*state).last_error());
            println!("Resuming with {} consecutive errors", (*state).errors);
        }
    }

    if !timer_wake && action == ButtonAction::None {
        show(
            &mut frame,
            &screens::startup(
                FIRMWARE_VERSION,
                battery.percent,
                battery.millivolts,
                client.device().as_str(),
            ),
        );
    }

    match action {
        ButtonAction::FactoryReset => {
            println!("Factory reset requested");
            show(&mut frame, &screens::factory_reset());
            let removed = client.factory_reset();
            println!("Factory reset removed {} cached files", removed);
            show(&mut frame, &screens::factory_reset_done());
            unsafe {
                let state = &raw mut SLEEP_STATE;
                (*state).save(0, "");
            }
            delay.delay_ms(2000);
            esp_hal::system::software_reset();
        }
        ButtonAction::Sleep => {
            println!("Sleep button pressed, skipping refresh");
            show(&mut frame, &screens::sleeping());
        }
        ButtonAction::Status => {
            let ssid = client.wifi_credentials().map(|c| c.ssid.clone());
            let info = StatusInfo {
                state: client.state().label(),
                ssid: ssid.as_deref(),
                friendly_id: client.friendly_id().unwrap_or("-"),
                battery_percent: battery.percent,
                sd_available: client.cache_available(),
                refresh_secs: client.refresh_rate_secs(),
                errors: client.consecutive_errors(),
            };
            show(&mut frame, &screens::status(&info));
        }
        ButtonAction::None if battery.level == battery::Level::Critical => {
            println!("Battery critical, skipping network");
            show(&mut frame, &screens::low_battery(battery.percent));
        }
        ButtonAction::None => {
            if battery.level == battery::Level::Low {
                println!("Battery low: {} mV", battery.millivolts);
            }
            run_cycle(&mut client, &mut frame).await;
        }
    }

    // ==================== Shutdown ====================
    match client.cleanup_cache() {
        Ok(0) => {}
        Ok(removed) => println!("Cache cleanup removed {} files", removed),
        Err(e) => println!("Cache cleanup failed: {}", e),
    }

    unsafe {
        let state = &raw mut SLEEP_STATE;
        (*state).save(client.consecutive_errors(), client.last_error());
    }

    println!("Disconnecting WiFi for deep sleep...");
    client.transport_mut().shutdown().await;

    if let Err(e) = frame.sleep() {
        println!("Panel sleep failed: {:?}", e);
    }
    epd_power.set_high();
    sd_power.set_high();

    let seconds = client.sleep_duration_secs();
    println!(
        "Entering deep sleep for {} seconds (press button 1 to wake early)...",
        seconds
    );
    enter_deep_sleep(&mut rtc, &mut delay, seconds);
}

/// Step the client until it has something on the panel
async fn run_cycle<T, K, C, H, S>(client: &mut Client<T, K, C, Delay, H>, frame: &mut S)
where
    T: paperdink_client::http::HttpTransport,
    K: paperdink_client::kv::KvStore,
    C: paperdink_client::cache::CacheStore,
    H: paperdink_client::image::HeapStats,
    S: RenderSink,
{
    for _ in 0..MAX_STEPS {
        let now_ms = Instant::now().as_millis();
        match client.advance(now_ms).await {
            Step::NeedsWifiSetup => {
                let ap_name = client.device().ap_name();
                println!("No WiFi credentials; configure via {}", ap_name);
                show(frame, &screens::wifi_setup(&ap_name));
                return;
            }
            Step::Registered => {
                println!("Registered as {:?}", client.friendly_id());
                show(frame, &screens::ready());
            }
            Step::RegistrationFailed => {
                println!("Registration failed: {}", client.last_error());
                show(
                    frame,
                    &screens::registration_failed(client.last_error(), client.consecutive_errors()),
                );
                return;
            }
            Step::Ready | Step::Reconnected => {
                match client.refresh(frame, now_ms).await {
                    Ok(Refresh::Updated(outcome)) => println!("Display updated: {:?}", outcome),
                    Ok(Refresh::FromCache(outcome)) => {
                        println!("Showing cached content: {:?}", outcome)
                    }
                    Ok(Refresh::Unchanged) => println!("Content unchanged"),
                    Err(e) => {
                        println!("Refresh failed: {}", e);
                        show(frame, &screens::error(&e.to_string()));
                    }
                }
                // Let the network task drain after the long blocking refresh
                embassy_futures::yield_now().await;
                return;
            }
            Step::Offline => {
                if client.has_cached_content() {
                    if let Err(e) = client.display_cached_content(frame) {
                        println!("Cached content unavailable: {}", e);
                    }
                } else {
                    show(frame, &screens::error("No network connection"));
                }
                return;
            }
            Step::Escalate { errors } => {
                println!("Too many errors ({}), holding error screen", errors);
                show(frame, &screens::too_many_errors(errors, client.last_error()));
                Timer::after(Duration::from_millis(ERROR_HOLD_MS)).await;
                client.clear_errors();
                return;
            }
        }
    }
    println!("No content after {} steps", MAX_STEPS);
}

/// Enter deep sleep with timer and button 1 (GPIO14) wake sources
fn enter_deep_sleep(rtc: &mut Rtc, delay: &mut HalDelay, seconds: u32) -> ! {
    let timer = TimerWakeupSource::new(CoreDuration::from_secs(seconds as u64));

    // Reclaim GPIO14; keep the pull-up so it doesn't float and trigger spurious wakes
    let key_pin = unsafe { esp_hal::peripherals::GPIO14::steal() };
    key_pin.rtcio_pullup(true);
    key_pin.rtcio_pulldown(false);
    let ext0 = Ext0WakeupSource::new(key_pin, WakeupLevel::Low);

    // Small delay to let serial output flush
    delay.delay_ms(100);

    rtc.sleep_deep(&[&timer, &ext0])
}

#[embassy_executor::task]
async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    runner.run().await
}
