use std::time::Duration;

use embedded_hal::digital::OutputPin;
use linux_embedded_hal::SysfsPin;
use linux_embedded_hal::sysfs_gpio::Direction;
use tracing::{error, info, warn};

use crate::config::GpioMode;
use crate::error::{Error, Result};

/// A single relay driven by a digital output pin.
///
/// A relay without a pin is disabled: state changes are remembered and
/// logged but never reach hardware. This covers both the explicit test mode
/// and the degraded mode entered after the pin failed to open.
pub struct Relay<P> {
    pin: Option<P>,
    state: bool,
}

impl<P: OutputPin> Relay<P> {
    pub fn new(pin: P) -> Self {
        Self {
            pin: Some(pin),
            state: false,
        }
    }

    pub fn disabled() -> Self {
        Self {
            pin: None,
            state: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.pin.is_some()
    }

    pub fn state(&self) -> bool {
        self.state
    }

    pub fn set(&mut self, on: bool) -> Result<()> {
        self.state = on;
        let Some(pin) = self.pin.as_mut() else {
            warn!("GPIO disabled, relay state {} not applied", on);
            return Ok(());
        };
        let applied = if on { pin.set_high() } else { pin.set_low() };
        applied.map_err(|e| Error::Gpio(format!("{e:?}")))
    }

    /// Toggle the relay `count` times as a visible startup signal, ending off.
    pub async fn blink(&mut self, count: usize, interval: Duration, start_on: bool) {
        if !self.is_enabled() {
            return;
        }
        for i in 0..count {
            let on = (i % 2 == 0) == start_on;
            info!("Blinking {}", if on { "on" } else { "off" });
            if let Err(e) = self.set(on) {
                error!("Blink failed: {}", e);
                return;
            }
            tokio::time::sleep(interval).await;
        }
        if self.state {
            if let Err(e) = self.set(false) {
                error!("Failed to reset relay after blink: {}", e);
            }
        }
    }

    /// Drive low and give up the pin. Further `set` calls only log.
    pub fn release(&mut self) {
        if self.pin.is_some() {
            if let Err(e) = self.set(false) {
                error!("Failed to drive relay low on release: {}", e);
            }
            info!("Released GPIO pin");
        }
        self.pin = None;
        self.state = false;
    }
}

/// Open the configured pin as an output initialised low.
///
/// Hardware failures are logged and yield a disabled relay so the caller
/// carries on in degraded mode.
pub fn open(mode: GpioMode) -> Relay<SysfsPin> {
    match mode {
        GpioMode::Disabled => {
            info!("Ignoring GPIO controller");
            Relay::disabled()
        }
        GpioMode::Pin(number) => match open_pin(number) {
            Ok(pin) => {
                info!("Connected to GPIO pin {}", number);
                Relay::new(pin)
            }
            Err(e) => {
                error!("Failed to open GPIO pin {}: {}. Continuing without relay", number, e);
                Relay::disabled()
            }
        },
    }
}

fn open_pin(number: u64) -> Result<SysfsPin> {
    let pin = SysfsPin::new(number);
    pin.export().map_err(|e| Error::Gpio(format!("export: {e:?}")))?;
    pin.set_direction(Direction::Low)
        .map_err(|e| Error::Gpio(format!("set direction: {e:?}")))?;
    Ok(pin)
}
