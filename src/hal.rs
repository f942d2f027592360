//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for hardware access (GPIO, I2C, UART, DHT).
//!     abstracts away the difference between running on a real Raspberry Pi
//!     (using `rppal`) and a development machine (using a simulating mock).
//!
//! design philosophy:
//!     - "Compile Anywhere": the engine builds and runs on any Linux/Mac box.
//!     - "Claim, then use": pins are claimed by a hardware session and released
//!       by it; writes to unclaimed pins are errors, releases are idempotent.
//!
//! relationships:
//!     - used by: sensors/*.rs (sample readers and actuator outputs)
//!     - uses: rppal (on feature="hardware")
//!     - uses: std::process::Command (python DHT driver, same as the old host)
//!
//! ==============================================================================

use anyhow::Result;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::DhtModel;

pub trait HardwareProvider: Send + Sync {
    /// claim a pin as an output driven to `initial`
    fn claim_output(&self, pin: u8, initial: bool) -> Result<()>;
    fn claim_input(&self, pin: u8) -> Result<()>;
    /// give a pin back. silent when the pin is not claimed.
    fn release_pin(&self, pin: u8);
    fn write_gpio(&self, pin: u8, level: bool) -> Result<()>;
    fn read_gpio(&self, pin: u8) -> Result<bool>;
    fn i2c_transfer(&self, addr: u8, write_data: &[u8], read_len: usize) -> Result<Vec<u8>>;
    /// Ok(None) means the sensor had nothing ready this time
    fn read_dht(&self, pin: u8, model: DhtModel) -> Result<Option<(f32, f32)>>;
    fn open_serial(&self, path: &str, baud_rate: u32) -> Result<()>;
    /// one line without the terminator, or None if nothing arrived in time
    fn read_serial_line(&self, timeout: Duration) -> Result<Option<String>>;
    fn close_serial(&self);
}

/// poisoned locks are recovered; the guarded state stays usable
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For Non-Hardware Build)
// ==============================================================================================
#[cfg(not(feature = "hardware"))]
pub use mock::Hal;

#[cfg(not(feature = "hardware"))]
mod mock {
    use super::*;
    use anyhow::{anyhow, bail};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    /// delay between the trigger falling and the simulated echo rising
    const ECHO_LEAD: Duration = Duration::from_micros(50);

    const MOCK_NMEA: [&str; 4] = [
        "$GPGGA,092750.000,5321.6802,N,00630.3372,W,1,8,1.03,61.7,M,55.2,M,,*76",
        "$GPRMC,092750.000,A,5321.6802,N,00630.3372,W,0.02,31.66,280511,,,A*43",
        "$GPGSA,A,3,10,07,05,02,29,04,08,13,,,,,1.72,1.03,1.38*0A",
        "$GPGGA,092751.000,5321.6802,N,00630.3371,W,1,8,1.03,61.7,M,55.3,M,,*75",
    ];

    #[derive(Debug, Clone, Copy)]
    struct MockPin {
        output: bool,
        level: bool,
    }

    #[derive(Debug)]
    struct MockRanger {
        trigger: u8,
        echo: u8,
        pulse: Duration,
        fired: Option<Instant>,
    }

    pub struct Hal {
        pins: Mutex<HashMap<u8, MockPin>>,
        rangers: Mutex<Vec<MockRanger>>,
        adc_value: u8,
        dht: (f32, f32),
        serial_open: AtomicBool,
        nmea_cursor: AtomicUsize,
    }

    impl Hal {
        pub fn new() -> Result<Self> {
            tracing::info!("Using MOCK HAL (No hardware access)");
            Ok(Self {
                pins: Mutex::new(HashMap::new()),
                rangers: Mutex::new(Vec::new()),
                adc_value: 35,
                dht: (25.0, 50.0),
                serial_open: AtomicBool::new(false),
                nmea_cursor: AtomicUsize::new(0),
            })
        }

        /// answer pulses on `trigger` with an echo on `echo` lasting the round
        /// trip time of `distance_cm`
        pub fn with_ranger(self, trigger: u8, echo: u8, distance_cm: f64) -> Self {
            let pulse = Duration::from_secs_f64(distance_cm * 2.0 / 34300.0);
            lock(&self.rangers).push(MockRanger { trigger, echo, pulse, fired: None });
            self
        }

        /// force the level an input pin reads back
        pub fn set_input(&self, pin: u8, level: bool) {
            lock(&self.pins).entry(pin).or_insert(MockPin { output: false, level: false }).level = level;
        }

        pub fn output_level(&self, pin: u8) -> Option<bool> {
            lock(&self.pins).get(&pin).filter(|p| p.output).map(|p| p.level)
        }

        pub fn is_claimed(&self, pin: u8) -> bool {
            lock(&self.pins).contains_key(&pin)
        }
    }

    impl HardwareProvider for Hal {
        fn claim_output(&self, pin: u8, initial: bool) -> Result<()> {
            tracing::debug!("[MOCK GPIO] Pin {} claimed as output ({})", pin, initial);
            lock(&self.pins).insert(pin, MockPin { output: true, level: initial });
            Ok(())
        }

        fn claim_input(&self, pin: u8) -> Result<()> {
            tracing::debug!("[MOCK GPIO] Pin {} claimed as input", pin);
            lock(&self.pins).entry(pin).or_insert(MockPin { output: false, level: false }).output = false;
            Ok(())
        }

        fn release_pin(&self, pin: u8) {
            if lock(&self.pins).remove(&pin).is_some() {
                tracing::debug!("[MOCK GPIO] Pin {} released", pin);
            }
        }

        fn write_gpio(&self, pin: u8, level: bool) -> Result<()> {
            let previous = {
                let mut pins = lock(&self.pins);
                let entry = pins.get_mut(&pin).ok_or_else(|| anyhow!("pin {} not claimed", pin))?;
                if !entry.output {
                    bail!("pin {} is an input", pin);
                }
                std::mem::replace(&mut entry.level, level)
            };
            if previous && !level {
                for ranger in lock(&self.rangers).iter_mut().filter(|r| r.trigger == pin) {
                    ranger.fired = Some(Instant::now());
                }
            }
            Ok(())
        }

        fn read_gpio(&self, pin: u8) -> Result<bool> {
            for ranger in lock(&self.rangers).iter().filter(|r| r.echo == pin) {
                if let Some(fired) = ranger.fired {
                    let since = fired.elapsed();
                    return Ok(since >= ECHO_LEAD && since < ECHO_LEAD + ranger.pulse);
                }
            }
            lock(&self.pins)
                .get(&pin)
                .map(|p| p.level)
                .ok_or_else(|| anyhow!("pin {} not claimed", pin))
        }

        fn i2c_transfer(&self, addr: u8, write_data: &[u8], read_len: usize) -> Result<Vec<u8>> {
            tracing::debug!("[MOCK I2C] Addr: 0x{:02X}, Write: {:?}, ReadLen: {}", addr, write_data, read_len);
            Ok(vec![self.adc_value; read_len])
        }

        fn read_dht(&self, pin: u8, model: DhtModel) -> Result<Option<(f32, f32)>> {
            tracing::debug!("[MOCK DHT] Reading {:?} on pin {}", model, pin);
            Ok(Some(self.dht))
        }

        fn open_serial(&self, path: &str, baud_rate: u32) -> Result<()> {
            tracing::debug!("[MOCK UART] Open {} @ {}", path, baud_rate);
            self.serial_open.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn read_serial_line(&self, _timeout: Duration) -> Result<Option<String>> {
            if !self.serial_open.load(Ordering::SeqCst) {
                bail!("serial port not open");
            }
            let i = self.nmea_cursor.fetch_add(1, Ordering::SeqCst);
            Ok(Some(MOCK_NMEA[i % MOCK_NMEA.len()].to_string()))
        }

        fn close_serial(&self) {
            self.serial_open.store(false, Ordering::SeqCst);
        }
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================
#[cfg(feature = "hardware")]
pub use real::Hal;

#[cfg(feature = "hardware")]
mod real {
    use super::*;
    use anyhow::{anyhow, bail};
    use rppal::gpio::{Gpio, InputPin, OutputPin};
    use rppal::i2c::I2c;
    use rppal::uart::{Parity, Uart};
    use std::collections::HashMap;
    use std::process::Command;
    use std::time::Instant;

    enum PinHandle {
        Output(OutputPin),
        Input(InputPin),
    }

    pub struct Hal {
        gpio: Gpio,
        pins: Mutex<HashMap<u8, PinHandle>>,
        uart: Mutex<Option<Uart>>,
    }

    impl Hal {
        pub fn new() -> Result<Self> {
            tracing::info!("Using REAL HARDWARE HAL (rppal)");
            Ok(Self {
                gpio: Gpio::new()?,
                pins: Mutex::new(HashMap::new()),
                uart: Mutex::new(None),
            })
        }
    }

    impl HardwareProvider for Hal {
        fn claim_output(&self, pin: u8, initial: bool) -> Result<()> {
            let mut out = self.gpio.get(pin)?.into_output();
            if initial { out.set_high() } else { out.set_low() }
            lock(&self.pins).insert(pin, PinHandle::Output(out));
            Ok(())
        }

        fn claim_input(&self, pin: u8) -> Result<()> {
            let input = self.gpio.get(pin)?.into_input();
            lock(&self.pins).insert(pin, PinHandle::Input(input));
            Ok(())
        }

        fn release_pin(&self, pin: u8) {
            // dropping the handle restores the pin's previous mode
            if let Some(PinHandle::Output(mut out)) = lock(&self.pins).remove(&pin) {
                out.set_low();
            }
        }

        fn write_gpio(&self, pin: u8, level: bool) -> Result<()> {
            match lock(&self.pins).get_mut(&pin) {
                Some(PinHandle::Output(out)) => {
                    if level { out.set_high() } else { out.set_low() }
                    Ok(())
                }
                Some(PinHandle::Input(_)) => bail!("pin {} is an input", pin),
                None => bail!("pin {} not claimed", pin),
            }
        }

        fn read_gpio(&self, pin: u8) -> Result<bool> {
            match lock(&self.pins).get(&pin) {
                Some(PinHandle::Input(input)) => Ok(input.is_high()),
                Some(PinHandle::Output(out)) => Ok(out.is_set_high()),
                None => Err(anyhow!("pin {} not claimed", pin)),
            }
        }

        fn i2c_transfer(&self, addr: u8, write_data: &[u8], read_len: usize) -> Result<Vec<u8>> {
            let mut i2c = I2c::new()?;
            i2c.set_slave_address(addr as u16)?;

            if !write_data.is_empty() {
                i2c.write(write_data)?;
            }

            let mut read_buf = vec![0u8; read_len];
            if read_len > 0 {
                i2c.read(&mut read_buf)?;
            }
            Ok(read_buf)
        }

        fn read_dht(&self, pin: u8, model: DhtModel) -> Result<Option<(f32, f32)>> {
            // bit-banged dht timing is unreliable from userspace; the adafruit
            // driver handles it with retries and timing compensation
            let class = match model {
                DhtModel::Dht11 => "DHT11",
                DhtModel::Dht22 => "DHT22",
            };
            let script = format!(
                r#"
import sys, json
try:
    import adafruit_dht, board
    dht = adafruit_dht.{}(board.D{})
    try:
        t, h = dht.temperature, dht.humidity
        print(json.dumps({{"t": t, "h": h}}) if t is not None and h is not None else "null")
    finally:
        dht.exit()
except Exception as e:
    print(str(e), file=sys.stderr)
    sys.exit(1)
"#,
                class, pin
            );
            let output = Command::new("python3").args(["-c", &script]).output()?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!("DHT read failed: {}", stderr.trim());
            }
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if stdout == "null" || stdout.is_empty() {
                return Ok(None);
            }
            let v: serde_json::Value = serde_json::from_str(&stdout)
                .map_err(|e| anyhow!("JSON parse error: {} (got: {})", e, stdout))?;
            let t = v["t"].as_f64().ok_or_else(|| anyhow!("Missing temp"))?;
            let h = v["h"].as_f64().ok_or_else(|| anyhow!("Missing humidity"))?;
            Ok(Some((t as f32, h as f32)))
        }

        fn open_serial(&self, path: &str, baud_rate: u32) -> Result<()> {
            let uart = Uart::with_path(path, baud_rate, Parity::None, 8, 1)?;
            *lock(&self.uart) = Some(uart);
            Ok(())
        }

        fn read_serial_line(&self, timeout: Duration) -> Result<Option<String>> {
            let mut guard = lock(&self.uart);
            let uart = guard.as_mut().ok_or_else(|| anyhow!("serial port not open"))?;
            let deadline = Instant::now() + timeout;
            let mut line = Vec::with_capacity(96);
            let mut byte = [0u8; 1];

            while Instant::now() < deadline {
                uart.set_read_mode(0, deadline.saturating_duration_since(Instant::now()))?;
                if uart.read(&mut byte)? == 0 {
                    continue;
                }
                match byte[0] {
                    b'\n' => return Ok(Some(String::from_utf8_lossy(&line).trim().to_string())),
                    b => line.push(b),
                }
            }
            Ok(None)
        }

        fn close_serial(&self) {
            lock(&self.uart).take();
        }
    }
}
