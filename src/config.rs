use std::{path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which modem to talk to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ModemConfig {
    /// A modem on a tty/COM port.
    Serial(SerialConfig),

    /// A simulated in-memory modem.
    /// Lets the gateway run without any hardware attached.
    Mock,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self::Serial(SerialConfig::default())
    }
}

/// How to open the serial port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SerialConfig {
    /// The path to the device.
    /// Likely "/dev/ttyUSBx" or "COMx".
    pub path: String,

    /// Line speed.
    pub baud: u32,

    /// Upper bound on a single drain of the port.
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".into(),
            baud: 115_200,
            read_timeout_ms: 1000,
        }
    }
}

impl SerialConfig {
    /// The read timeout as a duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// How long to wait after each kind of command before reading the reply.
///
/// The modem has no framing telling us a reply is complete,
/// so we wait a fixed time and take whatever arrived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timings {
    /// Settle time for commands without a specific setting.
    pub default_settle_ms: u64,

    /// Settle time for listing unread messages.
    pub list_settle_ms: u64,

    /// Settle time for deleting a message slot.
    pub delete_settle_ms: u64,

    /// Settle time after submitting an SMS body.
    pub submit_settle_ms: u64,

    /// Time between the end of one poll cycle and the start of the next.
    pub poll_interval_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            default_settle_ms: 1000,
            list_settle_ms: 1000,
            delete_settle_ms: 1000,
            submit_settle_ms: 3000,
            poll_interval_ms: 30_000,
        }
    }
}

impl Timings {
    /// Very short timings, for tests against the mock modem.
    pub fn fast() -> Self {
        Self {
            default_settle_ms: 1,
            list_settle_ms: 1,
            delete_settle_ms: 1,
            submit_settle_ms: 1,
            poll_interval_ms: 10,
        }
    }

    /// The poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// The configuration used for running the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// The modem to use.
    pub modem: ModemConfig,

    /// Per command settle times and the poll interval.
    pub timings: Timings,

    /// Where received messages are stored.
    pub store_path: PathBuf,

    /// The HTTP port.
    pub port: u16,

    /// Shared secret expected in the `X-API-KEY` header.
    pub api_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            modem: ModemConfig::default(),
            timings: Timings::default(),
            store_path: PathBuf::from("sms.jsonl"),
            port: 5000,
            api_key: String::new(),
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default().with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Not valid RON: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            modem: ModemConfig::Serial(SerialConfig {
                path: "/dev/ttyUSB2".into(),
                ..Default::default()
            }),
            api_key: "change-me".into(),
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap_or_else(|e| format!("Could not serialize config: {e}"))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self> {
        let s = std::fs::read_to_string(p.as_ref()).map_err(|e| {
            Error::BadConfig(format!("Could not read {:?}: {e}", p.as_ref()))
        })?;

        Self::deserialize(&s)
    }

    fn check_api_key(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(Error::BadConfig(
                "An API key is required. Set `api_key` in the config or pass --api-key.".into(),
            ));
        }

        Ok(())
    }

    fn check_serial(&self) -> Result<()> {
        if let ModemConfig::Serial(serial) = &self.modem {
            if serial.path.is_empty() {
                return Err(Error::BadConfig("The serial device path is empty".into()));
            }
            if serial.baud == 0 {
                return Err(Error::BadConfig(format!(
                    "Baud rate of zero is not usable for `{}`",
                    serial.path
                )));
            }
        }

        Ok(())
    }

    fn check_timings(&self) -> Result<()> {
        if self.timings.poll_interval_ms == 0 {
            return Err(Error::BadConfig(
                "The poll interval must be above zero, otherwise the modem is never left alone"
                    .into(),
            ));
        }

        Ok(())
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        self.check_api_key()?;
        self.check_serial()?;
        self.check_timings()?;

        Ok(())
    }
}
