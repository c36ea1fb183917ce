use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show pack telemetry: voltage, current, capacity, faults, balancing
    Status,
    /// Show individual cell voltages in millivolts
    Cells,
    /// Show the hardware identification text
    Hardware,
    /// Show which cells are currently balancing, one digit per cell
    Balancing,
    /// Switch the charge and discharge MOSFETs
    SetMosfet {
        /// Enable the charge MOSFET. If this flag is not present, it will be disabled.
        #[clap(long, short, action)]
        charge: bool,
        /// Enable the discharge MOSFET. If this flag is not present, it will be disabled.
        #[clap(long, short, action)]
        discharge: bool,
    },
    /// Show all available BMS information by running every read command
    All,
    /// Run in daemon mode, periodically fetching and outputting metrics
    Daemon {
        /// Output destination for metrics
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval for fetching metrics (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        interval: Duration,
        /// Comma-separated list of metrics to fetch (e.g., status,cells,hardware,balancing or all)
        #[clap(long, short, use_value_delimiter = true, default_value = "status,cells")]
        metrics: Vec<String>,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read metrics and print them to the standard output (console).
    Console,
    /// Continuously read metrics and publish them to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "jbd bms command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for serial I/O operations (e.g., "500ms", "1s", "2s 500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "500ms")]
    pub timeout: Duration,

    /// Quiet time between transactions on the bus (e.g., "60ms", "100ms")
    /// (some RS485 adapters need extra time to switch between TX/RX)
    #[arg(value_parser = humantime::parse_duration, long, default_value = "60ms")]
    pub delay: Duration,

    /// Drive the RS485 transmit/receive direction over the RTS line
    /// (for adapters without automatic direction selection)
    #[arg(long, action)]
    pub rts_direction: bool,
}
