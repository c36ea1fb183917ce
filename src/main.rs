use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use jbdbms_lib::client::JbdBms;
use jbdbms_lib::protocol::Mosfet;
use jbdbms_lib::serialport::{RtsDirection, SerialTransport};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

macro_rules! print_status {
    ($bms:expr) => {
        println!(
            "Status: {:?}",
            $bms.get_status().with_context(|| "Cannot get status")?
        )
    };
}
macro_rules! print_cells {
    ($bms:expr) => {
        println!(
            "Cells: {:?}",
            $bms.get_cells().with_context(|| "Cannot get cell voltages")?
        )
    };
}
macro_rules! print_hardware {
    ($bms:expr) => {
        println!(
            "Hardware: {:?}",
            $bms.get_hardware()
                .with_context(|| "Cannot get hardware id")?
        )
    };
}
macro_rules! print_balancing {
    ($bms:expr) => {
        println!(
            "Balancing: {}",
            $bms.get_status()
                .with_context(|| "Cannot get status")?
                .balance_text()
        )
    };
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let transport = SerialTransport::open(&args.device, args.timeout)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    let direction = if args.rts_direction {
        Some(RtsDirection::new(&transport).with_context(|| "Cannot set up RTS direction control")?)
    } else {
        None
    };

    let mut bms = JbdBms::new(transport);
    bms.set_delay(args.delay);
    if let Some(direction) = direction {
        bms.set_direction_control(Box::new(direction));
    }

    match args.command {
        CliCommands::Status => print_status!(bms),
        CliCommands::Cells => print_cells!(bms),
        CliCommands::Hardware => print_hardware!(bms),
        CliCommands::Balancing => print_balancing!(bms),
        CliCommands::SetMosfet { charge, discharge } => {
            let state = Mosfet::from_switches(charge, discharge);
            bms.set_mosfet(state)
                .with_context(|| format!("Cannot set mosfet state {state:?}"))?;
            println!("Mosfet set to {state:?}");
        }
        CliCommands::All => {
            print_status!(bms);
            print_cells!(bms);
            print_hardware!(bms);
            print_balancing!(bms);
        }
        CliCommands::Daemon {
            output,
            interval,
            metrics,
        } => daemon::run(bms, output, interval, metrics)?,
    }

    Ok(())
}
