use anyhow::Result;
use clap::Parser;

use stcisp::{
    CancelToken, Family, Flashing, PortConfig, ResetPin, ResetStrategy,
    flashing::FlashPlan,
    progress::BarProgress,
    protocol,
    transport::SerialTransport,
};

#[derive(clap::Parser)]
#[command(
    name = "stcisp",
    about = "Command-line ISP programmer for STC 8051 MCUs",
    version
)]
struct Cli {
    /// Code segment file to flash (BIN, HEX or Intel HEX)
    code_image: Option<String>,
    /// EEPROM segment file to flash (BIN, HEX or Intel HEX)
    eeprom_image: Option<String>,
    /// Serial port of the target
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    port: String,
    /// Protocol family: auto, stc89, stc89a, stc12a, stc12b, stc12, stc15a, stc15, usb15, stc8, stc8d, stc8g
    #[arg(short = 'P', long, default_value = "auto")]
    protocol: Family,
    /// Baud rate while waiting for the MCU and during handshake
    #[arg(short = 'l', long, default_value_t = 2400)]
    handshake: u32,
    /// Baud rate for transfers
    #[arg(short, long, default_value_t = 19200)]
    baud: u32,
    /// RC oscillator frequency in kHz, 0 keeps the current one
    #[arg(short, long, default_value_t = 0.0)]
    trim: f64,
    /// Cycle power automatically
    #[arg(short, long)]
    autoreset: bool,
    /// Pin to hold down when using autoreset
    #[arg(short = 'A', long, default_value = "dtr")]
    resetpin: ResetPin,
    /// Shell command for board power cycling instead of a pin
    #[arg(short, long)]
    resetcmd: Option<String>,
    /// Set option, `name=value`; may be repeated
    #[arg(short, long = "option")]
    option: Vec<String>,
    /// Only erase flash memory
    #[arg(short, long)]
    erase: bool,
    /// Enable debug output
    #[arg(short = 'D', long)]
    debug: bool,
    /// Verbosity, repeat for more
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
    /// List available serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

impl Cli {
    fn log_level(&self) -> simplelog::LevelFilter {
        match (self.debug, self.verbose) {
            (_, 2..) => simplelog::LevelFilter::Trace,
            (true, _) | (_, 1) => simplelog::LevelFilter::Debug,
            _ => simplelog::LevelFilter::Info,
        }
    }

    fn reset_strategy(&self) -> ResetStrategy {
        match (&self.resetcmd, self.autoreset) {
            (Some(cmd), true) => ResetStrategy::Command(cmd.clone()),
            (None, true) => ResetStrategy::Pin(self.resetpin),
            (_, false) => ResetStrategy::Manual,
        }
    }

    fn plan(&self) -> Result<FlashPlan> {
        let mut plan = FlashPlan {
            erase: self.erase,
            ..Default::default()
        };
        for option in &self.option {
            plan.push_option(option)?;
        }
        if !self.erase {
            if let Some(path) = &self.code_image {
                let code = stcisp::format::read_firmware_from_file(path)?;
                log::info!("Code image size: {}", code.len());
                plan.code = Some(code);
            }
            if let Some(path) = &self.eeprom_image {
                let eeprom = stcisp::format::read_firmware_from_file(path)?;
                log::info!("EEPROM image size: {}", eeprom.len());
                plan.eeprom = Some(eeprom);
            }
        }
        Ok(plan)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = simplelog::TermLogger::init(
        cli.log_level(),
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    if cli.list_ports {
        for port in SerialTransport::scan_ports()? {
            log::info!("{}", port);
        }
        #[cfg(feature = "usb")]
        match stcisp::transport::UsbTransport::list_devices() {
            Ok(devices) => devices.iter().for_each(|d| log::info!("{}", d)),
            Err(e) => log::debug!("USB scan skipped: {}", e),
        }
        return Ok(());
    }

    let plan = cli.plan()?;
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())?;

    let config = PortConfig {
        port: cli.port.clone(),
        handshake_baud: cli.handshake,
        transfer_baud: cli.baud,
        trim_hz: cli.trim * 1000.0,
    };
    let mut flashing = Flashing::new(protocol::open(cli.protocol, config, cancel)?);
    flashing.connect(&cli.reset_strategy())?;
    let mut progress = BarProgress::new();
    flashing.run(&plan, &mut progress)?;
    Ok(())
}
