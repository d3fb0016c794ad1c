use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::Ordering;

use log::warn;
use simplelog::{Config, LevelFilter, TermLogger, TerminalMode};
use structopt::StructOpt;

use cnc_control::{FlashSession, Host, Result, Transport, UsbTransport};

/// Host tool for the CNC controller bootloader.
#[derive(Debug, StructOpt)]
#[structopt(name = "cncControl")]
struct Options {
    /// Configure log level
    #[structopt(long, default_value = "warn", env = "LOG_LEVEL")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Write provided Intel Hex file to device
    Flash {
        /// Intel HEX image to program
        filename: PathBuf,
    },
}

fn main() {
    let options = Options::from_args();
    TermLogger::init(options.log_level, Config::default(), TerminalMode::Mixed).unwrap();

    if let Err(error) = run(options) {
        eprintln!("Error: {}", error);
        process::exit(1);
    }
}

fn run(options: Options) -> Result<()> {
    let context = rusb::Context::new()?;
    let transport = UsbTransport::open(&context)?;

    // SIGINT only interrupts between transfers, keeping the device's
    // request/response turn-taking intact.
    let cancel = transport.cancel_flag();
    if ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst)).is_err() {
        warn!("could not install SIGINT handler; ^C will abort mid-transfer");
    }

    let mut bcp = Host::open(transport)?;

    match options.command {
        Command::Flash { filename } => flash(&mut bcp, &filename),
    }
}

fn flash<T: Transport>(bcp: &mut Host<T>, filename: &Path) -> Result<()> {
    println!("--Flashing Device--");
    let mut session = FlashSession::open(bcp, filename)?;

    print!("Writing:\n[");
    flush_stdout();
    if let Err(error) = session.write(progress_mark, 2) {
        println!("]");
        return Err(error);
    }
    println!("]");

    print!("Verifying:\n[");
    flush_stdout();
    if let Err(error) = session.verify(progress_mark, 2) {
        println!("]");
        return Err(error);
    }
    println!("]");

    match session.size() {
        Ok((pages, bytes)) => println!(
            "Device successfully flashed ({} pages, {} bytes)",
            pages, bytes
        ),
        Err(_) => println!("Device successfully flashed"),
    }

    Ok(())
}

fn progress_mark() {
    print!("#");
    flush_stdout();
}

fn flush_stdout() {
    let _ = io::stdout().flush();
}
