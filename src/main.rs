use clap::Parser;
use qnh_logger::app::{self, Options};
use qnh_logger::port::serial::{self, SerialOpener};
use std::io::Write;
use std::panic::{self, PanicHookInfo};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

fn init_tracing(verbose: bool) {
    // stdout carries the line protocol feed, so logs go to stderr.
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn list_ports() -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    for port in serial::available_ports()? {
        if port.description.is_empty() {
            writeln!(stdout, "{}", port.name)?;
        } else {
            writeln!(stdout, "{}\t{}", port.name, port.description)?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd, Telegraf execd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_tracing(options.verbose);

    if options.list_ports {
        match list_ports() {
            Ok(()) => std::process::exit(EXIT_SUCCESS),
            Err(why) => {
                eprintln!("error: {}", why);
                std::process::exit(EXIT_ERROR);
            }
        }
    }

    let mut stdout = std::io::stdout();
    match app::run_with_io(options, Box::new(SerialOpener), shutdown_signal(), &mut stdout).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
