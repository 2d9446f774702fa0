//! Integration tests for the BLE calculator firmware.
//!
//! Run after flashing the firmware; drives the calculator service over the
//! air through a local Bluetooth adapter.

mod ble_client;

use std::time::Duration;

use clap::{Parser, ValueEnum};
use colored::Colorize;

use ble_client::{CalculatorClient, BACKGROUND, FOREGROUND};
use tests::{print_results, run_all_tests};

/// Which calculator service variant to test
#[derive(Clone, Copy, ValueEnum)]
enum Variant {
    Foreground,
    Background,
}

#[derive(Parser)]
#[command(name = "integration-tests")]
#[command(about = "Integration tests for the BLE calculator firmware")]
struct Args {
    /// Device name prefix to scan for
    #[arg(short, long, default_value = "Calc-")]
    name: String,

    /// Service variant (UUID set) to drive
    #[arg(short, long, value_enum, default_value = "foreground")]
    variant: Variant,

    /// BLE scan timeout in seconds
    #[arg(long, default_value = "10")]
    scan_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let uuids = match args.variant {
        Variant::Foreground => &FOREGROUND,
        Variant::Background => &BACKGROUND,
    };

    println!("{}", "BLE Calculator Integration Tests".bold());
    println!("Scanning for \"{}\"...", args.name);

    let client = CalculatorClient::connect_by_prefix(
        &args.name,
        uuids,
        Duration::from_secs(args.scan_timeout),
    )
    .await?;
    println!("{}", "Connected!".green());

    println!("\nRunning tests...\n");

    let results = run_all_tests(&client).await;
    print_results(&results);

    let _ = client.disconnect().await;

    // Exit with error code if any tests failed
    let failed = results.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
