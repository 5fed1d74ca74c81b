//! Lists the connected EZ-USB devices.

use fx2stream::{ChipType, Fx2, Result, Selector};
use structopt::StructOpt;

use std::process;

#[derive(StructOpt)]
struct Opts {
    /// Only list known devices of this chip type
    #[structopt(long = "type")]
    chip: Option<ChipType>,
}

fn main() {
    match run() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

fn run() -> Result<()> {
    env_logger::init();
    let opts = Opts::from_args();

    let selector = Selector {
        chip: opts.chip,
        ..Selector::default()
    };
    for device in fx2stream::devices_filtered(&selector)? {
        match device.and_then(|device| dump_device(&device)) {
            Ok(()) => {}
            Err(err) => {
                eprintln!("{}", err);
            }
        }
    }

    Ok(())
}

fn dump_device(device: &Fx2) -> Result<()> {
    println!(
        "Bus {:03} Address {:03}: ID {:04x}:{:04x} {} ({})",
        device.bus_number(),
        device.device_address(),
        device.vid(),
        device.pid(),
        device.designation().unwrap_or("unknown device"),
        device.chip(),
    );
    match device.product() {
        Ok(product) => println!("  Product: {:?}", product),
        Err(e) => println!("  Product: <{}>", e),
    }

    Ok(())
}
