//! Uploads streaming firmware to an EZ-USB FX2 and pipes stdin or stdout through its slave FIFO.

use fx2stream::{
    Budget, Buffering, BusWidth, ChipType, ClockOption, CpuOption, Direction, Discard, FifoMode,
    FirmwareConfig, Fx2, Image, PinPolarity, Reader, Selector, SignalFd, Stats, StreamState,
    Writer, Zeros, MAX_BLOCK_SIZE,
};
use structopt::StructOpt;

use std::path::PathBuf;
use std::time::Duration;
use std::{env, error, io, process};

/// Time the freshly started firmware gets before the device is opened again.
const SETTLE_TIME: Duration = Duration::from_millis(100);

#[derive(StructOpt, Debug)]
#[structopt(
    name = "fx2stream",
    about = "Streams stdin or stdout through the slave FIFO of an EZ-USB FX2.",
    after_help = "If none of -t, -d or -p are given, the only known device is used. \
                  The DEVICE environment variable (bus,addr) is used when neither -d nor -p is."
)]
struct Opts {
    /// Firmware to upload (.hex, .ihx, .iic or .bix)
    #[structopt(short = "f", long, parse(from_os_str))]
    firmware: PathBuf,

    /// Second stage loader, needed for firmware using external memory
    #[structopt(short = "g", long, parse(from_os_str))]
    loader: Option<PathBuf>,

    /// Target type: an21, fx, fx2 or fx2lp
    #[structopt(short = "t", long = "type")]
    chip: Option<ChipType>,

    /// Target device as hexadecimal vid:pid
    #[structopt(
        short = "d",
        long = "device",
        parse(try_from_str = parse_id),
        conflicts_with = "path"
    )]
    id: Option<(u16, u16)>,

    /// Target device as decimal bus,addr
    #[structopt(short = "p", long, parse(try_from_str = parse_path))]
    path: Option<(u8, u8)>,

    /// Read from the device (USB to host, endpoint 0x86) [default]
    #[structopt(short = "i", long = "in", conflicts_with = "out")]
    input: bool,

    /// Write to the device (host to USB, endpoint 0x02)
    #[structopt(short = "o", long = "out")]
    out: bool,

    /// Discard incoming data or send zeros instead of using stdin/stdout
    #[structopt(short = "0", long)]
    null: bool,

    /// Use a 16 bit wide FIFO bus [default]
    #[structopt(short = "w", long, conflicts_with = "narrow")]
    wide: bool,

    /// Use an 8 bit wide FIFO bus
    #[structopt(short = "8", long)]
    narrow: bool,

    /// Quadruple buffered FIFO [default]
    #[structopt(short = "4", long, conflicts_with_all = &["triple", "double"])]
    quad: bool,

    /// Triple buffered FIFO
    #[structopt(short = "3", long, conflicts_with = "double")]
    triple: bool,

    /// Double buffered FIFO
    #[structopt(short = "2", long)]
    double: bool,

    /// Synchronous slave FIFO [default]
    #[structopt(short = "s", long, conflicts_with = "async")]
    sync: bool,

    /// Asynchronous slave FIFO
    #[structopt(name = "async", short = "a", long = "async")]
    async_: bool,

    /// Transfer block size in bytes (even, at least 2)
    #[structopt(short = "b", long, default_value = "16384")]
    block_size: usize,

    /// Stop after this many bytes (even, divisible by the block size)
    #[structopt(short = "n", long)]
    count: Option<u64>,

    /// Interface clock: [x|30[o]|48[o]][i]
    #[structopt(short = "c", long)]
    ifclk: Option<ClockOption>,

    /// CPU clock in MHz and CLKOUT pin: [12|24|48][o|z][i]
    #[structopt(short = "z", long)]
    cpuclk: Option<CpuOption>,

    /// Invert the "queue full" flag
    #[structopt(short = "l", long)]
    invert_full: bool,

    /// Invert the "queue empty" flag
    #[structopt(short = "e", long)]
    invert_empty: bool,

    /// Invert SLWR
    #[structopt(short = "x", long)]
    invert_slwr: bool,

    /// Invert SLRD
    #[structopt(short = "r", long)]
    invert_slrd: bool,

    /// Invert SLOE
    #[structopt(short = "j", long)]
    invert_sloe: bool,

    /// Invert PKTEND
    #[structopt(short = "k", long)]
    invert_pktend: bool,

    /// Increase verbosity (can be repeated)
    #[structopt(short = "v", long, parse(from_occurrences))]
    verbose: u8,

    /// Decrease verbosity
    #[structopt(short = "q", long, parse(from_occurrences))]
    quiet: u8,
}

fn parse_id(s: &str) -> Result<(u16, u16), String> {
    let err = || format!("`{}` is not a hexadecimal vid:pid pair", s);
    let mut parts = s.splitn(2, ':');
    let vid = parts.next().ok_or_else(err)?;
    let pid = parts.next().ok_or_else(err)?;
    Ok((
        u16::from_str_radix(vid, 16).map_err(|_| err())?,
        u16::from_str_radix(pid, 16).map_err(|_| err())?,
    ))
}

fn parse_path(s: &str) -> Result<(u8, u8), String> {
    let err = || format!("`{}` is not a decimal bus,addr pair", s);
    let mut parts = s.splitn(2, ',');
    let bus = parts.next().ok_or_else(err)?;
    let addr = parts.next().ok_or_else(err)?;
    Ok((
        bus.trim().parse().map_err(|_| err())?,
        addr.trim().parse().map_err(|_| err())?,
    ))
}

impl Opts {
    /// Effective verbosity: 0 is quiet, 1 the default.
    fn verbosity(&self) -> i32 {
        1 + i32::from(self.verbose) - i32::from(self.quiet)
    }

    fn direction(&self) -> Direction {
        match (self.input, self.out) {
            (_, true) => Direction::HostToDevice,
            (_, false) => Direction::DeviceToHost,
        }
    }

    fn firmware_config(&self) -> FirmwareConfig {
        let mut config = FirmwareConfig {
            direction: self.direction(),
            ..FirmwareConfig::default()
        };

        if self.narrow && !self.wide {
            config.bus_width = BusWidth::Eight;
        }
        config.buffering = match (self.quad, self.triple, self.double) {
            (false, true, _) => Buffering::Triple,
            (false, false, true) => Buffering::Double,
            _ => Buffering::Quad,
        };
        if self.async_ && !self.sync {
            config.fifo_mode = FifoMode::Async;
        }
        if let Some(opt) = self.ifclk {
            config.if_clock = opt.clock;
            config.invert_if_clock = opt.invert;
        }
        if let Some(opt) = self.cpuclk {
            config.cpu_clock = opt.clock;
            config.clkout_enable = opt.clkout_enable;
            config.invert_clkout = opt.invert_clkout;
        }

        let pins = [
            (self.invert_full, PinPolarity::FULL),
            (self.invert_empty, PinPolarity::EMPTY),
            (self.invert_slwr, PinPolarity::SLWR),
            (self.invert_slrd, PinPolarity::SLRD),
            (self.invert_sloe, PinPolarity::SLOE),
            (self.invert_pktend, PinPolarity::PKTEND),
        ];
        for &(set, pin) in &pins {
            config.polarity.set(pin, set);
        }

        config
    }

    fn budget(&self) -> Result<Budget, String> {
        if self.block_size < 2
            || self.block_size % 2 != 0
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(format!(
                "block size must be even and between 2 and 2^31 - 2, got {}",
                self.block_size
            ));
        }

        match self.count {
            None => Ok(Budget::Unlimited),
            Some(n) if n < 2 || n % 2 != 0 => Err(format!(
                "byte count must be even and at least 2, got {}",
                n
            )),
            Some(n) if n % self.block_size as u64 != 0 => Err(format!(
                "byte count {} is not divisible by the block size {}",
                n, self.block_size
            )),
            Some(n) => Ok(Budget::Limited(n)),
        }
    }

    fn selector(&self) -> Result<Selector, String> {
        let mut addr = self.path;
        if addr.is_none() && self.id.is_none() {
            if let Some(var) = env::var_os("DEVICE") {
                let var = var.to_string_lossy();
                addr = Some(parse_path(&var).map_err(|e| format!("DEVICE: {}", e))?);
            }
        }
        Ok(Selector {
            chip: self.chip,
            id: self.id,
            addr,
        })
    }
}

fn init_logger(verbosity: i32) {
    let filter = match verbosity {
        i32::MIN..=0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format_timestamp(None)
        .init();
}

fn main() {
    match run() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}

/// Everything needed before the device is touched.
struct Setup {
    config: FirmwareConfig,
    budget: Budget,
    selector: Selector,
    signals: SignalFd,
    firmware: Image,
    loader: Option<Image>,
}

/// Validates the options, catches termination signals and reads the firmware images.
fn prepare(opts: &Opts) -> Result<Setup, Box<dyn error::Error>> {
    let config = opts.firmware_config();
    let budget = opts.budget()?;
    let selector = opts.selector()?;

    // Blocked from here on, so an interrupt can't hit the firmware upload.
    let signals = SignalFd::termination()?;

    let firmware = Image::open(&opts.firmware)?;
    let loader = opts.loader.as_ref().map(Image::open).transpose()?;
    Ok(Setup {
        config,
        budget,
        selector,
        signals,
        firmware,
        loader,
    })
}

fn run() -> Result<(), Box<dyn error::Error>> {
    let opts: Opts = Opts::from_args();
    init_logger(opts.verbosity());

    let Setup {
        config,
        budget,
        selector,
        mut signals,
        firmware,
        loader,
    } = prepare(&opts)?;

    let mut fx2 = Fx2::open(&selector)?;
    log::info!(
        "using {} device {:04x}:{:04x} at {},{}",
        fx2.chip(),
        fx2.vid(),
        fx2.pid(),
        fx2.bus_number(),
        fx2.device_address()
    );
    fx2.load_firmware(&config, &firmware, loader.as_ref())?;
    let fx2 = fx2.reopen_after(SETTLE_TIME)?;
    let port = fx2.open_port(opts.direction())?;

    let stats = match (opts.direction(), opts.null) {
        (Direction::DeviceToHost, false) => {
            let stdout = io::stdout();
            let mut state =
                StreamState::device_to_host(opts.block_size, budget, Writer(stdout.lock()));
            port.stream(&mut signals, &mut state)?
        }
        (Direction::DeviceToHost, true) => {
            let mut state = StreamState::device_to_host(opts.block_size, budget, Discard);
            port.stream(&mut signals, &mut state)?
        }
        (Direction::HostToDevice, false) => {
            let stdin = io::stdin();
            let mut state =
                StreamState::host_to_device(opts.block_size, budget, Reader(stdin.lock()));
            port.stream(&mut signals, &mut state)?
        }
        (Direction::HostToDevice, true) => {
            let mut state = StreamState::host_to_device(opts.block_size, budget, Zeros);
            port.stream(&mut signals, &mut state)?
        }
    };

    report(&opts, &stats);
    Ok(())
}

fn report(opts: &Opts, stats: &Stats) {
    if opts.verbosity() >= 1 {
        eprintln!("{}", stats);
    }
}
