use std::fs::File;
use std::io::{self, BufWriter, Write};

use clap::Parser;
use log::{info, warn};

use flowmeter::capture::CaptureEngine;
use flowmeter::export::JsonLinesSink;
use flowmeter::parser::FlowParser;
use flowmeter::settings::Settings;

#[derive(Parser)]
#[command(name = "flowmeter")]
#[command(about = "Passive per-flow traffic measurement")]
struct Cli {
    #[arg(short, long, help = "Network interface to capture from")]
    interface: Option<String>,

    #[arg(short, long, help = "Read packets from a pcap file instead of a live device")]
    read_file: Option<String>,

    #[arg(short, long, help = "Configuration file path")]
    config: Option<String>,

    #[arg(short, long, help = "Write flow records to this file (default: stdout)")]
    output: Option<String>,

    #[arg(short, long, help = "Enable debug logging")]
    debug: bool,
}

/// Capture-time periodic trigger. The first packet anchors the schedule;
/// `due` then reports how many whole periods have elapsed at `now` and
/// advances the deadline past it, so long gaps between packets fire once
/// per missed period instead of once per call.
struct Ticker {
    period: u64,
    next: Option<u64>,
}

impl Ticker {
    fn new(period: u64) -> Ticker {
        Ticker { period, next: None }
    }

    fn due(&mut self, now: u64) -> u64 {
        let next = self.next.get_or_insert(now + self.period);
        let mut fired = 0;
        while now >= *next {
            *next += self.period;
            fired += 1;
        }
        fired
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.debug {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from_file(path)?,
        None => Settings::default(),
    };
    if cli.interface.is_some() {
        settings.capture.interface = cli.interface.clone();
    }
    if cli.output.is_some() {
        settings.output.path = cli.output.clone();
    }

    let writer: Box<dyn Write + Send> = match &settings.output.path {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout()),
    };
    let parser = FlowParser::new(
        settings.parser.to_parser_config(),
        JsonLinesSink::new(writer).into_sink(),
    );

    let mut engine = match &cli.read_file {
        Some(path) => CaptureEngine::open_file(path)?,
        None => CaptureEngine::open_device(
            settings.capture.interface.clone(),
            settings.capture.promiscuous,
            settings.capture.timeout_ms,
        )?,
    };
    info!("capturing from {}", engine.interface());

    let mut avg_ticker = Ticker::new(settings.parser.avg_period_secs * 1_000_000);
    let mut collect_ticker = Ticker::new(settings.parser.collect_period_secs * 1_000_000);
    let mut evicted = 0usize;

    loop {
        let pkt = match engine.next() {
            Ok(Some(pkt)) => pkt,
            Ok(None) => {
                if engine.is_live() {
                    continue;
                }
                break;
            }
            Err(e) => {
                warn!("capture error: {e}");
                break;
            }
        };

        if let Err(e) = parser.handle_packet(&pkt.ip, &pkt.transport, pkt.timestamp) {
            // Contract violations here mean inconsistent decoder output;
            // log and keep going.
            warn!("packet dropped: {e}");
        }

        // Both cadences run on capture time, so offline replays behave the
        // same as live captures. Averaging decays once per period, so a gap
        // spanning several periods fires once for each of them.
        for _ in 0..avg_ticker.due(pkt.timestamp) {
            parser.update_averages();
        }
        if collect_ticker.due(pkt.timestamp) > 0 {
            evicted += parser.collect_expired(parser.last_rx());
        }
    }

    evicted += parser.collect_all();

    let stats = engine.stats();
    info!(
        "done: {} frames ({} bytes, {} ignored), {} flows written, {} bytes of series storage",
        stats.packets,
        stats.bytes,
        stats.ignored,
        evicted,
        parser.mem_bytes()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_anchors_on_first_timestamp() {
        let mut ticker = Ticker::new(1_000_000);

        assert_eq!(ticker.due(5_000_000), 0);
        assert_eq!(ticker.due(5_999_999), 0);
        assert_eq!(ticker.due(6_000_000), 1);
    }

    #[test]
    fn test_ticker_catches_up_across_gaps() {
        let mut ticker = Ticker::new(1_000_000);
        assert_eq!(ticker.due(5_000_000), 0);

        // A quiet stretch of five periods owes five firings, not one.
        assert_eq!(ticker.due(10_500_000), 5);
        assert_eq!(ticker.due(10_999_999), 0);
        assert_eq!(ticker.due(11_000_000), 1);
    }
}
