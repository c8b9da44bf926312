use std::error::Error;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

use clap::Parser;
use log::info;

use vanilla_chronicle::reset::remove_recursive;
use vanilla_chronicle::{SourceRecord, Store, StoreConfig};

/// Appends `max-count` records from each of `writer-threads` threads.
#[derive(Parser, Debug)]
#[command(name = "chronicle-ping", version, about = "Concurrent appender load generator")]
struct Args {
    /// Output store directory
    #[arg(short = 'o', long = "output", default_value = "/tmp/__test/chr")]
    output: PathBuf,

    /// Records written per thread
    #[arg(short = 'n', long = "max-count", default_value_t = 10_000_000)]
    max_count: u64,

    #[arg(short = 'w', long = "writer-threads", default_value_t = 4)]
    writer_threads: i32,

    /// Delete the store directory before starting
    #[arg(short = 'x', long = "delete")]
    delete: bool,

    #[arg(long = "segment-size", default_value_t = 64 * 1024 * 1024)]
    segment_size: usize,
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    if args.delete {
        remove_recursive(&args.output)?;
    }

    let config = StoreConfig {
        segment_size_bytes: args.segment_size,
        ..StoreConfig::default()
    };
    let store = Store::open(&args.output, config)?;
    info!("writing {} x {} records to {}", args.writer_threads, args.max_count, args.output.display());

    let started = Instant::now();
    let handles: Vec<_> = (0..args.writer_threads)
        .map(|source_id| {
            let store = store.clone();
            let max_count = args.max_count;
            thread::spawn(move || -> vanilla_chronicle::Result<()> {
                let mut appender = store.create_appender()?;
                let mut record = SourceRecord {
                    source_id,
                    seq: 0,
                    value: 0x0bad_cafe_dead_beef,
                    label: "FooBar".to_string(),
                    detail: "AnotherFooBar".to_string(),
                };
                for seq in 0..max_count {
                    record.seq = seq;
                    record.append_to(&mut appender)?;
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle
            .join()
            .map_err(|_| "writer thread panicked")??;
    }
    println!("{:.3} ms", started.elapsed().as_secs_f64() * 1e3);
    store.close()?;
    Ok(())
}
