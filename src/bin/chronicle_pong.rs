use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{info, warn};

use vanilla_chronicle::reset::remove_recursive;
use vanilla_chronicle::{SourceRecord, Store};

const EXPECTED_VALUE: i64 = 0x0bad_cafe_dead_beef;
const EXPECTED_LABEL: &str = "FooBar";
const EXPECTED_DETAIL: &str = "AnotherFooBar";

/// Reads the records written by chronicle-ping and checks that every source's
/// sequence arrives gap-free and in order.
#[derive(Parser, Debug)]
#[command(name = "chronicle-pong", version, about = "Concurrent tailer verifier")]
struct Args {
    /// Input store directory
    #[arg(short = 'i', long = "input", default_value = "/tmp/__test/chr")]
    input: PathBuf,

    /// Records written per writer thread
    #[arg(short = 'n', long = "max-count", default_value_t = 10_000_000)]
    max_count: u64,

    #[arg(short = 'w', long = "writer-threads", default_value_t = 4)]
    writer_threads: u64,

    #[arg(short = 'r', long = "reader-threads", default_value_t = 4)]
    reader_threads: usize,

    /// Delete the store directory before starting
    #[arg(short = 'x', long = "delete")]
    delete: bool,
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn open_when_ready(path: &Path) -> vanilla_chronicle::Result<Store> {
    loop {
        match Store::open_read_only(path) {
            Ok(store) if store.first_index().is_some() => return Ok(store),
            Ok(_) => {}
            Err(vanilla_chronicle::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    if args.delete {
        remove_recursive(&args.input)?;
    }

    println!("About to start reading from {}", args.input.display());
    let store = open_when_ready(&args.input)?;
    let expected = args.writer_threads * args.max_count;

    let handles: Vec<_> = (0..args.reader_threads)
        .map(|reader| {
            let store = store.clone();
            thread::spawn(move || -> Result<(), String> {
                let started = Instant::now();
                let mut next_seq: HashMap<i32, u64> = HashMap::new();
                let mut tailer = store.create_tailer();
                let mut count = 0u64;
                while count != expected {
                    if !tailer.advance().map_err(|err| err.to_string())? {
                        std::hint::spin_loop();
                        continue;
                    }
                    let record = SourceRecord::read_from(&mut tailer).map_err(|err| err.to_string())?;
                    let want = next_seq.entry(record.source_id).or_insert(0);
                    if record.seq != *want
                        || record.value != EXPECTED_VALUE
                        || record.label != EXPECTED_LABEL
                        || record.detail != EXPECTED_DETAIL
                    {
                        warn!("reader {reader}: unexpected record {:?} at {:?}", record, tailer.index());
                        return Err(format!("unexpected value at {:?}", tailer.index()));
                    }
                    *want += 1;
                    count += 1;
                    if count % 1_000_000 == 0 {
                        info!("reader {reader}: {count} records, {:.3} ms", started.elapsed().as_secs_f64() * 1e3);
                    }
                }
                println!("{:.3} ms", started.elapsed().as_secs_f64() * 1e3);
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle.join().map_err(|_| "reader thread panicked")??;
    }
    Ok(())
}
