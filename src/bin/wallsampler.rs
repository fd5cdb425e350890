use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "wallsampler",
    version,
    about = r#"
wallsampler is an in-process, signal-based, wall-clock stack sampling
profiler. Running it samples its own process; embed the `wallsampler`
library to sample an application instead.

EXAMPLES:
    # Take 10 samples, 1ms apart, and write the [SWIPR] stream to stdout:
    wallsampler --sample-count 10 --micros-between-samples 1000

    # Write the stream to a file instead:
    wallsampler -o profile.swipr
"#
)]
struct Opt {
    /// Number of sample rounds to take. 0 emits header lines only.
    #[arg(long, default_value_t = 10)]
    sample_count: u32,

    /// Sleep, in microseconds, applied after each sample round.
    #[arg(long, default_value_t = 1000)]
    micros_between_samples: u64,

    /// Write the [SWIPR] stream to this file instead of stdout.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();

    let opt = Opt::parse();
    wallsampler::initialize();

    let exit_code = match opt.output {
        Some(path) => match File::create(&path) {
            Ok(file) => wallsampler::request_sample(
                BufWriter::new(file),
                opt.sample_count,
                opt.micros_between_samples,
            ),
            Err(err) => {
                eprintln!("wallsampler: could not create {}: {err}", path.display());
                1
            }
        },
        None => wallsampler::request_sample(
            io::stdout().lock(),
            opt.sample_count,
            opt.micros_between_samples,
        ),
    };

    ExitCode::from(exit_code as u8)
}
