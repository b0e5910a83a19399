use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use atomicwrites::{AllowOverwrite, AtomicFile};
use log::info;
use structopt::StructOpt;

use map_reduce::{app, sequential};

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opt {
    /// Application providing map and reduce: pagerank or wc
    #[structopt(short, long, default_value = "wc")]
    app: String,

    /// Where to write the `key: value` lines
    #[structopt(short, long, parse(from_os_str), default_value = "mrs-out")]
    output: PathBuf,

    /// Files to process
    #[structopt(name = "FILE", parse(from_os_str))]
    files: Vec<PathBuf>,
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let (map, reduce) =
        app::by_name(&opt.app).ok_or_else(|| anyhow!("unknown application {:?}", opt.app))?;
    let result = sequential::run(&opt.files, map, reduce)?;

    AtomicFile::new(&opt.output, AllowOverwrite)
        .write(|f| {
            let mut w = BufWriter::new(f);
            for (k, v) in result.iter() {
                writeln!(w, "{}: {}", k, v)?;
            }
            w.flush()
        })
        .with_context(|| format!("cannot write {:?}", opt.output))?;
    info!("{} keys written to {:?}", result.len(), opt.output);
    Ok(())
}
