use std::path::PathBuf;

use anyhow::Result;
use structopt::StructOpt;

use map_reduce::{app::pagerank, Config};

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opt {
    /// Directory for intermediate and output files
    #[structopt(short, long, parse(from_os_str))]
    dir: PathBuf,

    #[structopt(short, long, default_value = "10")]
    iterations: usize,

    #[structopt(long, default_value = "10")]
    nreduce: usize,

    /// Graph files, `page: rank, out1, out2` per line
    #[structopt(name = "FILE", parse(from_os_str))]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let config = Config::in_dir(&opt.dir);
    let ranks = pagerank::run(&opt.files, opt.nreduce, opt.iterations, &config).await?;
    for (page, rank) in ranks.iter() {
        println!("{}: {}", page, rank);
    }
    Ok(())
}
