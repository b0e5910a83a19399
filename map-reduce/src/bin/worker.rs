use std::path::PathBuf;

use anyhow::{anyhow, Result};
use structopt::StructOpt;

use map_reduce::{app, Config, Worker};

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opt {
    /// Socket of the master
    #[structopt(short, long, parse(from_os_str))]
    master: PathBuf,

    /// Job name, shared with the master
    #[structopt(short, long, default_value = "wc")]
    job: String,

    /// Application providing map and reduce: pagerank or wc
    #[structopt(short, long, default_value = "wc")]
    app: String,

    /// Directory for intermediate and output files
    #[structopt(short, long, parse(from_os_str))]
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let (map, reduce) =
        app::by_name(&opt.app).ok_or_else(|| anyhow!("unknown application {:?}", opt.app))?;
    let config = Config::in_dir(&opt.dir).with_master_address(opt.master);
    Worker::new(opt.job, map, reduce, config).start().await
}
