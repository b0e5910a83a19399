use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use structopt::StructOpt;

use map_reduce::{Config, Job, Master};

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opt {
    /// Job name, shared with the workers
    #[structopt(short, long, default_value = "wc")]
    job: String,

    /// Directory for intermediate and output files
    #[structopt(short, long, parse(from_os_str))]
    dir: PathBuf,

    /// Socket to listen on, defaults to <dir>/mr-master.sock
    #[structopt(short, long, parse(from_os_str))]
    socket: Option<PathBuf>,

    /// Timeout in seconds for a single task dispatch
    #[structopt(short, long, default_value = "30")]
    timeout: u64,

    #[structopt(long, default_value = "10")]
    nreduce: usize,

    /// Files to process, one map task each
    #[structopt(name = "FILE", parse(from_os_str))]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let mut config =
        Config::in_dir(&opt.dir).with_dispatch_timeout(Duration::from_secs(opt.timeout));
    if let Some(socket) = opt.socket {
        config = config.with_master_address(socket);
    }
    let master = Master::new(Job::new(opt.job, opt.files, opt.nreduce), config)?;
    master.run().await?;
    let merged = master.merge()?;
    println!("{}", merged.display());
    master.shutdown_workers().await;
    Ok(())
}
