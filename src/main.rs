use clap::Parser;
use siftsearch::Opts;
use siftsearch::cli::SubCommandExtend;
use siftsearch::config::SubCommand;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();

    match &opts.subcmd {
        SubCommand::Index(config) => config.run(&opts).await,
        SubCommand::Dump(config) => config.run(&opts).await,
        SubCommand::Match(config) => config.run(&opts).await,
    }
}
