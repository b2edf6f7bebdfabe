use clap::Parser;
use maskfeat::Opts;
use maskfeat::cli::SubCommandExtend;
use maskfeat::config::SubCommand;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    match &opts.subcmd {
        SubCommand::Extract(config) => config.run(&opts).await,
        SubCommand::Worker(config) => config.run(&opts).await,
        SubCommand::Search(config) => config.run(&opts).await,
    }
}
