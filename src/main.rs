use clap::Parser;

use rpmemd::daemon;

#[derive(Parser, Debug)]
#[clap(version, author, about)]
struct Args {
    #[clap(short, long, action, help = "a toml file containing configuration")]
    config_file: Option<String>,

    #[clap(short, long, action, help = "the directory holding the pool backing files")]
    poolset_dir: Option<String>,

    #[clap(
        long,
        action,
        help = "use the appliance persistency method (the daemon never flushes)"
    )]
    persist_apm: bool,

    #[clap(long, action, help = "send logs to syslog")]
    use_syslog: bool,

    #[clap(short, long, action, help = "the file to write logs to")]
    log_file: Option<String>,

    #[clap(short, long, action = clap::ArgAction::Count,
           help = "show more in logs, may be provided multiple times")]
    verbose: u8,
}

fn main() {
    let args = Args::parse();

    let opts = daemon::Options {
        config_file: args.config_file,
        poolset_dir: args.poolset_dir,
        persist_apm: args.persist_apm,
        use_syslog: args.use_syslog,
        log_file: args.log_file,
        verbose: args.verbose,
    };

    if let Err(err) = daemon::run(opts) {
        // logging may never have come up, so stderr is the fallback
        eprintln!("rpmemd: {:#}", err);
        std::process::exit(1);
    }
}
