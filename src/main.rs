use log::error;

use kestrel::app;
use kestrel::config;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    let args = app::parse();

    if let Err(err) = config::parse(&args.config_file) {
        eprintln!("config error: {err}");
        std::process::exit(exitcode::CONFIG);
    }
    let cfg = config::get_config();

    if args.test_config {
        println!("configuration {} is ok", args.config_file);
        std::process::exit(exitcode::OK);
    }

    if let Err(err) = app::init_logging(&args, &cfg) {
        eprintln!("logging error: {err}");
        std::process::exit(exitcode::SOFTWARE);
    }
    cfg.show();

    if let Err(err) = app::run_server(args, (*cfg).clone()) {
        error!("fatal: {err}");
        std::process::exit(exitcode::SOFTWARE);
    }
}
