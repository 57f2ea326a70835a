use clap::Parser;
use porecall::cli::{run, Opts};
use std::error::Error as _;

fn main() {
    env_logger::init();
    let opts = Opts::parse();
    if let Err(e) = run(&opts) {
        eprintln!("error: {}", e);
        let mut source = e.source();
        while let Some(s) = source {
            eprintln!("  caused by: {}", s);
            source = s.source();
        }
        std::process::exit(1);
    }
}
