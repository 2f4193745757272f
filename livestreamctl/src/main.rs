use clap::Parser;

fn main() {
    let cli = livestreamctl::Cli::parse();
    livestreamctl::init_tracing(cli.verbose);
    if let Err(err) = livestreamctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
