mod cli;
mod cron;
mod watch;

fn main() {
    std::process::exit(cli::run());
}
