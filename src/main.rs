mod backups;
mod builder;
mod chain;
mod cli;
mod client;
mod completion;
mod config;
mod database;
mod error;
mod processes;
mod protocol;
mod restores;
mod retention;
mod runner;
mod schedules;
mod schema;
mod server;
mod utils;
mod validator;

use cli::Cli;
use log::error;

fn main() {
    if let Err(err) = Cli::handle_command_line() {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
