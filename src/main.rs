use colored::Colorize;
use std::process::ExitCode;

fn main() -> ExitCode {
    match mongovisor::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let err = anyhow::Error::from(err);
            eprintln!("{} {:#}", "error:".bright_red().bold(), err);
            ExitCode::FAILURE
        }
    }
}
