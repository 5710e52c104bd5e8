use std::io;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use crossterm::style::Stylize;

mod app;

use app::App;
use app::commands::Cli;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", format!("{err:#}").red());
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut stdout = io::stdout();
    let Some(command) = cli.command else {
        return App::help(&mut stdout);
    };
    let app = App::load()?;
    let result = app.run(command, &mut stdout);
    if let Err(err) = &result {
        tracing::warn!(error = %err, "command failed");
    }
    result
}
