use std::process::ExitCode;

use clap::{CommandFactory, Parser, error::ErrorKind};

use vmshelf::app::{self, exit_code};
use vmshelf::cli::{Cli, Commands};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(64),
            };
        }
    };

    let Cli {
        config,
        verbose,
        command,
    } = cli;

    let command = match command {
        Some(cmd) => cmd,
        None => {
            let mut command = Cli::command();
            let _ = command.print_help();
            println!();
            return ExitCode::from(64);
        }
    };

    app::logging::init(verbose);

    let library = match app::open_library(config.as_deref()) {
        Ok(library) => library,
        Err(err) => {
            eprintln!("Error: {err}");
            return exit_code(&err);
        }
    };

    let exit = match command {
        Commands::List(args) => app::handle_list(&library, args),
        Commands::Refresh => app::handle_refresh(&library),
        Commands::Create(args) => app::handle_create(&library, args),
        Commands::ImportDrive(args) => app::handle_import_drive(&library, args),
        Commands::CreateDrive(args) => app::handle_create_drive(&library, args),
        Commands::RemoveDrive(args) => app::handle_remove_drive(&library, args),
        Commands::Resize(args) => app::handle_resize(&library, args),
        Commands::Reclaim(args) => app::handle_reclaim(&library, args),
        Commands::Size(args) => app::handle_size(&library, args),
        Commands::Clone(args) => app::handle_clone(&library, args),
        Commands::Export(args) => app::handle_export(&library, args),
        Commands::Move(args) => app::handle_move(&library, args),
        Commands::Delete(args) => app::handle_delete(&library, args),
        Commands::Import(args) => app::handle_import(&library, args),
        Commands::Template(args) => app::handle_template(&library, args),
        Commands::Download(args) => app::handle_download(&library, args),
    };

    match exit {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            exit_code(&err)
        }
    }
}
