use clap::error::ErrorKind;
use clap::Parser;
use log::{error, info};
use rbf_core::logging;
use rbf_error::RbfError;
use rbf_hal::LinuxHal;
use rbf_workflow::{BOOT_SCRIPT, CLEANUP_SCRIPT, MAIN_SCRIPT};
use std::process::ExitCode;

mod cli;

fn main() -> ExitCode {
    let cli = match cli::Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(RbfError::IncorrectArguments(err.kind().to_string()).code()),
            };
        }
    };

    let opts = cli.run_options();
    if let Err(err) = logging::init(&opts.log_path()) {
        eprintln!("[ERROR]  {}", err);
        return ExitCode::from(err.code());
    }

    let hal = LinuxHal::new();
    match rbf_workflow::run(&hal, &opts) {
        Ok(report) => {
            info!(
                "{} finished for {} ({} stages)",
                report.mode.as_str(),
                report.board,
                report.stages.len()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            info!(
                "If you think this is a bug, attach {}, {}, {}, {} and {} to the report",
                opts.log_path().display(),
                opts.output_dir.join(MAIN_SCRIPT).display(),
                opts.output_dir.join(BOOT_SCRIPT).display(),
                opts.output_dir.join(CLEANUP_SCRIPT).display(),
                opts.template.display()
            );
            ExitCode::from(err.code())
        }
    }
}
