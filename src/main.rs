use chunkcam_lib::cli::{self, Command};

fn main() {
    let command = match cli::parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let result = match command {
        Command::Help => {
            println!("{}", cli::USAGE);
            Ok(())
        }
        Command::Record(args) => chunkcam_lib::run_record(&args).map(|_| ()),
        Command::Check(args) => chunkcam_lib::init_logging(cli::LogLevel::Warning, None)
            .and_then(|_| chunkcam_lib::run_check(&args)),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
