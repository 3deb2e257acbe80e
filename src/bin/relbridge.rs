use relbridge::cli::{self, Command};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = cli::parse_args(&args);

    match cli::run(&command) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{}", e);
            let code = if matches!(command, Command::Unknown(_)) { 2 } else { 1 };
            std::process::exit(code);
        }
    }
}
