fn is_json_mode_args() -> bool {
    std::env::args().any(|arg| arg == "--json")
}

fn report(err: &talent_match::CliError) {
    if is_json_mode_args() {
        let payload = serde_json::json!({
            "error": {
                "code": err.code,
                "kind": err.kind,
                "message": err.message,
                "hint": err.hint,
                "retryable": err.retryable,
            }
        });
        eprintln!("{payload}");
    } else {
        eprintln!("{err}");
    }
}

fn main() {
    // Load .env early; ignore if missing.
    dotenvy::dotenv().ok();

    let cli = match talent_match::parse_cli(std::env::args_os()) {
        Ok(cli) => cli,
        Err(err) if err.code == 0 => {
            print!("{}", err.message);
            return;
        }
        Err(err) => {
            // clap renders its own usage text
            eprint!("{}", err.message);
            std::process::exit(err.code);
        }
    };

    if let Err(err) = talent_match::run(cli) {
        report(&err);
        std::process::exit(err.code);
    }
}
