//! forgechain CLI binary.
//!
//! This is the minimal entrypoint; all logic lives in `forgechain-cli`.

fn main() {
    let exit_code = forgechain_cli::run();
    std::process::exit(exit_code);
}
