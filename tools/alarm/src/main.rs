fn main() {
    match alarm::run() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(alarm::EXIT_FATAL);
        }
    }
}
