fn main() {
    if let Err(e) = screenclip_lib::run() {
        eprintln!("screenclip: {}", e);
        std::process::exit(1);
    }
}
