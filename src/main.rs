fn main() {
    if let Err(e) = rendezvous::app::run() {
        eprintln!("rendezvousd: {}", e);
        std::process::exit(1);
    }
}
