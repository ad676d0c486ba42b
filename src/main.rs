fn main() {
    if let Err(error) = ledger_market_data_lib::run() {
        eprintln!("ledger-market-data: {error}");
        std::process::exit(1);
    }
}
