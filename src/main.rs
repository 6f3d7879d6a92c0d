use clap::Parser;
use log::info;

use cube_server::cli::Opt;
use cube_server::server::Server;

fn main() {
    env_logger::init();

    let opt = Opt::parse();
    let cfg = opt.config();

    let mut server = match Server::new(&cfg) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("cube-server failed to start: {err}");
            std::process::exit(1);
        }
    };

    info!("running cube server on seat {}", cfg.seat);
    if let Err(err) = server.run() {
        eprintln!("cube-server exited with error: {err}");
        std::process::exit(1);
    }
}
