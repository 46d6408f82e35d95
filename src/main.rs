use std::process;

use log::{error, info};

use rproxy::config::{self, Options, ProxyConfig};
use rproxy::logger;
use rproxy::reactor::Reactor;

fn main() {
    let opts: Options = argh::from_env();

    logger::init(opts.flush);

    let config = match ProxyConfig::from_options(&opts) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    // A peer closing mid-write must surface as EPIPE, not kill the process.
    if unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) } == libc::SIG_ERR {
        error!("signal error: {}", std::io::Error::last_os_error());
        process::exit(1);
    }

    for addr in &config.remote_addrs {
        info!("remote address = {}", config::endpoint_string(addr));
    }
    info!(
        "connect timeout milliseconds = {}",
        config.connect_timeout.as_millis()
    );
    if !config.periodic_log.is_zero() {
        info!(
            "periodic log milliseconds = {}",
            config.periodic_log.as_millis()
        );
    }

    let mut reactor = match Reactor::new(config) {
        Ok(reactor) => reactor,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    reactor.run()
}
