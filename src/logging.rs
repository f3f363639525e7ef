//! Console logging setup

use log::LevelFilter;
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Config, Logger, Root},
    encode::pattern::PatternEncoder,
};

/// Initializes stderr logging. Verbosity stacks: 0 is info, 1 debug and
/// anything above trace; from 3 on, dependency logs show up too.
pub fn init(verbose_level: u8) {
    let mut pattern = String::from("{d} {h({l}):<5} ");
    if verbose_level >= 1 {
        pattern += "[{M}] ";
    }
    pattern += "{m}{n}";

    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(&pattern)))
        .target(Target::Stderr)
        .build();

    let level = match verbose_level {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let root_level = if verbose_level >= 3 { LevelFilter::Debug } else { LevelFilter::Off };

    let config = Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)))
        .logger(Logger::builder().build("sockspin", level))
        .build(Root::builder().appender("console").build(root_level))
        .expect("logging config");

    log4rs::init_config(config).expect("logging init");
}
