use clap::Parser;

/// Solarman Bridge - telemetry from Solarman V5 data loggers
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Log level, overriding `loglevel` in the config file
    #[clap(short = 'l', long = "loglevel")]
    pub loglevel: Option<String>,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}
