use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
pub struct Cli {
    /// The request url,like http://www.google.com
    pub url: String,
    ///  Specify request method to use
    #[arg(short = 'X', long = "request", value_name = "method")]
    pub method_option: Option<String>,
    /// HTTP POST data.
    #[arg(short = 'd', long = "data", value_name = "data")]
    pub body_option: Option<String>,
    /// Maximum time allowed for the request, in seconds.
    #[arg(short = 'm', long = "max-time", value_name = "seconds", default_value_t = 30.0)]
    pub max_time: f64,
    /// JSON settings file, overridden by the flags below.
    #[arg(long = "config", value_name = "file")]
    pub config_path: Option<PathBuf>,
    /// The pem path.
    #[arg(short = 'c', long = "cacert", value_name = "file")]
    pub certificate_path_option: Option<PathBuf>,
    /// Allow insecure server connections
    #[arg(short = 'k', long = "insecure")]
    pub skip_certificate_validate: bool,
    /// Offer HTTP/2 through ALPN
    #[arg(long = "http2")]
    pub http2: bool,
    /// InfluxDB base url the trace point is written to, like http://127.0.0.1:8086
    #[arg(long = "influx-url", value_name = "URL")]
    pub influx_url: Option<String>,
    /// InfluxDB database name
    #[arg(long = "database", value_name = "name")]
    pub database: Option<String>,
    /// Print the trace record as JSON instead of the time breakdown
    #[arg(long = "json")]
    pub json: bool,
    ///  Make the operation more talkative
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbosity: u8,
}
