use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rfbtv-client")]
#[command(author = "RFB-TV Client Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "RFB-TV client core", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/rfbtv.json")]
    pub config: PathBuf,

    /// Session manager URL (overrides the configuration file)
    #[arg(long)]
    pub session_url: Option<String>,

    /// Application URL to launch (overrides the configuration file)
    #[arg(long)]
    pub app_url: Option<String>,

    /// Screen resolution, WxH (overrides the configuration file)
    #[arg(long)]
    pub resolution: Option<String>,

    /// Base path for persistent client state
    #[arg(long)]
    pub base_store_path: Option<PathBuf>,
}
