use std::{
    net::{IpAddr, Ipv6Addr},
    num::NonZero,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use color_eyre::eyre::Context;

// CLI configuration for the single-target proxy binary.
#[doc(hidden)]
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Address to listen on for origin SSH connections.
    #[arg(
        long,
        default_value_t = IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        value_name = "ADDRESS"
    )]
    pub listen_address: IpAddr,

    /// Port to listen on for origin SSH connections.
    #[arg(long, default_value_t = NonZero::new(2222).unwrap(), value_name = "PORT")]
    pub ssh_port: NonZero<u16>,

    /// File path to the proxy's host key. If missing, it will be created
    /// for you.
    #[arg(
        long,
        default_value_os = "./deploy/server_keys/ssh",
        value_name = "FILE"
    )]
    pub private_key_file: PathBuf,

    /// File listing public keys of origins allowed to connect, in
    /// authorized_keys format. If unset, every origin is accepted.
    #[arg(long, value_name = "FILE")]
    pub authorized_keys: Option<PathBuf>,

    /// Target address every connection is proxied to.
    #[arg(long, value_name = "HOST:PORT")]
    pub target: String,

    /// Username presented to the target.
    #[arg(long, value_name = "USER")]
    pub target_user: String,

    /// File path to the private key used to authenticate with the target.
    #[arg(long, value_name = "FILE", conflicts_with = "target_password")]
    pub target_key_file: Option<PathBuf>,

    /// Password used to authenticate with the target.
    #[arg(long, value_name = "PASSWORD")]
    pub target_password: Option<String>,

    /// How long to wait when dialing the target.
    #[arg(long, default_value = "15s", value_parser = validate_duration, value_name = "DURATION")]
    pub dial_timeout: Duration,
}

fn validate_duration(value: &str) -> color_eyre::Result<Duration> {
    Ok(humantime::Duration::from_str(value)
        .with_context(|| "invalid duration")?
        .into())
}
