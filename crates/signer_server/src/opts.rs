// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{crate_version, Parser};

#[derive(Debug, Parser)]
#[clap(
    name = "signer",
    about = "Token, key and certificate signer service",
    version = crate_version!()
)]
pub struct Opts {
    #[clap(
        long,
        env = "SIGNER_CFG_PATH",
        help = "The path to the server config TOML"
    )]
    pub cfg_path: PathBuf,

    #[clap(
        long,
        env = "SIGNER_ADDRESS",
        help = "Address to listen on for the main plane; overrides `address` in the config. If only a port is given, all IPv4 addresses are used.",
        value_parser = parse_port_or_socket_addr
    )]
    pub address: Option<SocketAddr>,

    #[clap(
        long,
        env = "SIGNER_MONITORING_ADDRESS",
        help = "Address to listen on for the monitoring plane; overrides `monitoring_address` in the config.",
        value_parser = parse_port_or_socket_addr
    )]
    pub monitoring_address: Option<SocketAddr>,
}

fn parse_port_or_socket_addr(value: &str) -> Result<SocketAddr, std::net::AddrParseError> {
    match value.parse::<u16>() {
        Ok(port) => Ok(SocketAddr::from(([0, 0, 0, 0], port))),
        Err(_) => value.parse(),
    }
}
