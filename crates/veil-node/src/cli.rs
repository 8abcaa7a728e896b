use clap::Parser;

use veil_protocol::types::{DEFAULT_BIND_ADDRESS, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "veil", about = "Encrypted peer-to-peer relay node", version)]
pub struct Cli {
    /// Address the listener binds to.
    #[arg(long, default_value = DEFAULT_BIND_ADDRESS)]
    pub bind_address: String,

    /// Port the listener binds to.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub bind_port: u16,

    /// Accept duplicate loopback peers, for multi-node tests on one host.
    #[arg(long)]
    pub allow_local_ip: bool,

    /// Skip requesting a gateway port mapping.
    #[arg(long)]
    pub disable_port_mapping: bool,

    /// Bootstrap peer to dial, as `<address> <port>`. Repeatable.
    #[arg(long, num_args = 2, value_names = ["ADDRESS", "PORT"])]
    pub connect: Vec<String>,

    /// Generate a fresh identity keypair, print it, and exit.
    #[arg(long)]
    pub generate_keypair: bool,

    /// Import an identity as `<public> <secret> <nonce>` (base64url,
    /// no padding). Repeatable.
    #[arg(long, num_args = 3, value_names = ["PUBLIC", "SECRET", "NONCE"])]
    pub import_keypair: Vec<String>,

    /// Path of the peer list loaded at startup and saved at shutdown.
    #[arg(long, default_value = "peers.dat")]
    pub peer_file: String,
}

/// Exit code for a failed parse: usage errors exit 1, matching every
/// other startup failure; `--help`/`--version` still exit 0.
pub fn error_exit_code(err: &clap::Error) -> i32 {
    if err.use_stderr() {
        1
    } else {
        0
    }
}

/// A dial target parsed from `--connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub address: String,
    pub port: u32,
}

impl Cli {
    /// The `--connect` flag collects flat `addr port` pairs; group them.
    pub fn connect_targets(&self) -> anyhow::Result<Vec<ConnectTarget>> {
        self.connect
            .chunks(2)
            .map(|pair| {
                let port: u32 = pair[1]
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid port in --connect: {}", pair[1]))?;
                Ok(ConnectTarget {
                    address: pair[0].clone(),
                    port,
                })
            })
            .collect()
    }

    /// The `--import-keypair` flag collects flat `public secret nonce`
    /// triples; group them.
    pub fn import_triples(&self) -> Vec<[&str; 3]> {
        self.import_keypair
            .chunks(3)
            .map(|triple| [triple[0].as_str(), triple[1].as_str(), triple[2].as_str()])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["veil"]);
        assert_eq!(cli.bind_address, "0.0.0.0");
        assert_eq!(cli.bind_port, 5000);
        assert!(!cli.allow_local_ip);
        assert!(cli.connect_targets().unwrap().is_empty());
        assert_eq!(cli.peer_file, "peers.dat");
    }

    #[test]
    fn repeated_connect_pairs() {
        let cli = Cli::parse_from([
            "veil", "--connect", "10.0.0.1", "5000", "--connect", "relay.example", "6001",
        ]);
        assert_eq!(
            cli.connect_targets().unwrap(),
            vec![
                ConnectTarget {
                    address: "10.0.0.1".into(),
                    port: 5000
                },
                ConnectTarget {
                    address: "relay.example".into(),
                    port: 6001
                },
            ]
        );
    }

    #[test]
    fn bad_connect_port_is_an_error() {
        let cli = Cli::parse_from(["veil", "--connect", "10.0.0.1", "not-a-port"]);
        assert!(cli.connect_targets().is_err());
    }

    #[test]
    fn unknown_flag_exits_one() {
        let err = Cli::try_parse_from(["veil", "--bogus-flag"]).unwrap_err();
        assert_eq!(error_exit_code(&err), 1);
    }

    #[test]
    fn help_exits_zero() {
        let err = Cli::try_parse_from(["veil", "--help"]).unwrap_err();
        assert_eq!(error_exit_code(&err), 0);
    }

    #[test]
    fn import_triples_group() {
        let cli = Cli::parse_from(["veil", "--import-keypair", "AA", "BB", "CC"]);
        assert_eq!(cli.import_triples(), vec![["AA", "BB", "CC"]]);
    }
}
