//! Gateway port mapping boundary.
//!
//! Nodes behind NAT need an inbound mapping for the listen port. The
//! trait keeps the node logic independent of any discovery protocol;
//! the shipped implementation only records intent, so nodes on
//! reachable networks run unchanged.

use tracing::info;

pub trait PortMapper: Send + Sync {
    /// Ask the gateway to forward `port` to this host.
    fn request_mapping(&self, port: u16) -> anyhow::Result<()>;

    /// Release a mapping previously requested.
    fn drop_mapping(&self, port: u16) -> anyhow::Result<()>;
}

/// Mapper that logs instead of talking to a gateway.
#[derive(Debug, Default)]
pub struct LogOnlyMapper;

impl PortMapper for LogOnlyMapper {
    fn request_mapping(&self, port: u16) -> anyhow::Result<()> {
        info!(port, "port mapping requested (log-only mapper, no gateway contacted)");
        Ok(())
    }

    fn drop_mapping(&self, port: u16) -> anyhow::Result<()> {
        info!(port, "port mapping released (log-only mapper)");
        Ok(())
    }
}

/// Mapper used with `--disable-port-mapping`: does nothing at all.
#[derive(Debug, Default)]
pub struct DisabledMapper;

impl PortMapper for DisabledMapper {
    fn request_mapping(&self, _port: u16) -> anyhow::Result<()> {
        Ok(())
    }

    fn drop_mapping(&self, _port: u16) -> anyhow::Result<()> {
        Ok(())
    }
}
