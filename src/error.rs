use crate::topology::{BridgeId, InterfaceId, LinkId, NamespaceId};
use std::io;
use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("namespace {0} not found")]
    NamespaceNotFound(NamespaceId),

    #[error("interface {0} not found")]
    InterfaceNotFound(InterfaceId),

    #[error("bridge {0} not found")]
    BridgeNotFound(BridgeId),

    #[error("link {0} not found")]
    LinkNotFound(LinkId),

    #[error("{ip} is unreachable")]
    Unreachable { ip: Ipv4Addr },

    #[error("export error: {0}")]
    Export(String),
}

pub type Result<T> = std::result::Result<T, Error>;
