//! Network type definitions for the lattice overlay.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, Copy, PartialEq, Eq, Hash)]
pub enum NetworkType {
    Mainnet,
    Testnet,
}

impl NetworkType {
    pub fn default_p2p_port(&self) -> u16 {
        match self {
            NetworkType::Mainnet => 16061,
            NetworkType::Testnet => 16161,
        }
    }

    /// Peers required before discovery pauses.
    pub fn default_quorum(&self) -> u64 {
        match self {
            NetworkType::Mainnet => crate::constants::sync::QUORUM_MAINNET,
            NetworkType::Testnet => crate::constants::sync::QUORUM_TESTNET,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => "mainnet",
            NetworkType::Testnet => "testnet",
        }
    }
}
