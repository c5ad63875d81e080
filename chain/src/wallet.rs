//! Custodial wallet registry.
//!
//! Per-lobby deposit addresses and the treasury address are derived
//! deterministically from the configured seed material, so a restart
//! always reconstructs the same set.  Actual key custody and signing sit
//! behind the RPC endpoint; this registry only knows addresses and the
//! opaque encrypted key blobs persisted alongside each lobby.

use arena_core::types::{Address, LobbyId};

#[derive(Debug, Clone)]
pub struct WalletRegistry {
    lobby_addresses: Vec<Address>,
    lobby_keys: Vec<String>,
    treasury: Address,
}

impl WalletRegistry {
    pub fn derive(
        lobby_wallet_seed: &str,
        encryption_key: &str,
        treasury_mnemonic: &str,
        lobby_count: u32,
    ) -> Self {
        let mut lobby_addresses = Vec::with_capacity(lobby_count as usize);
        let mut lobby_keys = Vec::with_capacity(lobby_count as usize);
        for index in 1..=lobby_count {
            let material = format!("{}/m/44'/60'/0'/0/{}", lobby_wallet_seed, index);
            lobby_addresses.push(derive_address(&material));
            lobby_keys.push(sha256::digest(format!("{}:{}", encryption_key, material)));
        }
        Self {
            lobby_addresses,
            lobby_keys,
            treasury: derive_address(treasury_mnemonic),
        }
    }

    /// Lobby ids are 1-based.
    pub fn lobby_address(&self, lobby_id: LobbyId) -> Option<&Address> {
        self.lobby_addresses.get(lobby_id.checked_sub(1)? as usize)
    }

    pub fn encrypted_lobby_key(&self, lobby_id: LobbyId) -> Option<&str> {
        self.lobby_keys
            .get(lobby_id.checked_sub(1)? as usize)
            .map(String::as_str)
    }

    pub fn treasury_address(&self) -> &Address {
        &self.treasury
    }

    pub fn lobby_count(&self) -> u32 {
        self.lobby_addresses.len() as u32
    }
}

fn derive_address(material: &str) -> Address {
    let digest = sha256::digest(material);
    Address::from_raw(format!("0x{}", &digest[..40]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_stable_and_distinct() {
        let a = WalletRegistry::derive("seed", "enc", "mnemonic", 4);
        let b = WalletRegistry::derive("seed", "enc", "mnemonic", 4);
        for id in 1..=4 {
            assert_eq!(a.lobby_address(id), b.lobby_address(id));
        }
        for i in 1..=4u32 {
            for j in (i + 1)..=4 {
                assert_ne!(a.lobby_address(i), a.lobby_address(j));
            }
        }
        assert_eq!(a.treasury_address(), b.treasury_address());
    }

    #[test]
    fn different_seed_different_addresses() {
        let a = WalletRegistry::derive("seed-a", "enc", "mnemonic", 2);
        let b = WalletRegistry::derive("seed-b", "enc", "mnemonic", 2);
        assert_ne!(a.lobby_address(1), b.lobby_address(1));
    }

    #[test]
    fn out_of_range_lobby_is_none() {
        let registry = WalletRegistry::derive("seed", "enc", "mnemonic", 2);
        assert!(registry.lobby_address(0).is_none());
        assert!(registry.lobby_address(3).is_none());
    }
}
