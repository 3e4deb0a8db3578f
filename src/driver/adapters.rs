//! Network adapter reconciliation.
//!
//! Existing cards are retyped pairwise, in order, to the desired adapters.
//! Desired adapters left over once the cards run out are added as new
//! cards. Cards are never removed.

use super::parse::NetworkCard;
use super::{AdapterType, NetworkAdapter};

/// A single change to the VM's network cards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterChange {
    /// Change the connection type of an existing card.
    Retype {
        /// Card index as reported by `describe`.
        card_index: String,
        /// New type.
        adapter_type: AdapterType,
    },
    /// Add a new card.
    Add {
        /// Type of the new card.
        adapter_type: AdapterType,
    },
}

impl AdapterChange {
    /// VeertuManage arguments applying this change to `uuid`.
    pub fn to_args(&self, uuid: &str) -> Vec<String> {
        let parts: Vec<&str> = match self {
            AdapterChange::Retype {
                card_index,
                adapter_type,
            } => vec![
                "modify",
                uuid,
                "set",
                "--network",
                card_index.as_str(),
                "--network-type",
                adapter_type.connection(),
            ],
            AdapterChange::Add { adapter_type } => vec![
                "modify",
                uuid,
                "add",
                "network_card",
                "--type",
                adapter_type.connection(),
            ],
        };
        parts.into_iter().map(String::from).collect()
    }
}

/// Plan the changes that bring `existing` in line with `desired`.
pub fn reconcile(existing: &[NetworkCard], desired: &[NetworkAdapter]) -> Vec<AdapterChange> {
    let retypes = existing
        .iter()
        .zip(desired)
        .map(|(card, adapter)| AdapterChange::Retype {
            card_index: card.card_index.clone(),
            adapter_type: adapter.adapter_type,
        });

    let additions = desired
        .iter()
        .skip(existing.len())
        .map(|adapter| AdapterChange::Add {
            adapter_type: adapter.adapter_type,
        });

    retypes.chain(additions).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(index: &str) -> NetworkCard {
        NetworkCard {
            card_index: index.to_string(),
            connection: Some("host".to_string()),
            mac_address: None,
        }
    }

    #[test]
    fn test_one_existing_two_desired() {
        let desired = [
            NetworkAdapter::new(1, AdapterType::Nat),
            NetworkAdapter::new(2, AdapterType::Bridged),
        ];
        let changes = reconcile(&[card("0")], &desired);
        assert_eq!(
            changes,
            vec![
                AdapterChange::Retype {
                    card_index: "0".to_string(),
                    adapter_type: AdapterType::Nat,
                },
                AdapterChange::Add {
                    adapter_type: AdapterType::Bridged,
                },
            ]
        );
    }

    #[test]
    fn test_no_existing_cards_adds_all() {
        let desired = [
            NetworkAdapter::new(1, AdapterType::Nat),
            NetworkAdapter::new(2, AdapterType::Disconnected),
        ];
        let changes = reconcile(&[], &desired);
        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .all(|c| matches!(c, AdapterChange::Add { .. })));
    }

    #[test]
    fn test_extra_existing_cards_are_left_alone() {
        let desired = [NetworkAdapter::new(1, AdapterType::Bridged)];
        let changes = reconcile(&[card("0"), card("1"), card("2")], &desired);
        assert_eq!(
            changes,
            vec![AdapterChange::Retype {
                card_index: "0".to_string(),
                adapter_type: AdapterType::Bridged,
            }]
        );
    }

    #[test]
    fn test_nothing_desired_changes_nothing() {
        assert!(reconcile(&[card("0")], &[]).is_empty());
    }

    #[test]
    fn test_change_args() {
        let retype = AdapterChange::Retype {
            card_index: "1".to_string(),
            adapter_type: AdapterType::Bridged,
        };
        assert_eq!(
            retype.to_args("vm-1"),
            vec!["modify", "vm-1", "set", "--network", "1", "--network-type", "shared"]
        );

        let add = AdapterChange::Add {
            adapter_type: AdapterType::Nat,
        };
        assert_eq!(
            add.to_args("vm-1"),
            vec!["modify", "vm-1", "add", "network_card", "--type", "host"]
        );
    }
}
