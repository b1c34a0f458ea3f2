//! MAC address aliasing for RuuviTag devices.
//!
//! Aliases give devices their initial human-readable names: a device seen
//! for the first time is created with the alias configured for its address,
//! after which the name lives in the device's persisted record.

use crate::mac_address::MacAddress;
use std::collections::BTreeMap;

/// A type alias for MAC-to-name mappings.
pub type AliasMap = BTreeMap<MacAddress, String>;

/// A parsed alias mapping a MAC address to a human-readable name.
#[derive(Debug, Clone)]
pub struct Alias {
    /// The device MAC address
    pub address: MacAddress,
    /// The human-readable name (e.g., "Sauna")
    pub name: String,
}

/// Parse an alias from a string in the format "MAC=NAME".
///
/// # Example
/// ```
/// use ruuvitag_ingest::alias::parse_alias;
///
/// let alias = parse_alias("AA:BB:CC:DD:EE:FF=Kitchen").unwrap();
/// assert_eq!(alias.address.to_string(), "AA:BB:CC:DD:EE:FF");
/// assert_eq!(alias.name, "Kitchen");
/// ```
pub fn parse_alias(src: &str) -> Result<Alias, String> {
    let (address, name) = src
        .split_once('=')
        .ok_or_else(|| "invalid alias: expected format MAC=NAME".to_string())?;
    let address = address
        .parse()
        .map_err(|e| format!("invalid alias: {e}"))?;
    Ok(Alias {
        address,
        name: name.to_string(),
    })
}

/// Convert a slice of Alias values into an AliasMap.
pub fn to_map(aliases: &[Alias]) -> AliasMap {
    aliases
        .iter()
        .map(|a| (a.address, a.name.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TEST_MAC;

    #[test]
    fn test_parse_alias_valid() {
        let alias = parse_alias("AA:BB:CC:DD:EE:FF=Kitchen").unwrap();
        assert_eq!(alias.address, TEST_MAC);
        assert_eq!(alias.name, "Kitchen");
    }

    #[test]
    fn test_parse_alias_with_spaces() {
        let alias = parse_alias("AA:BB:CC:DD:EE:FF=Living Room").unwrap();
        assert_eq!(alias.name, "Living Room");
    }

    #[test]
    fn test_parse_alias_without_equals() {
        assert!(parse_alias("no-equals-sign").is_err());
    }

    #[test]
    fn test_parse_alias_with_bad_address() {
        assert!(parse_alias("AA:BB=Kitchen").is_err());
    }

    #[test]
    fn test_to_map() {
        let aliases = vec![
            Alias {
                address: TEST_MAC,
                name: "Kitchen".to_string(),
            },
            Alias {
                address: MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]),
                name: "Bedroom".to_string(),
            },
        ];
        let map = to_map(&aliases);
        assert_eq!(map.get(&TEST_MAC), Some(&"Kitchen".to_string()));
        assert_eq!(
            map.get(&MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66])),
            Some(&"Bedroom".to_string())
        );
        assert_eq!(map.get(&MacAddress::default()), None);
    }
}
