//! MAC-vendor (OUI) lookup, embedded at compile time. External data per the
//! scope note ("the MAC-vendor OUI table is external data") — this module
//! ships a small representative sample; a production deployment would
//! point `include_str!` at the IEEE registration authority's public CSV.

use std::collections::HashMap;
use std::sync::OnceLock;

const OUI_CSV: &str = include_str!("oui_db.csv");

static OUI_TABLE: OnceLock<HashMap<[u8; 3], String>> = OnceLock::new();

fn table() -> &'static HashMap<[u8; 3], String> {
    OUI_TABLE.get_or_init(|| {
        let mut map = HashMap::new();
        for line in OUI_CSV.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((prefix, vendor)) = line.split_once(',') {
                if let Some(bytes) = parse_prefix(prefix) {
                    map.insert(bytes, vendor.trim().to_string());
                }
            }
        }
        map
    })
}

fn parse_prefix(s: &str) -> Option<[u8; 3]> {
    let cleaned: String = s.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if cleaned.len() < 6 {
        return None;
    }
    let mut out = [0u8; 3];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = u8::from_str_radix(&cleaned[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

/// Look up the vendor name for a MAC address in any of the common textual
/// formats (colon, dash, or bare hex, case-insensitive).
pub fn lookup(mac: &str) -> Option<&'static str> {
    let prefix = parse_prefix(mac)?;
    table().get(&prefix).map(|s| s.as_str())
}

/// Look up the vendor name for a parsed [`crate::flow::MacAddr`].
pub fn lookup_bytes(mac: &crate::flow::MacAddr) -> Option<&'static str> {
    table().get(&[mac.0[0], mac.0[1], mac.0[2]]).map(|s| s.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_known_vendor_colon_form() {
        assert_eq!(lookup("b8:27:eb:12:34:56"), Some("Raspberry Pi Foundation"));
    }

    #[test]
    fn looks_up_known_vendor_dash_form() {
        assert_eq!(lookup("B8-27-EB-12-34-56"), Some("Raspberry Pi Foundation"));
    }

    #[test]
    fn unknown_prefix_returns_none() {
        assert_eq!(lookup("ff:ff:ff:00:00:00"), None);
    }

    #[test]
    fn malformed_input_returns_none() {
        assert_eq!(lookup("not-a-mac"), None);
    }

    #[test]
    fn table_loads_all_embedded_entries() {
        assert!(
            table().len() >= 25,
            "expected the embedded sample OUI table to load fully"
        );
    }
}
