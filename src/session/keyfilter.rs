//! Key dispositions: which keys the client handles, which go to the
//! server, and the native-to-X11 translation in front of them.

use log::error;
use parking_lot::Mutex;

use std::collections::BTreeMap;

const HANDLE_LOCALLY: u8 = 1 << 0;
const HANDLE_REMOTELY: u8 = 1 << 1;

/// Sanity bound on the number of keys in one `a-b` range.
const MAX_KEYS_IN_RANGE: i64 = 250;

/// Thread-safe map from X11 key code to its disposition. Keys not in the
/// map are handled by the server only.
#[derive(Debug, Default)]
pub struct KeyFilter {
    map: Mutex<BTreeMap<u32, u8>>,
}

impl KeyFilter {
    pub fn new() -> Self {
        KeyFilter::default()
    }

    pub fn clear(&self) {
        self.map.lock().clear();
    }

    /// Apply a keyfilter_control update. Keys named in either list change
    /// their mapping; keys in both get both dispositions; unnamed keys
    /// keep theirs. Each pass first overwrites, then the local list is
    /// OR-ed back in.
    pub fn parse_lists(&self, local_keys: &str, remote_keys: &str) {
        let mut map = self.map.lock();
        parse_list(&mut map, local_keys, HANDLE_LOCALLY, true);
        parse_list(&mut map, remote_keys, HANDLE_REMOTELY, true);
        parse_list(&mut map, local_keys, HANDLE_LOCALLY, false);
    }

    /// Returns `(client_must_handle, server_must_handle)`.
    pub fn find_filter_for_key(&self, x11_key: u32) -> (bool, bool) {
        match self.map.lock().get(&x11_key) {
            Some(&flags) => (flags & HANDLE_LOCALLY != 0, flags & HANDLE_REMOTELY != 0),
            None => (false, true),
        }
    }
}

/// Comma-separated hex key codes, with `a-b` ranges.
fn parse_list(map: &mut BTreeMap<u32, u8>, list: &str, flag: u8, overwrite: bool) {
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        // A leading '-' is not a range separator
        if let Some(delimiter) = entry[1..].find('-').map(|i| i + 1) {
            let first = i64::from_str_radix(entry[..delimiter].trim(), 16);
            let last = i64::from_str_radix(entry[delimiter + 1..].trim(), 16);
            match (first, last) {
                (Ok(first), Ok(last)) if first < last && last - first < MAX_KEYS_IN_RANGE => {
                    for code in first..=last {
                        apply(map, code as u32, flag, overwrite);
                    }
                }
                _ => error!("Range error in key filter list entry {:?}", entry),
            }
        } else {
            match u32::from_str_radix(entry, 16) {
                Ok(code) => apply(map, code, flag, overwrite),
                Err(_) => error!("Bad key filter list entry {:?}", entry),
            }
        }
    }
}

fn apply(map: &mut BTreeMap<u32, u8>, code: u32, flag: u8, overwrite: bool) {
    if overwrite {
        map.insert(code, flag);
    } else {
        *map.entry(code).or_insert(0) |= flag;
    }
}

/// Native-to-X11 key code translation table, configured by the embedder.
#[derive(Debug, Default, Clone)]
pub struct KeyMap {
    map: BTreeMap<u32, u32>,
}

impl KeyMap {
    pub fn new(map: BTreeMap<u32, u32>) -> Self {
        KeyMap { map }
    }

    pub fn translate(&self, native_key: u32) -> Option<u32> {
        self.map.get(&native_key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_remote_only() {
        let filter = KeyFilter::new();
        assert_eq!(filter.find_filter_for_key(0x15), (false, true));
    }

    #[test]
    fn keys_in_both_lists_get_both_dispositions() {
        let filter = KeyFilter::new();
        filter.parse_lists("10,11", "11,12");
        assert_eq!(filter.find_filter_for_key(0x10), (true, false));
        assert_eq!(filter.find_filter_for_key(0x11), (true, true));
        assert_eq!(filter.find_filter_for_key(0x12), (false, true));
        // Unmentioned keys keep the default
        assert_eq!(filter.find_filter_for_key(0x13), (false, true));
    }

    #[test]
    fn hex_ranges_expand() {
        let filter = KeyFilter::new();
        filter.parse_lists("20-23", "");
        for code in 0x20..=0x23 {
            assert_eq!(filter.find_filter_for_key(code), (true, false));
        }
        assert_eq!(filter.find_filter_for_key(0x24), (false, true));
    }

    #[test]
    fn oversized_range_is_rejected() {
        let filter = KeyFilter::new();
        filter.parse_lists("0-FFFF", "");
        assert_eq!(filter.find_filter_for_key(0x10), (false, true));
    }

    #[test]
    fn update_replaces_previous_disposition() {
        let filter = KeyFilter::new();
        filter.parse_lists("10", "");
        assert_eq!(filter.find_filter_for_key(0x10), (true, false));
        filter.parse_lists("", "10");
        assert_eq!(filter.find_filter_for_key(0x10), (false, true));
    }

    #[test]
    fn clear_restores_defaults() {
        let filter = KeyFilter::new();
        filter.parse_lists("10", "");
        filter.clear();
        assert_eq!(filter.find_filter_for_key(0x10), (false, true));
    }

    #[test]
    fn key_map_translates() {
        let mut table = BTreeMap::new();
        table.insert(0xA, 0x15);
        let map = KeyMap::new(table);
        assert_eq!(map.translate(0xA), Some(0x15));
        assert_eq!(map.translate(0xB), None);
    }
}
