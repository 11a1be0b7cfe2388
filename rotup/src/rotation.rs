//! Picks the destination disk for a run out of the rotation set.

use thiserror::Error;

use crate::volume::VolumeDescriptor;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("none of the {allowed} rotation disks is attached ({scanned} volumes scanned)")]
pub struct NoMatchingVolume {
    pub allowed: usize,
    pub scanned: usize,
}

/// Whether an allow-list entry designates the volume with `identity`.
///
/// Entries are usually written as `<LABEL>_<UUID>`, e.g. `DISKA_1111-AAAA`, so
/// besides equality the token after the last `_` is compared (ignoring ASCII
/// case, UUID tools disagree on it) and finally a plain substring check.
pub fn identity_matches(entry: &str, identity: &str) -> bool {
    let entry = entry.trim();
    let identity = identity.trim();
    if identity.is_empty() || entry.is_empty() {
        return false;
    }

    let token = entry.rsplit('_').next().unwrap_or(entry);
    entry == identity || token.eq_ignore_ascii_case(identity) || entry.contains(identity)
}

/// Select the rotation target: allow-list order is priority, so the first
/// configured disk that is present wins regardless of enumeration order.
pub fn select_volume<'a>(
    catalog: &'a [VolumeDescriptor],
    allow_list: &[String],
) -> Result<&'a VolumeDescriptor, NoMatchingVolume> {
    allow_list
        .iter()
        .find_map(|entry| {
            catalog
                .iter()
                .find(|volume| identity_matches(entry, &volume.identity))
        })
        .ok_or(NoMatchingVolume {
            allowed: allow_list.len(),
            scanned: catalog.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::{NoMatchingVolume, identity_matches, select_volume};
    use crate::volume::{IdentityKind, VolumeDescriptor};

    fn volume(identity: &str) -> VolumeDescriptor {
        VolumeDescriptor::new(identity, IdentityKind::Uuid, identity, format!("/dev/{identity}"))
    }

    fn allow(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn test_identity_matches() {
        assert!(identity_matches("DISKA_1111-AAAA", "1111-AAAA"));
        assert!(identity_matches("DISKA_1111-aaaa", "1111-AAAA"));
        assert!(identity_matches("1111-AAAA", "1111-AAAA"));
        assert!(identity_matches("UUID_DYSKU_A_1234-ABCD", "1234-ABCD"));
        assert!(identity_matches("BACKUP_B", "BACKUP_B"));
        assert!(!identity_matches("DISKA_1111-AAAA", "2222-BBBB"));
        assert!(!identity_matches("DISKA_1111-AAAA", ""));
        assert!(!identity_matches("", "1111-AAAA"));
    }

    #[test]
    fn test_scenario_single_disk() {
        let catalog = vec![volume("1111-AAAA")];
        let selected = select_volume(&catalog, &allow(&["DISKA_1111-AAAA"])).unwrap();
        assert_eq!(selected.identity, "1111-AAAA");
    }

    #[test]
    fn test_allow_list_order_wins() {
        let allow_list = allow(&["DISKB_2222-BBBB", "DISKA_1111-AAAA"]);
        let forward = vec![volume("1111-AAAA"), volume("2222-BBBB")];
        let backward = vec![volume("2222-BBBB"), volume("1111-AAAA")];

        assert_eq!(
            select_volume(&forward, &allow_list).unwrap().identity,
            "2222-BBBB"
        );
        assert_eq!(
            select_volume(&backward, &allow_list).unwrap().identity,
            "2222-BBBB"
        );

        let reversed = allow(&["DISKA_1111-AAAA", "DISKB_2222-BBBB"]);
        assert_eq!(
            select_volume(&forward, &reversed).unwrap().identity,
            "1111-AAAA"
        );
    }

    #[test]
    fn test_skips_absent_disks() {
        let catalog = vec![volume("8C1B-2F3A"), volume("3333-CCCC")];
        let allow_list = allow(&["DISKA_1111-AAAA", "DISKC_3333-CCCC"]);
        assert_eq!(
            select_volume(&catalog, &allow_list).unwrap().identity,
            "3333-CCCC"
        );
    }

    #[test]
    fn test_no_matching_volume() {
        let allow_list = allow(&["DISKA_1111-AAAA"]);
        assert_eq!(
            select_volume(&[], &allow_list).unwrap_err(),
            NoMatchingVolume {
                allowed: 1,
                scanned: 0
            }
        );
        assert!(select_volume(&[volume("9999-ZZZZ")], &allow_list).is_err());
        assert!(select_volume(&[volume("1111-AAAA")], &[]).is_err());
    }
}
