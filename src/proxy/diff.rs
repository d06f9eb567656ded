//! Pure comparison of a freshly loaded cluster config set against the
//! live one. No I/O, no shared state: the reload loop feeds it snapshots
//! and acts on its verdicts.

use log::error;

use crate::config::ClusterConfig;

/// Whether any live cluster name is missing from the new set. Removal is
/// refused wholesale at reload time, so one missing name rejects the
/// entire reload.
pub fn any_cluster_removed(new_confs: &[ClusterConfig], old_confs: &[ClusterConfig]) -> bool {
    old_confs
        .iter()
        .any(|old| !new_confs.iter().any(|new| new.name == old.name))
}

/// Classify each new config against the live set.
///
/// Returns `(changed, new_add)`: `changed` entries carry the live
/// cluster's id and differ in at least one forwarder-relevant field;
/// `new_add` names were never seen before. An entry whose listen address
/// moved is invalid and dropped entirely, since the listener cannot
/// rebind.
pub fn diff(
    new_confs: &[ClusterConfig],
    old_confs: &[ClusterConfig],
) -> (Vec<ClusterConfig>, Vec<ClusterConfig>) {
    let mut changed = Vec::new();
    let mut new_add = Vec::new();

    for new_conf in new_confs {
        let old_conf = old_confs.iter().find(|old| old.name == new_conf.name);
        let old_conf = match old_conf {
            Some(old_conf) => old_conf,
            None => {
                new_add.push(new_conf.clone());
                continue;
            }
        };

        let (differs, valid) = compare_conf(old_conf, new_conf);
        if !valid {
            error!(
                "config change of cluster({}) is invalid: listen address may not change \
                 ({} -> {})",
                new_conf.name, old_conf.listen_addr, new_conf.listen_addr
            );
            continue;
        }
        if differs {
            let mut conf = new_conf.clone();
            conf.id = old_conf.id;
            changed.push(conf);
        }
    }

    (changed, new_add)
}

/// Compare two configs for the same cluster name.
///
/// `valid` is false when the listen address moved. `differs` is true
/// when any forwarder-relevant field or the server set (order
/// insensitive) differs.
fn compare_conf(old_conf: &ClusterConfig, new_conf: &ClusterConfig) -> (bool, bool) {
    let valid = old_conf.listen_addr == new_conf.listen_addr;

    if old_conf.hash_method != new_conf.hash_method
        || old_conf.hash_distribution != new_conf.hash_distribution
        || old_conf.hash_tag != new_conf.hash_tag
        || old_conf.cache_type != new_conf.cache_type
        || old_conf.listen_proto != new_conf.listen_proto
        || old_conf.redis_auth != new_conf.redis_auth
        || old_conf.dial_timeout_ms != new_conf.dial_timeout_ms
        || old_conf.read_timeout_ms != new_conf.read_timeout_ms
        || old_conf.write_timeout_ms != new_conf.write_timeout_ms
        || old_conf.node_connections != new_conf.node_connections
        || old_conf.ping_fail_limit != new_conf.ping_fail_limit
        || old_conf.ping_auto_eject != new_conf.ping_auto_eject
        || old_conf.close_when_change != new_conf.close_when_change
    {
        return (true, valid);
    }

    if old_conf.servers.len() != new_conf.servers.len() {
        return (true, valid);
    }
    let mut old_servers = old_conf.servers.clone();
    let mut new_servers = new_conf.servers.clone();
    old_servers.sort_unstable();
    new_servers.sort_unstable();
    (old_servers != new_servers, valid)
}
