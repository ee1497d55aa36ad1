//! Resolving a step's user against the container's own account database.

use crate::rootpath::resolve_in_root;
use crate::RuntimeError;
use kiln_schema::{IdRef, UserSpec};
use std::path::Path;
use tracing::debug;

/// Numeric identity the sandboxed process runs as.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
}

struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
}

struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

fn read_db(rootfs: &Path, path: &str) -> Result<String, RuntimeError> {
    let host = resolve_in_root(rootfs, path)?;
    match std::fs::read_to_string(&host) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{path} not present in rootfs, treating as empty");
            Ok(String::new())
        }
        Err(e) => Err(RuntimeError::Io(e)),
    }
}

fn records(content: &str) -> impl Iterator<Item = Vec<&str>> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.split(':').collect())
}

fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    records(content)
        .filter_map(|f| {
            Some(PasswdEntry {
                name: (*f.first()?).to_owned(),
                uid: f.get(2)?.parse().ok()?,
                gid: f.get(3)?.parse().ok()?,
            })
        })
        .collect()
}

fn parse_group(content: &str) -> Vec<GroupEntry> {
    records(content)
        .filter_map(|f| {
            Some(GroupEntry {
                name: (*f.first()?).to_owned(),
                gid: f.get(2)?.parse().ok()?,
                members: f
                    .get(3)
                    .map(|m| {
                        m.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_owned)
                            .collect()
                    })
                    .unwrap_or_default(),
            })
        })
        .collect()
}

/// Look up `user` in `<rootfs>/etc/passwd` and `<rootfs>/etc/group`.
///
/// A numeric uid need not exist in passwd; it then runs with gid 0 and no
/// supplementary groups. Supplementary groups are only collected when the
/// spec names no explicit group.
pub fn resolve_identity(rootfs: &Path, user: &UserSpec) -> Result<Identity, RuntimeError> {
    let passwd = parse_passwd(&read_db(rootfs, "/etc/passwd")?);

    let entry = match &user.user {
        IdRef::Id(uid) => passwd.iter().find(|e| e.uid == *uid),
        IdRef::Name(name) => Some(
            passwd
                .iter()
                .find(|e| &e.name == name)
                .ok_or_else(|| RuntimeError::UserNotFound(name.clone()))?,
        ),
    };

    let (uid, mut gid, login) = match (&user.user, entry) {
        (_, Some(e)) => (e.uid, e.gid, Some(e.name.as_str())),
        (IdRef::Id(uid), None) => (*uid, 0, None),
        (IdRef::Name(name), None) => return Err(RuntimeError::UserNotFound(name.clone())),
    };

    let needs_groups = matches!(user.group, Some(IdRef::Name(_)))
        || (user.group.is_none() && login.is_some());
    let groups = if needs_groups {
        parse_group(&read_db(rootfs, "/etc/group")?)
    } else {
        Vec::new()
    };

    let mut additional_gids = Vec::new();
    match &user.group {
        Some(IdRef::Id(g)) => gid = *g,
        Some(IdRef::Name(name)) => {
            gid = groups
                .iter()
                .find(|g| &g.name == name)
                .map(|g| g.gid)
                .ok_or_else(|| RuntimeError::GroupNotFound(name.clone()))?;
        }
        None => {
            if let Some(login) = login {
                for group in groups.iter().filter(|g| g.members.iter().any(|m| m == login)) {
                    if group.gid != gid && !additional_gids.contains(&group.gid) {
                        additional_gids.push(group.gid);
                    }
                }
            }
        }
    }

    Ok(Identity {
        uid,
        gid,
        additional_gids,
    })
}
