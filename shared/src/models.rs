use std::collections::BTreeMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub type PrincipalId = String;

/// Default shoulder used when minting group identifiers.
pub const DEF_GROUPS_SHOULDER: &str = "grp0";

/// Default shoulder used when minting people identifiers.
pub const DEF_PEOPLE_SHOULDER: &str = "ppl0";

/// All users are implicitly members of this group.
pub const PUBLIC_GROUP: &str = "grp0:public";

/// Identity used when no authenticated user is attached to a request.
pub const ANONYMOUS: &str = "anonymous";

/// Internal identity the service uses when writing publication copies.
pub const AUTOADMIN: &str = "_autoadmin";

bitflags! {
    /// A mask of record permissions.  Authorization checks AND over the
    /// set bits; record selection ORs over them.
    #[derive(Default, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Permissions: u8 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const ADMIN  = 1 << 2;
        const DELETE = 1 << 3;
        // a custom (non-base) permission held by publishing agents
        const PUBLISH = 1 << 4;

        const OWN = Self::READ.bits() | Self::WRITE.bits()
                  | Self::ADMIN.bits() | Self::DELETE.bits();
    }
}

impl Permissions {
    /// The four base permissions in their canonical order.
    pub const BASE: [Permissions; 4] = [
        Permissions::READ,
        Permissions::WRITE,
        Permissions::ADMIN,
        Permissions::DELETE,
    ];

    /// The ACL key this single permission is stored under.
    pub fn name(self) -> &'static str {
        match self {
            Permissions::READ => "read",
            Permissions::WRITE => "write",
            Permissions::ADMIN => "admin",
            Permissions::DELETE => "delete",
            Permissions::PUBLISH => "publish",
            _ => "own",
        }
    }

    /// Look up a single permission by its ACL key.
    pub fn from_acl_key(name: &str) -> Option<Permissions> {
        match name {
            "read" => Some(Permissions::READ),
            "write" => Some(Permissions::WRITE),
            "admin" => Some(Permissions::ADMIN),
            "delete" => Some(Permissions::DELETE),
            "publish" => Some(Permissions::PUBLISH),
            "own" => Some(Permissions::OWN),
            _ => None,
        }
    }

    /// Every individual permission, base and custom.
    const ALL_PERMS: [Permissions; 5] = [
        Permissions::READ,
        Permissions::WRITE,
        Permissions::ADMIN,
        Permissions::DELETE,
        Permissions::PUBLISH,
    ];

    /// Iterate the individual permissions contained in this mask.
    pub fn each(self) -> impl Iterator<Item = Permissions> {
        Self::ALL_PERMS.into_iter().filter(move |p| self.contains(*p))
    }
}

/// The raw ACL data attached to a record: one principal list per
/// permission name.  A `BTreeMap` keeps the serialized order stable.
pub type AclMap = BTreeMap<String, Vec<PrincipalId>>;

/// Return an ACL map granting every base permission to `owner` alone.
pub fn acls_owned_by(owner: &str) -> AclMap {
    let mut out = AclMap::new();
    for perm in Permissions::BASE {
        out.insert(perm.name().to_string(), vec![owner.to_string()]);
    }
    out
}
