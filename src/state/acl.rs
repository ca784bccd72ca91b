use std::collections::HashMap;

use crate::mumble_proto;

/// The ACL view of one channel. Populated only in response to an explicit
/// query and replaced wholesale on each response.
#[derive(Debug, Clone, Default)]
pub struct AclView {
    pub inherit_acls: bool,
    pub groups: HashMap<String, AclGroup>,
    pub entries: Vec<AclEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct AclGroup {
    pub name: String,
    pub inherited: bool,
    pub inherit: bool,
    pub inheritable: bool,
    pub add: Vec<u32>,
    pub remove: Vec<u32>,
    pub inherited_members: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct AclEntry {
    pub apply_here: bool,
    pub apply_subs: bool,
    pub inherited: bool,
    pub user_id: Option<u32>,
    pub group: Option<String>,
    pub grant: u32,
    pub deny: u32,
}

impl AclView {
    pub fn from_packet(packet: &mumble_proto::Acl) -> AclView {
        AclView {
            inherit_acls: packet.inherit_acls(),
            groups: packet
                .groups
                .iter()
                .map(|g| {
                    (
                        g.name.clone(),
                        AclGroup {
                            name: g.name.clone(),
                            inherited: g.inherited(),
                            inherit: g.inherit(),
                            inheritable: g.inheritable(),
                            add: g.add.clone(),
                            remove: g.remove.clone(),
                            inherited_members: g.inherited_members.clone(),
                        },
                    )
                })
                .collect(),
            entries: packet
                .acls
                .iter()
                .map(|a| AclEntry {
                    apply_here: a.apply_here(),
                    apply_subs: a.apply_subs(),
                    inherited: a.inherited(),
                    user_id: a.user_id,
                    group: a.group.clone(),
                    grant: a.grant(),
                    deny: a.deny(),
                })
                .collect(),
        }
    }
}
