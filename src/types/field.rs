use std::collections::HashMap;
use std::fmt;

/// Interned handle to an offset group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub(crate) usize);

impl GroupId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// How an offset group anchors its field root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupBase {
    /// Byte zero of the packet.
    Packet,
    /// The out-of-band meta-field namespace (protocol, link layer).
    Meta,
    /// Anchored `(read(from, at, length) << shift)` bytes past the root of
    /// `base`. Models variable-length encapsulation: the group starts where
    /// a preceding header's length field says it does.
    Derived {
        base: GroupId,
        from: GroupId,
        at: u16,
        length: u8,
        shift: u8,
    },
}

/// A named byte-offset namespace for field access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetGroup {
    pub name: String,
    pub base: GroupBase,
}

/// The offset-group registry. Groups are interned by name; two field
/// accesses are only comparable or mergeable if they resolve to the same
/// group. Lives on the `CompilationContext` and is dropped with it.
#[derive(Debug)]
pub struct OffsetGroups {
    groups: Vec<OffsetGroup>,
    names: HashMap<String, GroupId>,
}

impl OffsetGroups {
    /// The packet-base group, present in every registry.
    pub const PACKET: GroupId = GroupId(0);
    /// The meta-field group, present in every registry.
    pub const META: GroupId = GroupId(1);

    #[must_use]
    pub fn new() -> Self {
        let mut reg = OffsetGroups {
            groups: Vec::new(),
            names: HashMap::new(),
        };
        reg.intern("packet", GroupBase::Packet);
        reg.intern("meta", GroupBase::Meta);
        reg
    }

    /// Register a group, returning its id. Re-registering a name returns the
    /// existing id; the original definition wins.
    pub fn intern(&mut self, name: &str, base: GroupBase) -> GroupId {
        if let Some(&id) = self.names.get(name) {
            return id;
        }
        let id = GroupId(self.groups.len());
        self.groups.push(OffsetGroup {
            name: name.to_owned(),
            base,
        });
        self.names.insert(name.to_owned(), id);
        id
    }

    /// Register an anonymous derived group, reusing an existing group with
    /// the same definition if one exists.
    pub fn intern_derived(&mut self, base: GroupBase) -> GroupId {
        if let Some(pos) = self.groups.iter().position(|g| g.base == base) {
            return GroupId(pos);
        }
        let name = format!("derived{}", self.groups.len());
        self.intern(&name, base)
    }

    #[must_use]
    pub fn get(&self, id: GroupId) -> &OffsetGroup {
        &self.groups[id.0]
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<GroupId> {
        self.names.get(name).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (GroupId, &OffsetGroup)> {
        self.groups.iter().enumerate().map(|(i, g)| (GroupId(i), g))
    }
}

impl Default for OffsetGroups {
    fn default() -> Self {
        Self::new()
    }
}

/// A concrete byte-range accessor: `length` bytes at `offset` within an
/// offset group, read big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldRef {
    pub group: GroupId,
    pub offset: u16,
    pub length: u8,
}

impl FieldRef {
    #[must_use]
    pub fn new(group: GroupId, offset: u16, length: u8) -> FieldRef {
        FieldRef {
            group,
            offset,
            length,
        }
    }

    /// Number of bits covered by this field.
    #[must_use]
    pub fn bits(&self) -> u32 {
        u32::from(self.length) * 8
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group.0, self.offset, self.length)
    }
}

/// Reserved meta fields. These are pseudo-matches: the hardware backend
/// compiles them as an outer dispatch and refuses to mix them with ordinary
/// field matches in one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaField {
    /// Link-level protocol identifier (e.g. 0x0800 for IPv4).
    Protocol,
    /// Link-layer kind of the attached device.
    LinkLayer,
}

impl MetaField {
    /// Byte layout of the meta group: protocol at 0..2, link layer at 2..4.
    #[must_use]
    pub fn field_ref(self) -> FieldRef {
        match self {
            MetaField::Protocol => FieldRef::new(OffsetGroups::META, 0, 2),
            MetaField::LinkLayer => FieldRef::new(OffsetGroups::META, 2, 2),
        }
    }
}

/// Ethernet protocol identifier for IPv4.
pub const PROTO_IPV4: u32 = 0x0800;
/// Ethernet protocol identifier for IPv6.
pub const PROTO_IPV6: u32 = 0x86dd;
